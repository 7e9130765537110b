//! Chunk-codec round-trip scenarios (spec.md §8 S1, S2 and P1/P6/P7 at the
//! integration level — unit-level coverage of the same properties lives in
//! `src/chunk.rs`'s own `#[cfg(test)]` module; this file exercises the
//! public crate surface the way a dependent crate would).

use blusc::chunk;
use blusc::constants::{CodecId, FilterId};
use blusc::context::CParams;
use blusc::filters::FilterStep;

fn shuffled_i32_cparams() -> CParams {
    CParams {
        codec: CodecId::BloscLz,
        codec_level: 5,
        typesize: 4,
        filter_pipeline: vec![FilterStep { id: FilterId::Shuffle, meta: 0 }],
        ..CParams::default()
    }
}

#[test]
fn s1_million_i32_sequence_compresses_and_roundtrips() {
    let src: Vec<u8> = (0..1_000_000u32).flat_map(|v| v.to_le_bytes()).collect();
    let chunk = chunk::compress(&shuffled_i32_cparams(), &src).unwrap();
    assert!(chunk.cbytes() < 4_000_000, "cbytes was {}", chunk.cbytes());

    let mut dst = vec![0u8; src.len()];
    let n = chunk::decompress(&chunk, &mut dst).unwrap();
    assert_eq!(n, src.len());
    assert_eq!(dst, src);
}

#[test]
fn s2_truncated_chunk_is_rejected_by_validate() {
    let src: Vec<u8> = (0..1_000_000u32).flat_map(|v| v.to_le_bytes()).collect();
    let chunk = chunk::compress(&shuffled_i32_cparams(), &src).unwrap();
    let mut bytes = chunk.into_bytes();
    bytes.pop();
    assert!(chunk::validate(&bytes).is_err());
}

#[test]
fn p1_roundtrips_for_every_filter_and_typesize_combination() {
    for &typesize in &[1usize, 2, 4, 8] {
        for filter in [FilterId::NoFilter, FilterId::Shuffle, FilterId::BitShuffle, FilterId::Delta] {
            let nitems = 257; // deliberately not block-aligned
            let src: Vec<u8> = (0..nitems * typesize).map(|i| (i % 251) as u8).collect();
            let cparams = CParams {
                typesize,
                filter_pipeline: if filter == FilterId::NoFilter {
                    vec![]
                } else {
                    vec![FilterStep { id: filter, meta: 0 }]
                },
                ..CParams::default()
            };
            let chunk = chunk::compress(&cparams, &src).unwrap();
            let mut dst = vec![0u8; src.len()];
            chunk::decompress(&chunk, &mut dst).unwrap();
            assert_eq!(dst, src, "typesize={typesize} filter={filter:?}");
        }
    }
}

#[test]
fn p1_roundtrips_across_every_codec() {
    let src: Vec<u8> = (0..4096u32).map(|i| (i / 16) as u8).collect();
    for codec in [CodecId::BloscLz, CodecId::Lz4, CodecId::Snappy, CodecId::Zlib, CodecId::Zstd] {
        let cparams = CParams { codec, typesize: 1, codec_level: 5, ..CParams::default() };
        let chunk = chunk::compress(&cparams, &src).unwrap();
        let mut dst = vec![0u8; src.len()];
        chunk::decompress(&chunk, &mut dst).unwrap();
        assert_eq!(dst, src, "codec={codec:?}");
    }
}

#[test]
fn p7_getitem_matches_a_decompress_then_slice() {
    let src: Vec<u8> = (0..5000u32).flat_map(|v| v.to_le_bytes()).collect();
    let chunk = chunk::compress(&shuffled_i32_cparams(), &src).unwrap();
    let full = chunk::decompress_alloc(&chunk).unwrap();

    let mut dst = vec![0u8; 40 * 4];
    let n = chunk::getitem(&chunk, 100, 40, &mut dst).unwrap();
    assert_eq!(&dst[..n], &full[400..400 + 160]);
}

#[test]
fn empty_buffer_compresses_and_roundtrips_to_zero_bytes() {
    let cparams = CParams::default();
    let chunk = chunk::compress(&cparams, &[]).unwrap();
    assert_eq!(chunk.nbytes(), 0);
    let mut dst: [u8; 0] = [];
    let n = chunk::decompress(&chunk, &mut dst).unwrap();
    assert_eq!(n, 0);
}
