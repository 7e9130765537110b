//! Frame serialisation: contiguous and sparse-directory backings for a
//! [`SuperChunk`].
//!
//! Grounded on `blosc::frame`/`blosc::sframe` for the overall
//! `HEADER ‖ PAYLOAD ‖ OFFSETS_CHUNK ‖ TRAILER` shape and the sparse
//! per-chunk-file layout, rewritten against hand-rolled msgpack-style bytes
//! instead of raw-pointer byte patching.
//!
//! Simplification (see [`crate::schunk`] module doc and DESIGN.md): this
//! crate always serialises a super-chunk wholesale rather than patching an
//! existing frame buffer in place.
//!
//! Header layout (byte offsets from the start of the frame):
//! `version`@0, `header_len` u32 LE@11, `frame_len` i64 BE@16, `flags`@25,
//! `frame_type`@26, `codecs`@27, `nbytes` i64 BE@30, `cbytes` i64 BE@39,
//! `typesize` i32 LE@48, `blocksize` i32 LE@53, `chunksize` i32 LE@58,
//! `nthreads_compress` u16 LE@63, `nthreads_decompress` u16 LE@66,
//! `has_vlmetalayers`@68, filter-id pipeline (6 bytes)@70, `codec` id@77,
//! `codec_level`@78, filter-meta pipeline (6 bytes)@79, metalayer count@87,
//! metalayer entries follow. Unlabelled gaps are reserved and written as
//! zero.

use crate::chunk::{self, Chunk};
use crate::constants::{FilterId, SpecialKind};
use crate::context::{CParams, DParams};
use crate::error::{Error, ErrorCode, Result};
use crate::filters::FilterStep;
use crate::hooks::{HookEvent, HookSet};
use crate::io::{chunk_file_name, IoCallbacks};
use crate::primitives::{load_be_i64, load_le_i32};
use crate::schunk::{Metalayer, SuperChunk, VlMetalayer};
use std::path::Path;

const TRAILER_MARKER: u8 = 0xCE;
const TRAILER_VERSION: u8 = 1;
const FRAME_TYPE_CONTIGUOUS: u8 = 0;
const FRAME_TYPE_SPARSE: u8 = 1;
const SPARSE_INDEX_FILE: &str = "chunks.b2frame";

fn push_u32_le(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn read_u32_le(bytes: &[u8], off: usize) -> Result<u32> {
    bytes
        .get(off..off + 4)
        .map(|s| u32::from_le_bytes(s.try_into().unwrap()))
        .ok_or_else(|| Error::new(ErrorCode::Corruption, "frame header truncated"))
}

fn read_i64_be(bytes: &[u8], off: usize) -> Result<i64> {
    load_be_i64(bytes, off).ok_or_else(|| Error::new(ErrorCode::Corruption, "frame header truncated"))
}

fn push_blob(out: &mut Vec<u8>, bytes: &[u8]) {
    push_u32_le(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn read_blob<'a>(bytes: &'a [u8], off: &mut usize) -> Result<&'a [u8]> {
    let len = read_u32_le(bytes, *off)? as usize;
    *off += 4;
    let slice = bytes
        .get(*off..*off + len)
        .ok_or_else(|| Error::new(ErrorCode::Corruption, "blob truncated"))?;
    *off += len;
    Ok(slice)
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    out.push(name.len() as u8);
    out.extend_from_slice(name.as_bytes());
}

fn read_name<'a>(bytes: &'a [u8], off: &mut usize) -> Result<&'a str> {
    let len = *bytes
        .get(*off)
        .ok_or_else(|| Error::new(ErrorCode::Corruption, "name truncated"))? as usize;
    *off += 1;
    let slice = bytes
        .get(*off..*off + len)
        .ok_or_else(|| Error::new(ErrorCode::Corruption, "name truncated"))?;
    *off += len;
    std::str::from_utf8(slice).map_err(|_| Error::new(ErrorCode::Corruption, "name not utf8"))
}

/// spec.md §6.2 sign-bit sentinel for special-value offsets-chunk entries.
fn encode_special_offset(kind: SpecialKind) -> i64 {
    let bits: u64 = (1 << 63) | ((kind as u64) << 56);
    bits as i64
}

fn decode_special_offset(v: i64) -> Option<SpecialKind> {
    if v >= 0 {
        return None;
    }
    let bits = v as u64;
    SpecialKind::from_u8(((bits >> 56) & 0x0f) as u8)
}

const FRAME_HEADER_LEN: usize = 11;
const FRAME_LEN: usize = 16;
const FRAME_FLAGS: usize = 25;
const FRAME_TYPE: usize = 26;
const FRAME_CODECS: usize = 27;
const FRAME_NBYTES: usize = 30;
const FRAME_CBYTES: usize = 39;
const FRAME_TYPESIZE: usize = 48;
const FRAME_BLOCKSIZE: usize = 53;
const FRAME_CHUNKSIZE: usize = 58;
const FRAME_NTHREADS_C: usize = 63;
const FRAME_NTHREADS_D: usize = 66;
const FRAME_HAS_VLMETALAYERS: usize = 68;
const FRAME_FILTER_IDS: usize = 70;
const FRAME_CODEC: usize = 77;
const FRAME_CODEC_LEVEL: usize = 78;
const FRAME_FILTER_METAS: usize = 79;
const FRAME_METALAYERS: usize = 87;

fn build_header(schunk: &SuperChunk, frame_type: u8, metalayers: &[Metalayer]) -> Vec<u8> {
    let mut header = vec![0u8; FRAME_METALAYERS];
    header[0] = crate::constants::BLOSC2_VERSION_FORMAT;
    // header_len@11 and frame_len@16 are patched by the caller once the full
    // header (metalayers included) and frame length are known.
    header[FRAME_FLAGS] = 0;
    header[FRAME_TYPE] = frame_type;
    header[FRAME_CODECS] = schunk.cparams.codec as u8;
    header[FRAME_NBYTES..FRAME_NBYTES + 8].copy_from_slice(&(schunk.nbytes() as i64).to_be_bytes());
    header[FRAME_CBYTES..FRAME_CBYTES + 8].copy_from_slice(&(schunk.cbytes().unwrap_or(0) as i64).to_be_bytes());
    header[FRAME_TYPESIZE..FRAME_TYPESIZE + 4].copy_from_slice(&(schunk.cparams.typesize as i32).to_le_bytes());
    header[FRAME_BLOCKSIZE..FRAME_BLOCKSIZE + 4].copy_from_slice(&(schunk.cparams.blocksize as i32).to_le_bytes());
    header[FRAME_CHUNKSIZE..FRAME_CHUNKSIZE + 4].copy_from_slice(&(schunk.chunksize() as i32).to_le_bytes());
    header[FRAME_NTHREADS_C..FRAME_NTHREADS_C + 2].copy_from_slice(&(schunk.cparams.nthreads as u16).to_le_bytes());
    header[FRAME_NTHREADS_D..FRAME_NTHREADS_D + 2]
        .copy_from_slice(&(schunk.dparams.nthreads.max(1) as u16).to_le_bytes());
    header[FRAME_HAS_VLMETALAYERS] = if schunk.vlmetalayers().is_empty() { 0 } else { 1 };
    header[FRAME_CODEC] = schunk.cparams.codec as u8;
    header[FRAME_CODEC_LEVEL] = schunk.cparams.codec_level;
    for (i, step) in schunk.cparams.filter_pipeline.iter().take(6).enumerate() {
        header[FRAME_FILTER_IDS + i] = step.id as u8;
        header[FRAME_FILTER_METAS + i] = step.meta;
    }
    header.push(metalayers.len() as u8);
    for m in metalayers {
        push_name(&mut header, &m.name);
        push_blob(&mut header, &m.bytes);
    }
    header
}

struct ParsedHeader {
    frame_type: u8,
    typesize: usize,
    blocksize: usize,
    chunksize: i64,
    nthreads_compress: usize,
    nthreads_decompress: usize,
    codec: crate::constants::CodecId,
    codec_level: u8,
    filter_pipeline: Vec<FilterStep>,
    metalayers: Vec<Metalayer>,
    header_len: usize,
}

fn parse_header(bytes: &[u8]) -> Result<ParsedHeader> {
    if bytes.len() < FRAME_METALAYERS + 1 {
        return Err(Error::new(ErrorCode::InvalidHeader, "frame header too short"));
    }
    let header_len = read_u32_le(bytes, FRAME_HEADER_LEN)? as usize;
    let _frame_len = read_i64_be(bytes, FRAME_LEN)?;
    let frame_type = bytes[FRAME_TYPE];
    let blocksize = load_le_i32(bytes, FRAME_BLOCKSIZE)
        .ok_or_else(|| Error::new(ErrorCode::InvalidHeader, "bad blocksize"))? as usize;
    let typesize = load_le_i32(bytes, FRAME_TYPESIZE)
        .ok_or_else(|| Error::new(ErrorCode::InvalidHeader, "bad typesize"))? as usize;
    let chunksize = load_le_i32(bytes, FRAME_CHUNKSIZE)
        .ok_or_else(|| Error::new(ErrorCode::InvalidHeader, "bad chunksize"))? as i64;
    let _nbytes = read_i64_be(bytes, FRAME_NBYTES)?;
    let _cbytes = read_i64_be(bytes, FRAME_CBYTES)?;
    let nthreads_compress = u16::from_le_bytes(bytes[FRAME_NTHREADS_C..FRAME_NTHREADS_C + 2].try_into().unwrap()) as usize;
    let nthreads_decompress = u16::from_le_bytes(bytes[FRAME_NTHREADS_D..FRAME_NTHREADS_D + 2].try_into().unwrap()) as usize;
    let _has_vlmeta = bytes[FRAME_HAS_VLMETALAYERS];
    let codec = crate::constants::CodecId::from_u8(bytes[FRAME_CODEC])
        .ok_or_else(|| Error::new(ErrorCode::InvalidHeader, "unknown codec id"))?;
    let codec_level = bytes[FRAME_CODEC_LEVEL];
    let ids = &bytes[FRAME_FILTER_IDS..FRAME_FILTER_IDS + 6];
    let metas = &bytes[FRAME_FILTER_METAS..FRAME_FILTER_METAS + 6];
    let mut filter_pipeline = Vec::new();
    for i in 0..6 {
        if let Some(id) = FilterId::from_u8(ids[i]) {
            if id != FilterId::NoFilter {
                filter_pipeline.push(FilterStep { id, meta: metas[i] });
            }
        }
    }
    let nmetalayers = bytes[FRAME_METALAYERS] as usize;
    let mut off = FRAME_METALAYERS + 1;
    let mut metalayers = Vec::with_capacity(nmetalayers);
    for _ in 0..nmetalayers {
        let name = read_name(bytes, &mut off)?.to_string();
        let blob = read_blob(bytes, &mut off)?.to_vec();
        metalayers.push(Metalayer { name, bytes: blob });
    }
    if off != header_len {
        return Err(Error::new(ErrorCode::InvalidHeader, "header_len mismatch"));
    }
    Ok(ParsedHeader {
        frame_type,
        typesize,
        blocksize,
        chunksize,
        nthreads_compress,
        nthreads_decompress,
        codec,
        codec_level,
        filter_pipeline,
        metalayers,
        header_len,
    })
}

fn build_trailer(schunk: &SuperChunk) -> Vec<u8> {
    let mut body = Vec::new();
    body.push(TRAILER_VERSION);
    body.push(schunk.vlmetalayers().len() as u8);
    for m in schunk.vlmetalayers() {
        push_name(&mut body, &m.name);
        push_blob(&mut body, m.compressed.as_bytes());
    }
    match schunk.usermeta_raw() {
        Some(bytes) => {
            body.push(1);
            push_blob(&mut body, bytes);
        }
        None => body.push(0),
    }
    body.extend_from_slice(&[0u8; 16]); // reserved fingerprint area
    let mut trailer = body;
    let trailer_len = (trailer.len() + 5) as u32;
    trailer.push(TRAILER_MARKER);
    push_u32_le(&mut trailer, trailer_len);
    trailer
}

struct ParsedTrailer {
    vlmetalayers: Vec<VlMetalayer>,
    usermeta: Option<Vec<u8>>,
}

fn parse_trailer(bytes: &[u8]) -> Result<ParsedTrailer> {
    if bytes.len() < 5 {
        return Err(Error::new(ErrorCode::Corruption, "trailer too short"));
    }
    let trailer_len = read_u32_le(bytes, bytes.len() - 4)? as usize;
    if trailer_len != bytes.len() || bytes[bytes.len() - 5] != TRAILER_MARKER {
        return Err(Error::new(ErrorCode::Corruption, "trailer marker/length mismatch"));
    }
    let mut off = 0usize;
    let version = bytes[off];
    off += 1;
    if version != TRAILER_VERSION {
        return Err(Error::new(ErrorCode::FormatVersionUnsupported, "unsupported trailer version"));
    }
    let nvlmeta = bytes[off] as usize;
    off += 1;
    let mut vlmetalayers = Vec::with_capacity(nvlmeta);
    for _ in 0..nvlmeta {
        let name = read_name(bytes, &mut off)?.to_string();
        let blob = read_blob(bytes, &mut off)?.to_vec();
        vlmetalayers.push(VlMetalayer { name, compressed: Chunk::from_bytes(blob) });
    }
    let has_usermeta = bytes[off];
    off += 1;
    let usermeta = if has_usermeta == 1 {
        Some(read_blob(bytes, &mut off)?.to_vec())
    } else {
        None
    };
    Ok(ParsedTrailer { vlmetalayers, usermeta })
}

/// spec.md §4.2/§6.2: serialise a super-chunk into a contiguous frame byte
/// string `HEADER ‖ CHUNK_PAYLOADS ‖ OFFSETS_CHUNK ‖ TRAILER`.
pub fn to_cframe(schunk: &SuperChunk) -> Result<Vec<u8>> {
    let metalayers = schunk.metalayers().to_vec();
    let mut header = build_header(schunk, FRAME_TYPE_CONTIGUOUS, &metalayers);

    let mut payloads = Vec::new();
    let mut offsets = Vec::with_capacity(schunk.entries().len());
    for chunk in schunk.entries() {
        let chunk = chunk.materialize()?;
        if chunk.is_special() && chunk.special_kind() != SpecialKind::Value {
            offsets.push(encode_special_offset(chunk.special_kind()));
        } else {
            offsets.push(payloads.len() as i64);
            payloads.extend_from_slice(chunk.as_bytes());
        }
    }

    let offset_bytes: Vec<u8> = offsets.iter().flat_map(|v| v.to_le_bytes()).collect();
    let offsets_cparams = CParams { typesize: 8, ..schunk.cparams.clone() };
    let offsets_chunk = chunk::compress(&offsets_cparams, &offset_bytes)?;

    let trailer = build_trailer(schunk);

    let header_len = header.len() as u32;
    header[FRAME_HEADER_LEN..FRAME_HEADER_LEN + 4].copy_from_slice(&header_len.to_le_bytes());
    let frame_len = (header.len() + payloads.len() + offsets_chunk.cbytes() + trailer.len()) as i64;
    header[FRAME_LEN..FRAME_LEN + 8].copy_from_slice(&frame_len.to_be_bytes());

    let mut out = Vec::with_capacity(frame_len as usize);
    out.extend_from_slice(&header);
    out.extend_from_slice(&payloads);
    out.extend_from_slice(offsets_chunk.as_bytes());
    out.extend_from_slice(&trailer);

    let hooks = HookSet::new();
    hooks.fire(HookEvent::FrameSerialize { nchunks: schunk.nchunks(), frame_len });
    Ok(out)
}

fn rebuild_schunk(
    parsed: ParsedHeader,
    trailer: ParsedTrailer,
    offsets: Vec<i64>,
    resolve_entry: impl Fn(usize, i64) -> Result<Chunk>,
) -> Result<SuperChunk> {
    let cparams = CParams {
        codec: parsed.codec,
        codec_level: parsed.codec_level,
        use_dict: false,
        typesize: parsed.typesize,
        nthreads: parsed.nthreads_compress.max(1),
        blocksize: parsed.blocksize,
        filter_pipeline: parsed.filter_pipeline,
        splitmode: Default::default(),
        checksum: false,
        tuner_id: None,
    };
    let dparams = DParams { nthreads: parsed.nthreads_decompress.max(1) };

    let mut entries = Vec::with_capacity(offsets.len());
    for (i, off) in offsets.iter().enumerate() {
        entries.push(resolve_entry(i, *off)?);
    }

    Ok(SuperChunk::from_parts(
        cparams,
        dparams,
        parsed.chunksize,
        entries,
        parsed.metalayers,
        trailer.vlmetalayers,
        trailer.usermeta,
    ))
}

/// Synthesises the chunk for a sign-bit-encoded special offset, assuming the
/// uniform `fill_special` layout (every slot but the last is exactly
/// `chunksize` bytes, spec.md §4.2 `fill_special`).
fn synth_special_entry(kind: SpecialKind, slot: usize, nslots: usize, chunksize: i64, total_nbytes: i64, typesize: usize) -> Result<Chunk> {
    let nbytes = if slot + 1 == nslots {
        (total_nbytes - chunksize * (nslots as i64 - 1)).max(0) as usize
    } else {
        chunksize as usize
    };
    chunk::make_special(kind, nbytes, typesize.max(1), chunksize.max(1) as usize, None)
}

/// spec.md §4.2/§6.2: the inverse of [`to_cframe`].
pub fn from_cframe(bytes: &[u8]) -> Result<SuperChunk> {
    let parsed = parse_header(bytes)?;
    let payload_start = parsed.header_len;
    let frame_len = read_i64_be(bytes, FRAME_LEN)? as usize;
    if bytes.len() < frame_len {
        return Err(Error::new(ErrorCode::Corruption, "frame buffer shorter than frame_len"));
    }
    let trailer_len = read_u32_le(bytes, frame_len - 4)? as usize;
    let trailer_start = frame_len - trailer_len;
    let trailer_bytes = &bytes[trailer_start..frame_len];
    let trailer = parse_trailer(trailer_bytes)?;

    // The offsets chunk occupies the span right before the trailer; scan
    // backwards from its header's own `cbytes` field (mirrors how the
    // teacher locates `OFFSETS_CHUNK` without a dedicated length field).
    let offsets_chunk_cbytes = find_offsets_chunk_len(bytes, payload_start, trailer_start)?;
    let offsets_chunk_start = trailer_start - offsets_chunk_cbytes;
    let offsets_chunk = Chunk::from_bytes(bytes[offsets_chunk_start..trailer_start].to_vec());
    let offsets_bytes = chunk::decompress_alloc(&offsets_chunk)?;
    let offsets: Vec<i64> = offsets_bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect();

    let total_nbytes = read_i64_be(bytes, FRAME_NBYTES)?;
    let chunksize = parsed.chunksize;
    let typesize = parsed.typesize;
    let nslots = offsets.len();

    let rebuilt = rebuild_schunk(parsed, trailer, offsets.clone(), |i, off| {
        if let Some(kind) = decode_special_offset(off) {
            synth_special_entry(kind, i, nslots, chunksize, total_nbytes, typesize)
        } else {
            let start = payload_start + off as usize;
            let cbytes = load_le_i32(bytes, start + 12)
                .ok_or_else(|| Error::new(ErrorCode::Corruption, "bad chunk cbytes"))? as usize;
            let end = start + cbytes;
            if end > offsets_chunk_start {
                return Err(Error::new(ErrorCode::Corruption, "chunk payload overruns frame body"));
            }
            Ok(Chunk::from_bytes(bytes[start..end].to_vec()))
        }
    })?;
    Ok(rebuilt)
}

/// The offsets chunk has no length prefix of its own in the byte stream, so
/// its `cbytes` is read straight out of its own embedded header once we know
/// where it starts. Since every preceding byte belongs to chunk payloads
/// whose own headers are self-describing, the offsets chunk is located by
/// walking payloads from `payload_start` until the remaining span equals
/// exactly one chunk header's declared `cbytes`.
fn find_offsets_chunk_len(bytes: &[u8], payload_start: usize, trailer_start: usize) -> Result<usize> {
    let mut pos = payload_start;
    loop {
        if pos + chunk::HEADER_LEN > trailer_start {
            return Err(Error::new(ErrorCode::Corruption, "offsets chunk not found"));
        }
        let cbytes = load_le_i32(bytes, pos + 12)
            .ok_or_else(|| Error::new(ErrorCode::Corruption, "bad chunk cbytes while scanning"))? as usize;
        if pos + cbytes == trailer_start {
            return Ok(cbytes);
        }
        pos += cbytes;
    }
}

/// spec.md §4.2: writes a contiguous frame file through the I/O plugin.
pub fn save_contiguous(schunk: &SuperChunk, path: &Path, io: &dyn IoCallbacks) -> Result<()> {
    let bytes = to_cframe(schunk)?;
    let mut handle = io.open(path, true)?;
    handle.truncate(0)?;
    handle.write(&bytes)?;
    Ok(())
}

/// spec.md §4.2: reads a contiguous frame file through the I/O plugin.
pub fn load_contiguous(path: &Path, io: &dyn IoCallbacks) -> Result<SuperChunk> {
    let mut handle = io.open(path, false)?;
    let size = handle.size()? as usize;
    let mut buf = vec![0u8; size];
    let mut read = 0;
    while read < size {
        let n = handle.read(&mut buf[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    buf.truncate(read);
    from_cframe(&buf)
}

/// spec.md §4.2/§6.2: writes a sparse-directory frame — one file per chunk
/// plus `chunks.b2frame` holding `HEADER ‖ OFFSETS_CHUNK ‖ TRAILER` with
/// `frame_type = 1`. Offset-index entries encode the chunk id rather than a
/// byte offset.
pub fn save_sparse(schunk: &SuperChunk, dir: &Path, io: &dyn IoCallbacks) -> Result<()> {
    io.create_dir_all(dir)?;
    let metalayers = schunk.metalayers().to_vec();
    let mut header = build_header(schunk, FRAME_TYPE_SPARSE, &metalayers);

    let mut offsets = Vec::with_capacity(schunk.entries().len());
    for (i, chunk) in schunk.entries().iter().enumerate() {
        let chunk = chunk.materialize()?;
        if chunk.is_special() && chunk.special_kind() != SpecialKind::Value {
            offsets.push(encode_special_offset(chunk.special_kind()));
        } else {
            offsets.push(i as i64);
            let path = chunk_file_name(dir, i as i64);
            let mut handle = io.open(&path, true)?;
            handle.truncate(0)?;
            handle.write(chunk.as_bytes())?;
        }
    }

    let offset_bytes: Vec<u8> = offsets.iter().flat_map(|v| v.to_le_bytes()).collect();
    let offsets_cparams = CParams { typesize: 8, ..schunk.cparams.clone() };
    let offsets_chunk = chunk::compress(&offsets_cparams, &offset_bytes)?;
    let trailer = build_trailer(schunk);

    let header_len = header.len() as u32;
    header[FRAME_HEADER_LEN..FRAME_HEADER_LEN + 4].copy_from_slice(&header_len.to_le_bytes());
    let frame_len = (header.len() + offsets_chunk.cbytes() + trailer.len()) as i64;
    header[FRAME_LEN..FRAME_LEN + 8].copy_from_slice(&frame_len.to_be_bytes());

    let mut index = Vec::with_capacity(frame_len as usize);
    index.extend_from_slice(&header);
    index.extend_from_slice(offsets_chunk.as_bytes());
    index.extend_from_slice(&trailer);

    let index_path = dir.join(SPARSE_INDEX_FILE);
    let mut handle = io.open(&index_path, true)?;
    handle.truncate(0)?;
    handle.write(&index)?;
    Ok(())
}

/// spec.md §4.1/§4.2: reads a sparse-directory frame lazily — chunk payload
/// files are not read until [`crate::schunk::SuperChunk::get_chunk`] or
/// `decompress_chunk` resolves that slot.
pub fn load_sparse(dir: &Path, io: &dyn IoCallbacks) -> Result<SuperChunk> {
    let index_path = dir.join(SPARSE_INDEX_FILE);
    let mut handle = io.open(&index_path, false)?;
    let size = handle.size()? as usize;
    let mut index = vec![0u8; size];
    let mut read = 0;
    while read < size {
        let n = handle.read(&mut index[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    index.truncate(read);

    let parsed = parse_header(&index)?;
    if parsed.frame_type != FRAME_TYPE_SPARSE {
        return Err(Error::new(ErrorCode::FrameType, "expected a sparse frame index"));
    }
    let frame_len = read_i64_be(&index, FRAME_LEN)? as usize;
    let trailer_len = read_u32_le(&index, frame_len - 4)? as usize;
    let trailer_start = frame_len - trailer_len;
    let trailer = parse_trailer(&index[trailer_start..frame_len])?;
    let offsets_chunk_start = parsed.header_len;
    let offsets_chunk = Chunk::from_bytes(index[offsets_chunk_start..trailer_start].to_vec());
    let offsets_bytes = chunk::decompress_alloc(&offsets_chunk)?;
    let offsets: Vec<i64> = offsets_bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect();

    let total_nbytes = read_i64_be(&index, FRAME_NBYTES)?;
    let chunksize = parsed.chunksize;
    let typesize = parsed.typesize;
    let nslots = offsets.len();

    rebuild_schunk(parsed, trailer, offsets.clone(), |i, off| {
        if let Some(kind) = decode_special_offset(off) {
            synth_special_entry(kind, i, nslots, chunksize, total_nbytes, typesize)
        } else {
            let path = chunk_file_name(dir, off);
            if !io.exists(&path) {
                return Err(Error::new(ErrorCode::NotFound, "sparse chunk file missing"));
            }
            let mut handle = io.open(&path, false)?;
            let mut header_bytes = vec![0u8; chunk::HEADER_LEN];
            let n = handle.read(&mut header_bytes)?;
            if n < chunk::HEADER_LEN {
                return Err(Error::new(ErrorCode::Corruption, "sparse chunk file shorter than header"));
            }
            let header_only = Chunk::Lazy { header: header_bytes.clone(), block_offsets: Vec::new(), source: path.clone() };
            // Pull the (small, fixed-size) block-offset table too, so a lazy
            // chunk answers block-boundary queries without a full file read.
            // Special/memcpyed chunks have no such table.
            let block_offsets = if header_only.is_special() || header_only.is_memcpyed() {
                Vec::new()
            } else {
                let nblocks = header_only.nblocks();
                let mut table = vec![0u8; nblocks * 4];
                let n = handle.read(&mut table)?;
                if n < table.len() {
                    return Err(Error::new(ErrorCode::Corruption, "sparse chunk file shorter than block offset table"));
                }
                table
            };
            Ok(Chunk::Lazy { header: header_bytes, block_offsets, source: path })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{CParams, Context, DParams};
    use crate::io::StdFileIo;

    fn temp_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("bchunk-frame-test-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn s3_contiguous_round_trip_preserves_chunk_seven() {
        let cparams = CParams { typesize: 1, ..CParams::default() };
        let mut s = SuperChunk::new(cparams, DParams::default());
        for i in 0..10u8 {
            s.append(&vec![i; 64 * 1024]).unwrap();
        }
        let bytes = to_cframe(&s).unwrap();
        let restored = from_cframe(&bytes).unwrap();
        assert_eq!(restored.nchunks(), 10);
        let mut ctx = Context::for_decompression(DParams::default());
        let mut dst = vec![0u8; 64 * 1024];
        restored.decompress_chunk(7, &mut dst, &mut ctx).unwrap();
        assert!(dst.iter().all(|&b| b == 7));
    }

    #[test]
    fn p5_round_trip_preserves_metalayers_and_vlmetalayers() {
        let cparams = CParams { typesize: 1, ..CParams::default() };
        let mut s = SuperChunk::new(cparams, DParams::default());
        s.meta_add("caterva", vec![1, 2, 3, 4]).unwrap();
        s.append(&vec![9u8; 16]).unwrap();
        s.vlmeta_add("notes", b"hello world").unwrap();
        s.usermeta_update(b"usermeta blob").unwrap();

        let bytes = to_cframe(&s).unwrap();
        let restored = from_cframe(&bytes).unwrap();
        assert_eq!(restored.meta_get("caterva"), Some(&[1, 2, 3, 4][..]));
        assert_eq!(restored.vlmeta_get("notes").unwrap().unwrap(), b"hello world");
        assert_eq!(restored.usermeta().unwrap().unwrap(), b"usermeta blob");
    }

    #[test]
    fn s5_special_zero_chunks_round_trip_with_no_payload_bytes() {
        let cparams = CParams { typesize: 1, ..CParams::default() };
        let mut s = SuperChunk::new(cparams, DParams::default());
        s.fill_special(4096, SpecialKind::Zero, 1024).unwrap();
        let bytes = to_cframe(&s).unwrap();
        let restored = from_cframe(&bytes).unwrap();
        assert_eq!(restored.nchunks(), 4);
        assert_eq!(restored.cbytes().unwrap(), 0);
        let mut ctx = Context::for_decompression(DParams::default());
        let mut dst = vec![0u8; 1024];
        restored.decompress_chunk(2, &mut dst, &mut ctx).unwrap();
        assert!(dst.iter().all(|&b| b == 0));
    }

    #[test]
    fn sparse_round_trip_is_lazy_until_resolved() {
        let dir = temp_dir("sparse");
        let cparams = CParams { typesize: 1, ..CParams::default() };
        let mut s = SuperChunk::new(cparams, DParams::default());
        for i in 0..3u8 {
            s.append(&vec![i; 4096]).unwrap();
        }
        let io = StdFileIo;
        save_sparse(&s, &dir, &io).unwrap();
        let restored = load_sparse(&dir, &io).unwrap();
        assert_eq!(restored.nchunks(), 3);

        let lazy = restored.get_lazy_chunk(1).unwrap();
        let chunk = lazy.materialize().unwrap();
        let out = chunk::decompress_alloc(&chunk).unwrap();
        assert!(out.iter().all(|&b| b == 1));

        std::fs::remove_dir_all(&dir).ok();
    }
}
