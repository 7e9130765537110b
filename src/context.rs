//! Compression/decompression parameter surfaces and per-call context
//! (spec.md §2 item 6, §4.4, §6.5).
//!
//! Grounded on the teacher's `blosc::context::Blosc2Context`/`blosc2.rs`
//! `Blosc2Cparams`/`Blosc2Dparams` (a single mutable struct with every sticky
//! field inlined), reshaped per spec.md §9's instruction: "expose as a
//! builder that snapshots into an immutable ... params at the start of each
//! compression" instead of a long-lived mutable context object. `CParams` is
//! built once, then only ever passed by shared reference into `compress`/
//! `Context::for_compression`, which plays the role of the frozen snapshot
//! without a separate wrapper type.

use crate::constants::{CodecId, FilterId, SplitMode};
use crate::filters::FilterStep;
use crate::hooks::HookSet;
use crate::threadpool::{pool_for, ScopedPool};

/// Compression parameters (spec.md §4.4 `cparams`).
#[derive(Debug, Clone)]
pub struct CParams {
    pub codec: CodecId,
    pub codec_level: u8,
    pub use_dict: bool,
    pub typesize: usize,
    pub nthreads: usize,
    /// 0 means "auto" (spec.md §4.4).
    pub blocksize: usize,
    pub filter_pipeline: Vec<FilterStep>,
    pub splitmode: SplitMode,
    /// Enables the optional trailing content checksum (spec.md §4.1
    /// "Checksum mismatch is fatal").
    pub checksum: bool,
    pub tuner_id: Option<&'static str>,
}

impl Default for CParams {
    fn default() -> Self {
        CParams {
            codec: CodecId::BloscLz,
            codec_level: 5,
            use_dict: false,
            typesize: 1,
            nthreads: 1,
            blocksize: 0,
            filter_pipeline: vec![FilterStep { id: FilterId::Shuffle, meta: 0 }],
            splitmode: SplitMode::Auto,
            checksum: false,
            tuner_id: None,
        }
    }
}

impl CParams {
    /// Applies the spec.md §6.5 environment-variable overrides on top of
    /// `self`, matching "compression entry points honour these before
    /// snapshotting parameters".
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("BLOSC_CLEVEL") {
            if let Ok(n) = v.parse::<u8>() {
                self.codec_level = n.min(9);
            }
        }
        if let Ok(v) = std::env::var("BLOSC_SHUFFLE") {
            self.filter_pipeline.retain(|s| !matches!(s.id, FilterId::Shuffle | FilterId::BitShuffle));
            match v.as_str() {
                "SHUFFLE" => self.filter_pipeline.insert(0, FilterStep { id: FilterId::Shuffle, meta: 0 }),
                "BITSHUFFLE" => self.filter_pipeline.insert(0, FilterStep { id: FilterId::BitShuffle, meta: 0 }),
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("BLOSC_DELTA") {
            if v == "1" {
                self.filter_pipeline.insert(0, FilterStep { id: FilterId::Delta, meta: 0 });
            }
        }
        if let Ok(v) = std::env::var("BLOSC_TYPESIZE") {
            if let Ok(n) = v.parse::<usize>() {
                self.typesize = n;
            }
        }
        if let Ok(v) = std::env::var("BLOSC_COMPRESSOR") {
            self.codec = match v.as_str() {
                "BLOSCLZ" => CodecId::BloscLz,
                "LZ4" => CodecId::Lz4,
                "LZ4HC" => CodecId::Lz4Hc,
                "SNAPPY" => CodecId::Snappy,
                "ZLIB" => CodecId::Zlib,
                "ZSTD" => CodecId::Zstd,
                _ => self.codec,
            };
        }
        if let Ok(v) = std::env::var("BLOSC_NTHREADS") {
            if let Ok(n) = v.parse::<usize>() {
                self.nthreads = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("BLOSC_BLOCKSIZE") {
            if let Ok(n) = v.parse::<usize>() {
                self.blocksize = n;
            }
        }
        if std::env::var("BTUNE_TRADEOFF").is_ok() {
            self.tuner_id = Some("btune");
        }
        self
    }
}

/// Decompression parameters (spec.md §4.4 `dparams`).
#[derive(Debug, Clone, Default)]
pub struct DParams {
    pub nthreads: usize,
}

/// Per-call scratch (spec.md §2 item 6, §4.5, §5): parameter snapshot,
/// thread pool handle, hook set, and — on the decompression side — the
/// per-block maskout bitmap that `decompress_chunk` resets before returning
/// (spec.md §5).
pub struct Context {
    pub cparams: CParams,
    pub dparams: DParams,
    pub hooks: HookSet,
    pool: ScopedPool,
    maskout: Option<Vec<bool>>,
}

impl Context {
    pub fn for_compression(cparams: CParams) -> Self {
        let nthreads = cparams.nthreads;
        Context {
            cparams,
            dparams: DParams::default(),
            hooks: HookSet::new(),
            pool: pool_for(nthreads),
            maskout: None,
        }
    }

    pub fn for_decompression(dparams: DParams) -> Self {
        let nthreads = dparams.nthreads.max(1);
        Context {
            cparams: CParams::default(),
            dparams,
            hooks: HookSet::new(),
            pool: pool_for(nthreads),
            maskout: None,
        }
    }

    pub fn pool(&self) -> &ScopedPool {
        &self.pool
    }

    /// spec.md §4.2 `decompress_chunk` / §5: set the per-block skip bitmap
    /// for the *next* decompress call only.
    pub fn set_maskout(&mut self, mask: Vec<bool>) {
        self.maskout = Some(mask);
    }

    pub fn take_maskout(&mut self) -> Option<Vec<bool>> {
        self.maskout.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_override_changes_clevel() {
        std::env::set_var("BLOSC_CLEVEL", "3");
        let cparams = CParams::default().with_env_overrides();
        assert_eq!(cparams.codec_level, 3);
        std::env::remove_var("BLOSC_CLEVEL");
    }

    #[test]
    fn env_override_selects_compressor() {
        std::env::set_var("BLOSC_COMPRESSOR", "ZSTD");
        let cparams = CParams::default().with_env_overrides();
        assert_eq!(cparams.codec, CodecId::Zstd);
        std::env::remove_var("BLOSC_COMPRESSOR");
    }

    #[test]
    fn maskout_is_taken_once() {
        let mut ctx = Context::for_decompression(DParams::default());
        ctx.set_maskout(vec![true, false]);
        assert!(ctx.take_maskout().is_some());
        assert!(ctx.take_maskout().is_none());
    }
}
