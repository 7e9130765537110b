//! Wire-format and compile-time limit constants.
//!
//! Values here are taken from the c-blosc2 on-disk format and its published
//! library limits; they are part of the wire contract and must not drift.

/// Chunk format version this crate writes.
pub const BLOSC2_VERSION_FORMAT: u8 = 5;

/// Length of the plain (Blosc1-compatible) chunk header.
pub const BLOSC_MIN_HEADER_LENGTH: usize = 16;

/// Length of the extended (Blosc2) chunk header this crate always writes.
pub const BLOSC_EXTENDED_HEADER_LENGTH: usize = 32;

/// Maximum per-chunk header overhead.
pub const MAX_OVERHEAD: usize = BLOSC_EXTENDED_HEADER_LENGTH;

/// Smallest source buffer size this crate will compress.
pub const MIN_BUFFERSIZE: usize = 128;

/// Largest source buffer size this crate will compress.
pub const MAX_BUFFERSIZE: usize = i32::MAX as usize - MAX_OVERHEAD;

/// Largest typesize a chunk header can encode.
pub const MAX_TYPESIZE: usize = 255;

/// Number of filter slots in a chunk header.
pub const MAX_FILTERS: usize = 6;

/// Maximum number of metalayers a frame can carry.
pub const MAX_METALAYERS: usize = 16;

/// Longest metalayer name, not counting the trailing nul.
pub const METALAYER_NAME_MAXLEN: usize = 31;

/// Maximum number of dimensions an `Array` can have.
pub const MAX_DIM: usize = 8;

/// Largest trained dictionary this crate will build.
pub const MAX_DICT_SIZE: usize = 128 * 1024;

/// Flags byte (off 2) bit positions. The codec id is *not* packed into this
/// byte (unlike c-blosc1, which steals its top 3 bits) — this crate always
/// writes the extended 32-byte header, which carries a dedicated codec-id
/// byte (off 16), so every bit here gets its own, non-overlapping meaning.
pub mod flags {
    pub const SHUFFLE: u8 = 0x01;
    pub const MEMCPYED: u8 = 0x02;
    pub const BITSHUFFLE: u8 = 0x04;
    pub const DELTA: u8 = 0x08;
    pub const BIG_ENDIAN: u8 = 0x10;
    pub const USE_DICT: u8 = 0x20;
}

/// blosc2_flags byte (off 18) bit positions.
pub mod blosc2_flags {
    /// Upper 4 bits encode the special-value kind.
    pub const SPECIAL_MASK: u8 = 0xf0;
    pub const SPECIAL_SHIFT: u8 = 4;
}

/// Special-value chunk kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SpecialKind {
    None = 0,
    Zero = 1,
    Nan = 2,
    Value = 3,
    Uninit = 4,
}

impl SpecialKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => SpecialKind::None,
            1 => SpecialKind::Zero,
            2 => SpecialKind::Nan,
            3 => SpecialKind::Value,
            4 => SpecialKind::Uninit,
            _ => return None,
        })
    }
}

/// Codec ids shipped with this crate, as written into the chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CodecId {
    BloscLz = 0,
    Lz4 = 1,
    Lz4Hc = 2,
    Snappy = 3,
    Zlib = 4,
    Zstd = 5,
}

impl CodecId {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => CodecId::BloscLz,
            1 => CodecId::Lz4,
            2 => CodecId::Lz4Hc,
            3 => CodecId::Snappy,
            4 => CodecId::Zlib,
            5 => CodecId::Zstd,
            _ => return None,
        })
    }
}

/// Filter ids, in the order they may appear in a chunk's filter pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FilterId {
    NoFilter = 0,
    Shuffle = 1,
    BitShuffle = 2,
    Delta = 3,
    TruncPrec = 4,
}

impl FilterId {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => FilterId::NoFilter,
            1 => FilterId::Shuffle,
            2 => FilterId::BitShuffle,
            3 => FilterId::Delta,
            4 => FilterId::TruncPrec,
            _ => return None,
        })
    }
}

/// Split mode for blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitMode {
    Always,
    Never,
    Auto,
    ForwardCompat,
}

impl Default for SplitMode {
    fn default() -> Self {
        SplitMode::Auto
    }
}
