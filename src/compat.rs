//! `blosc1`-shaped entry points over the chunk codec: the sizing, metadata,
//! validation, and single-item-range accessors that existed before chunks
//! carried their own block-offset table and special-value kinds. Each one is
//! a thin wrapper over [`crate::chunk`]; callers that only need "how big is
//! this buffer" or "give me items N..M" don't need the full `Chunk` API.

use crate::chunk::{self, Chunk};
use crate::error::Result;

/// Returns `(nbytes, cbytes, blocksize)` read straight out of the chunk
/// header, without decompressing anything.
pub fn blosc1_cbuffer_sizes(cbuffer: &[u8]) -> (usize, usize, usize) {
    let chunk = Chunk::from_bytes(cbuffer.to_vec());
    (chunk.nbytes(), chunk.cbytes(), chunk.blocksize())
}

/// Returns `(typesize, flags)`, or `None` if the buffer is too short to hold
/// a header.
pub fn blosc1_cbuffer_metainfo(cbuffer: &[u8]) -> Option<(usize, u8)> {
    if cbuffer.len() < chunk::HEADER_LEN {
        return None;
    }
    let chunk = Chunk::from_bytes(cbuffer.to_vec());
    Some((chunk.typesize(), chunk.flags()))
}

/// Validates a chunk buffer against its own `cbytes` claim and returns its
/// uncompressed size. `expected_cbytes` must match the buffer's recorded
/// `cbytes`; this is the check a caller makes when it only has the
/// compressed size on hand (e.g. from a frame's offsets table) and wants to
/// confirm the buffer it was handed is really that chunk before trusting it.
pub fn blosc1_cbuffer_validate(cbuffer: &[u8], expected_cbytes: usize) -> Result<usize> {
    let nbytes = chunk::validate(cbuffer)?;
    let chunk = Chunk::from_bytes(cbuffer.to_vec());
    if chunk.cbytes() != expected_cbytes {
        return Err(crate::error::Error::new(
            crate::error::ErrorCode::Corruption,
            "cbytes does not match caller-supplied expected size",
        ));
    }
    Ok(nbytes)
}

/// Decompresses only the item range `[start, start + nitems)` into `dest`,
/// addressed in units of `typesize`, not bytes.
pub fn blosc1_getitem(cbuffer: &[u8], start: usize, nitems: usize, dest: &mut [u8]) -> Result<usize> {
    let chunk = Chunk::from_bytes(cbuffer.to_vec());
    chunk::getitem(&chunk, start, nitems, dest)
}
