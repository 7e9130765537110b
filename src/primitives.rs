//! Leaf-level primitives shared by the rest of the crate (spec.md §2 item 1):
//! endian-aware load/store, checked integer arithmetic, a per-context scratch
//! arena, a capacity-bounded vector, and a simple refcount handle.
//!
//! Grounded on `blosc_private::{is_little_endian, endian_handler}` (adapted
//! to safe, generic load/store functions instead of raw-pointer byte
//! swapping) and on spec.md §9's instruction to keep the refcount
//! abstraction but wrap it in an owning smart handle.

use crate::error::{Error, ErrorCode, Result};
use std::sync::Arc;

/// Load a little-endian `i32` from `src[offset..offset+4]`.
pub fn load_le_i32(src: &[u8], offset: usize) -> Option<i32> {
    src.get(offset..offset + 4)
        .map(|b| i32::from_le_bytes(b.try_into().unwrap()))
}

/// Store a little-endian `i32` into `dst[offset..offset+4]`.
pub fn store_le_i32(dst: &mut [u8], offset: usize, value: i32) {
    dst[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Load a big-endian `i64` from `src[offset..offset+8]` (used by the frame
/// header's fixed-offset fields, spec.md §6.2).
pub fn load_be_i64(src: &[u8], offset: usize) -> Option<i64> {
    src.get(offset..offset + 8)
        .map(|b| i64::from_be_bytes(b.try_into().unwrap()))
}

pub fn store_be_i64(dst: &mut [u8], offset: usize, value: i64) {
    dst[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

/// Checked `usize` multiplication used anywhere a product of user-controlled
/// dimensions feeds an allocation (spec.md invariant: `nbytes <= INT32_MAX -
/// 32`, array shapes up to 8 dims).
pub fn checked_mul(a: usize, b: usize) -> Result<usize> {
    a.checked_mul(b)
        .ok_or_else(|| Error::new(ErrorCode::Allocation, "integer overflow in size computation"))
}

pub fn checked_add(a: usize, b: usize) -> Result<usize> {
    a.checked_add(b)
        .ok_or_else(|| Error::new(ErrorCode::Allocation, "integer overflow in size computation"))
}

/// `ceil(a / b)` for non-zero `b`, used throughout the array layer to compute
/// `extshape`/`extchunkshape` (spec.md §3).
pub fn ceil_div(a: i64, b: i64) -> i64 {
    debug_assert!(b > 0);
    (a + b - 1) / b
}

/// Per-thread scratch buffers reused across blocks within one
/// compress/decompress call (spec.md §5 "a per-context arena provides
/// per-thread scratch; scratches are not shared across threads").
#[derive(Debug, Default)]
pub struct Arena {
    buffers: Vec<Vec<u8>>,
}

impl Arena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow (and grow-in-place if needed) a scratch buffer of at least
    /// `len` bytes. The arena keeps one buffer per call site index so
    /// repeated calls in a loop reuse the same allocation.
    pub fn scratch(&mut self, slot: usize, len: usize) -> &mut [u8] {
        if self.buffers.len() <= slot {
            self.buffers.resize_with(slot + 1, Vec::new);
        }
        let buf = &mut self.buffers[slot];
        if buf.len() < len {
            buf.resize(len, 0);
        }
        &mut buf[..len]
    }
}

/// A vector bounded to a maximum capacity, used for fixed-size collections
/// like the filter pipeline (`MAX_FILTERS`) or metalayer list
/// (`MAX_METALAYERS`) where exceeding the bound is a caller error rather
/// than something to silently truncate.
#[derive(Debug, Clone)]
pub struct BoundedVec<T> {
    items: Vec<T>,
    cap: usize,
}

impl<T> BoundedVec<T> {
    pub fn new(cap: usize) -> Self {
        BoundedVec {
            items: Vec::new(),
            cap,
        }
    }

    pub fn push(&mut self, item: T) -> Result<()> {
        if self.items.len() >= self.cap {
            return Err(Error::new(
                ErrorCode::InvalidParam,
                format!("exceeded bound of {}", self.cap),
            ));
        }
        self.items.push(item);
        Ok(())
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> std::ops::Deref for BoundedVec<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        &self.items
    }
}

/// A shared, reference-counted, owning handle — the smart-handle wrapper
/// spec.md §9 asks for in place of the teacher's manual refcounting on
/// `ZL_DynamicErrorInfo`/`ZL_SDDL_Scope`.
pub type Shared<T> = Arc<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endian_round_trip() {
        let mut buf = [0u8; 8];
        store_le_i32(&mut buf, 0, -123);
        assert_eq!(load_le_i32(&buf, 0), Some(-123));
        store_be_i64(&mut buf, 0, 9_000_000_000);
        assert_eq!(load_be_i64(&buf, 0), Some(9_000_000_000));
    }

    #[test]
    fn arena_reuses_allocation() {
        let mut arena = Arena::new();
        let ptr1 = arena.scratch(0, 16).as_ptr();
        let ptr2 = arena.scratch(0, 8).as_ptr();
        assert_eq!(ptr1, ptr2);
    }

    #[test]
    fn bounded_vec_rejects_overflow() {
        let mut v: BoundedVec<u8> = BoundedVec::new(2);
        v.push(1).unwrap();
        v.push(2).unwrap();
        assert!(v.push(3).is_err());
    }

    #[test]
    fn ceil_div_matches_expectation() {
        assert_eq!(ceil_div(10, 3), 4);
        assert_eq!(ceil_div(9, 3), 3);
    }
}
