//! Blocked, shuffled, parallelisable compression container (spec.md §1).
//!
//! The crate is layered exactly as spec.md §2 describes it, leaves first:
//! [`primitives`] and [`constants`] (endian helpers, wire limits), [`io`]
//! (the I/O plugin contract), [`filters`] and [`chunk`] (the block pipeline
//! and chunk codec), [`schunk`]/[`frame`] (the super-chunk/frame manager),
//! and [`array`] (the N-dimensional layer built on top). [`context`] and
//! [`error`] cut across every layer as the parameter/operation-context and
//! error model respectively; [`hooks`] and [`threadpool`] are the
//! introspection and concurrency collaborators spec.md §2 items 6-8 and §5
//! describe.

pub mod array;
pub mod chunk;
pub mod codecs;
pub mod compat;
pub mod constants;
pub mod context;
pub mod error;
pub mod filters;
pub mod frame;
pub mod hooks;
pub mod io;
pub mod primitives;
pub mod schunk;
pub mod threadpool;

pub use array::Array;
pub use chunk::Chunk;
pub use compat::{blosc1_cbuffer_metainfo, blosc1_cbuffer_sizes, blosc1_cbuffer_validate, blosc1_getitem};
pub use context::{CParams, Context, DParams};
pub use error::{Error, ErrorCode, Result};
pub use schunk::SuperChunk;
