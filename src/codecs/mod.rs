//! Concrete byte-level compressors (spec.md §1 external collaborator:
//! `compress(src,dst) -> csize | incompressible`, `decompress(src,dst) ->
//! dsize | error`). `lz4_flex`/`zstd`/`flate2`/`snap` back four of the five
//! codecs directly from [`crate::chunk`]; BloscLZ has no off-the-shelf Rust
//! crate equivalent, so this module carries the teacher's own hand-rolled
//! port unmodified (see DESIGN.md).
pub mod blosclz;
