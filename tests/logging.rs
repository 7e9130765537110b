//! Exercises the crate with a real `tracing` subscriber installed, matching
//! the teacher's own dev-dependency on `tracing-subscriber` for this purpose
//! (spec.md §2 item 8 / SPEC_FULL.md §2.2: hooks and ambient logging both
//! ride on `tracing`).

use blusc::chunk;
use blusc::context::CParams;

#[test]
fn compress_decompress_under_a_tracing_subscriber_does_not_panic() {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("trace"))
        .with_test_writer()
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let src: Vec<u8> = (0..10_000u32).flat_map(|v| v.to_le_bytes()).collect();
    let cparams = CParams { typesize: 4, ..CParams::default() };
    let chunk = chunk::compress(&cparams, &src).unwrap();
    let out = chunk::decompress_alloc(&chunk).unwrap();
    assert_eq!(out, src);
}
