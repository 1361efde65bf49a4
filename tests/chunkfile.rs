//! Integration-level coverage for the chunk-file envelope, exercising it the
//! way a store round-trip actually does: build once, write to disk, read back
//! through a fresh buffer (spec.md §4.2, §6).

mod common;

use intermediate_compilers::artifact::chunkfile::{build_chunk_file, read_chunk_file, type_codes, Chunk};
use std::sync::Arc;

#[test]
fn writes_and_reads_back_through_a_real_file() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("hero.chunk");

    let chunks = vec![
        Chunk::new(type_codes::TEXT, 1, "description", Arc::from(&b"a rusty old sword"[..])),
        Chunk::new(12345, 2, "geometry", Arc::from(&[1u8, 2, 3, 4, 5, 6, 7, 8][..])),
    ];
    let bytes = build_chunk_file(&chunks, "1.4.0", "2026-07-27", |_| true);
    std::fs::write(&path, &bytes).unwrap();

    let read_back = std::fs::read(&path).unwrap();
    let parsed = read_chunk_file(&read_back).unwrap();

    assert_eq!(parsed.version_string, "1.4.0");
    assert_eq!(parsed.chunks.len(), 2);
    assert_eq!(&*parsed.chunks[0].payload, b"a rusty old sword");
    assert_eq!(parsed.chunks[1].type_code, 12345);
}

#[test]
fn log_only_chunk_file_round_trips_the_error_message() {
    common::init_tracing();
    let chunks = vec![Chunk::log("vertex count exceeds 65535")];
    let bytes = build_chunk_file(&chunks, "1.0", "2026-07-27", |_| true);
    let parsed = read_chunk_file(&bytes).unwrap();

    assert_eq!(parsed.chunks.len(), 1);
    assert_eq!(parsed.chunks[0].type_code, type_codes::LOG);
    assert_eq!(&*parsed.chunks[0].payload, b"vertex count exceeds 65535");
}

#[test]
fn empty_chunk_list_produces_a_header_only_file() {
    common::init_tracing();
    let bytes = build_chunk_file(&[], "0", "", |_| true);
    let parsed = read_chunk_file(&bytes).unwrap();
    assert!(parsed.chunks.is_empty());
}

#[test]
fn corrupted_magic_is_rejected_as_a_format_error() {
    common::init_tracing();
    let mut bytes = build_chunk_file(&[Chunk::log("x")], "1.0", "d", |_| true);
    bytes[0] = b'X';
    let err = read_chunk_file(&bytes).unwrap_err();
    assert!(matches!(err, intermediate_compilers::Error::FormatError { .. }));
}
