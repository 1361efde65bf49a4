//! The chunk-file binary envelope (spec.md §4.2, §6).
//!
//! Layout, matching the field-by-field byte offsets in spec.md §6 (which is
//! internally more specific than, and supersedes, that section's rough "N*48"
//! directory-size summary — see DESIGN.md's Open Question log):
//!
//! ```text
//! offset  size  field
//! 0       4     magic = b"CFH0"
//! 4       4     chunk_count (u32)
//! 8       32    version_string (zero-padded ASCII)
//! 40      32    build_date_string (zero-padded ASCII)
//! 72      N*52  chunk directory, each entry:
//!                 0   8   type_code (u64)
//!                 8   4   chunk_version (u32)
//!                 12  32  name (zero-padded ASCII)
//!                 44  4   file_offset (u32, absolute from file start)
//!                 48  4   size (u32)
//! ...           chunk payloads, packed in directory order
//! ```

use crate::error::{Error, Result};
use std::sync::Arc;

pub const MAGIC: [u8; 4] = *b"CFH0";
const NAME_FIELD_LEN: usize = 32;
const STRING_FIELD_LEN: usize = 32;
const HEADER_LEN: usize = 4 + 4 + STRING_FIELD_LEN + STRING_FIELD_LEN;
const DIRECTORY_ENTRY_LEN: usize = 8 + 4 + NAME_FIELD_LEN + 4 + 4;

/// Well-known type codes (spec.md §6).
pub mod type_codes {
    pub const LOG: u64 = crate::hashing::type_code("Log");
    pub const METRICS: u64 = crate::hashing::type_code("Metrics");
    pub const TEXT: u64 = crate::hashing::type_code("Text");
}

/// One chunk, either about to be written or freshly read.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub type_code: u64,
    pub version: u32,
    pub name: String,
    pub payload: Arc<[u8]>,
    /// If set, the payload is padded to an 8-byte-aligned file offset (spec.md §6:
    /// "unless alignment is required by the embedded block-serializer payload").
    pub align: bool,
}

impl Chunk {
    pub fn new(type_code: u64, version: u32, name: impl Into<String>, payload: impl Into<Arc<[u8]>>) -> Self {
        Self { type_code, version, name: name.into(), payload: payload.into(), align: false }
    }

    pub fn log(message: impl AsRef<str>) -> Self {
        let bytes: Arc<[u8]> = Arc::from(message.as_ref().as_bytes());
        Self::new(type_codes::LOG, 1, "log", bytes)
    }
}

fn pack_fixed(s: &str, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    buf[..n].copy_from_slice(&bytes[..n]);
    buf
}

fn unpack_fixed(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// `BuildChunkFile(chunks, predicate)` — spec.md §4.2.
///
/// Chunks for which `predicate` returns `false` are skipped both from the
/// directory count and from the payload bytes. Payload offsets are assigned in
/// directory order; a chunk with `align = true` is padded to the next 8-byte
/// boundary before its payload is written.
pub fn build_chunk_file(
    chunks: &[Chunk],
    version_string: &str,
    build_date_string: &str,
    predicate: impl Fn(&Chunk) -> bool,
) -> Vec<u8> {
    let selected: Vec<&Chunk> = chunks.iter().filter(|c| predicate(c)).collect();

    let directory_len = selected.len() * DIRECTORY_ENTRY_LEN;
    let mut offset = HEADER_LEN + directory_len;
    let mut offsets = Vec::with_capacity(selected.len());
    for chunk in &selected {
        if chunk.align {
            offset = (offset + 7) & !7;
        }
        offsets.push(offset as u32);
        offset += chunk.payload.len();
    }

    let mut out = Vec::with_capacity(offset);
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&(selected.len() as u32).to_le_bytes());
    out.extend_from_slice(&pack_fixed(version_string, STRING_FIELD_LEN));
    out.extend_from_slice(&pack_fixed(build_date_string, STRING_FIELD_LEN));

    for (chunk, &file_offset) in selected.iter().zip(&offsets) {
        out.extend_from_slice(&chunk.type_code.to_le_bytes());
        out.extend_from_slice(&chunk.version.to_le_bytes());
        out.extend_from_slice(&pack_fixed(&chunk.name, NAME_FIELD_LEN));
        out.extend_from_slice(&file_offset.to_le_bytes());
        out.extend_from_slice(&(chunk.payload.len() as u32).to_le_bytes());
    }

    for (chunk, &file_offset) in selected.iter().zip(&offsets) {
        while out.len() < file_offset as usize {
            out.push(0);
        }
        out.extend_from_slice(&chunk.payload);
    }

    out
}

/// Parsed chunk-file header plus directory, with payload slices borrowed from the
/// source buffer. Readers must tolerate trailing bytes past the last payload.
#[derive(Debug)]
pub struct ChunkFile {
    pub version_string: String,
    pub build_date_string: String,
    pub chunks: Vec<Chunk>,
}

/// Parses a chunk file previously written by [`build_chunk_file`].
pub fn read_chunk_file(bytes: &[u8]) -> Result<ChunkFile> {
    if bytes.len() < HEADER_LEN {
        return Err(Error::FormatError { message: "chunk file shorter than header".into(), location: None });
    }
    if bytes[0..4] != MAGIC {
        return Err(Error::FormatError { message: "bad chunk file magic".into(), location: None });
    }
    let chunk_count = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
    let version_string = unpack_fixed(&bytes[8..8 + STRING_FIELD_LEN]);
    let build_date_string = unpack_fixed(&bytes[8 + STRING_FIELD_LEN..HEADER_LEN]);

    let directory_len = chunk_count * DIRECTORY_ENTRY_LEN;
    let directory_end = HEADER_LEN + directory_len;
    if bytes.len() < directory_end {
        return Err(Error::FormatError { message: "chunk file truncated in directory".into(), location: None });
    }

    let mut chunks = Vec::with_capacity(chunk_count);
    for i in 0..chunk_count {
        let entry = &bytes[HEADER_LEN + i * DIRECTORY_ENTRY_LEN..HEADER_LEN + (i + 1) * DIRECTORY_ENTRY_LEN];
        let type_code = u64::from_le_bytes(entry[0..8].try_into().unwrap());
        let version = u32::from_le_bytes(entry[8..12].try_into().unwrap());
        let name = unpack_fixed(&entry[12..12 + NAME_FIELD_LEN]);
        let file_offset = u32::from_le_bytes(entry[44..48].try_into().unwrap()) as usize;
        let size = u32::from_le_bytes(entry[48..52].try_into().unwrap()) as usize;

        let end = file_offset
            .checked_add(size)
            .ok_or_else(|| Error::FormatError { message: "chunk offset overflow".into(), location: None })?;
        if end > bytes.len() {
            return Err(Error::FormatError { message: "chunk payload out of bounds".into(), location: None });
        }
        let payload: Arc<[u8]> = Arc::from(&bytes[file_offset..end]);
        chunks.push(Chunk { type_code, version, name, payload, align: false });
    }

    Ok(ChunkFile { version_string, build_date_string, chunks })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_chunk_list_round_trips() {
        let bytes = build_chunk_file(&[], "1.0", "2026-01-01", |_| true);
        let parsed = read_chunk_file(&bytes).unwrap();
        assert!(parsed.chunks.is_empty());
        assert_eq!(parsed.version_string, "1.0");
    }

    #[test]
    fn round_trips_with_predicate_filter() {
        let chunks = vec![
            Chunk::new(type_codes::LOG, 1, "log", Arc::from(&b"hello"[..])),
            Chunk::new(type_codes::METRICS, 1, "metrics", Arc::from(&b"1234"[..])),
        ];
        let bytes = build_chunk_file(&chunks, "v1", "date", |c| c.type_code != type_codes::METRICS);
        let parsed = read_chunk_file(&bytes).unwrap();
        assert_eq!(parsed.chunks.len(), 1);
        assert_eq!(parsed.chunks[0].type_code, type_codes::LOG);
        assert_eq!(&*parsed.chunks[0].payload, b"hello");
    }

    #[test]
    fn preserves_order_and_payload_bytes() {
        let chunks = vec![
            Chunk::new(100, 1, "a", Arc::from(&b"aaa"[..])),
            Chunk::new(200, 1, "b", Arc::from(&b"bb"[..])),
            Chunk::new(300, 1, "c", Arc::from(&b"c"[..])),
        ];
        let bytes = build_chunk_file(&chunks, "v1", "date", |_| true);
        let parsed = read_chunk_file(&bytes).unwrap();
        let codes: Vec<u64> = parsed.chunks.iter().map(|c| c.type_code).collect();
        assert_eq!(codes, vec![100, 200, 300]);
        assert_eq!(&*parsed.chunks[1].payload, b"bb");
    }

    #[test]
    fn tolerates_trailing_bytes() {
        let chunks = vec![Chunk::new(type_codes::TEXT, 1, "t", Arc::from(&b"x"[..]))];
        let mut bytes = build_chunk_file(&chunks, "v1", "date", |_| true);
        bytes.extend_from_slice(b"trailing garbage");
        let parsed = read_chunk_file(&bytes).unwrap();
        assert_eq!(parsed.chunks.len(), 1);
    }
}
