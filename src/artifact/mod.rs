//! Artifact handles and collections (spec.md §3, §4.2).
//!
//! Grounded in `foundry_compilers::ArtifactOutput`/`ArtifactFile` for the
//! "abstract handle over an on-disk or in-memory result" shape, generalized
//! here to the two concrete backings spec.md calls for (blob vs. file) plus
//! the chunk-typed collection and request-resolution algorithm that have no
//! analogue in the teacher crate (Solidity artifacts are one JSON blob per
//! contract, not a typed chunk list).

pub mod chunkfile;

use crate::depval::ValidationNode;
use crate::error::{Error, Result};
use std::{fs, io, path::PathBuf, sync::Arc};

pub use chunkfile::{type_codes, Chunk};

/// Common capabilities of a single produced data item (spec.md §3: "obtain raw
/// bytes, obtain human-readable error log, obtain dependency-validation node").
pub trait Artifact: Send + Sync {
    fn bytes(&self) -> Result<Arc<[u8]>>;
    fn error_log(&self) -> &str;
    fn dep_node(&self) -> ValidationNode;
}

/// Data held as an in-memory byte vector.
pub struct BlobArtifact {
    data: Arc<[u8]>,
    error_log: String,
    node: ValidationNode,
}

impl BlobArtifact {
    pub fn new(data: impl Into<Arc<[u8]>>, node: ValidationNode) -> Self {
        Self { data: data.into(), error_log: String::new(), node }
    }

    pub fn with_error(error_log: impl Into<String>, node: ValidationNode) -> Self {
        Self { data: Arc::from(&[][..]), error_log: error_log.into(), node }
    }
}

impl Artifact for BlobArtifact {
    fn bytes(&self) -> Result<Arc<[u8]>> {
        Ok(self.data.clone())
    }

    fn error_log(&self) -> &str {
        &self.error_log
    }

    fn dep_node(&self) -> ValidationNode {
        self.node.clone()
    }
}

/// Data held on disk at a given path.
pub struct FileArtifact {
    path: PathBuf,
    error_log: String,
    node: ValidationNode,
}

impl FileArtifact {
    pub fn new(path: impl Into<PathBuf>, node: ValidationNode) -> Self {
        Self { path: path.into(), error_log: String::new(), node }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl Artifact for FileArtifact {
    fn bytes(&self) -> Result<Arc<[u8]>> {
        let data = fs::read(&self.path).map_err(|e| Error::io(e, self.path.clone()))?;
        Ok(Arc::from(data))
    }

    fn error_log(&self) -> &str {
        &self.error_log
    }

    fn dep_node(&self) -> ValidationNode {
        self.node.clone()
    }
}

/// Terminal state of an [`ArtifactCollection`] (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetState {
    Pending,
    Ready,
    Invalid,
}

/// Ordered set of chunks produced by a single compile operation, plus an
/// aggregate dependency-validation node and terminal asset state (spec.md §3).
#[derive(Clone)]
pub struct ArtifactCollection {
    chunks: Arc<Vec<Chunk>>,
    dep_node: ValidationNode,
    state: AssetState,
}

impl ArtifactCollection {
    pub fn new(chunks: Vec<Chunk>, dep_node: ValidationNode) -> Self {
        let state = if is_log_only(&chunks) { AssetState::Invalid } else { AssetState::Ready };
        Self { chunks: Arc::new(chunks), dep_node, state }
    }

    /// Builds an already-`Invalid` collection carrying a single Log chunk with `message`
    /// (spec.md §4.4's "error → log-chunk convention").
    pub fn invalid_with_error(message: impl AsRef<str>, dep_node: ValidationNode) -> Self {
        Self { chunks: Arc::new(vec![Chunk::log(message)]), dep_node, state: AssetState::Invalid }
    }

    pub fn pending(dep_node: ValidationNode) -> Self {
        Self { chunks: Arc::new(Vec::new()), dep_node, state: AssetState::Pending }
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn dep_node(&self) -> &ValidationNode {
        &self.dep_node
    }

    pub fn state(&self) -> AssetState {
        self.state
    }

    /// Convenience accessor for the message of a Log-only invalid collection.
    pub fn error_message(&self) -> Option<String> {
        if self.state != AssetState::Invalid {
            return None;
        }
        self.chunks
            .iter()
            .find(|c| c.type_code == type_codes::LOG)
            .map(|c| String::from_utf8_lossy(&c.payload).into_owned())
    }
}

/// A collection is invalid iff it contains exactly one chunk, of the well-known
/// Log type (spec.md §3, invariant 4 of §8).
fn is_log_only(chunks: &[Chunk]) -> bool {
    chunks.len() == 1 && chunks[0].type_code == type_codes::LOG
}

/// Sentinel accepted in place of an exact chunk version (spec.md §3: "unless
/// expected_version is the sentinel 'any'").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    Any,
    Exact(u32),
}

/// Shape the resolved bytes should take (spec.md §3, §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Raw,
    BlockSerializer,
    ReopenFunction,
    SharedBlob,
}

/// `(name, type_code, expected_version, data_type)` — spec.md §3.
#[derive(Debug, Clone)]
pub struct ArtifactRequest {
    pub name: String,
    pub type_code: u64,
    pub expected_version: ExpectedVersion,
    pub data_type: DataType,
}

impl ArtifactRequest {
    pub fn new(name: impl Into<String>, type_code: u64, expected_version: ExpectedVersion, data_type: DataType) -> Self {
        Self { name: name.into(), type_code, expected_version, data_type }
    }
}

/// Result shape returned per request by [`resolve_requests`].
#[derive(Clone)]
pub enum ResolvedArtifact {
    /// 8-byte-aligned owned copy of the payload (`Raw`, and `BlockSerializer` after
    /// its block-init hook has run).
    Owned(AlignedBuf),
    /// A thunk that, when invoked, opens a fresh read stream over the shared payload.
    Reopen(Arc<[u8]>),
    /// The shared blob pointer itself.
    Shared(Arc<[u8]>),
}

impl ResolvedArtifact {
    /// Opens a read stream over a `Reopen` result (spec.md §4.2: "a thunk ...
    /// that, when invoked, creates a read stream over the bytes").
    pub fn reopen(&self) -> io::Result<io::Cursor<Arc<[u8]>>> {
        match self {
            Self::Reopen(bytes) => Ok(io::Cursor::new(bytes.clone())),
            _ => Err(io::Error::new(io::ErrorKind::InvalidInput, "not a Reopen result")),
        }
    }
}

/// An 8-byte-aligned owned buffer (spec.md §4.2: "allocate an 8-byte-aligned
/// buffer, copy payload"). Needed because embedded block-serializer payloads
/// may contain pointer-sized fields the compiler plugin expects to be aligned.
pub struct AlignedBuf {
    ptr: std::ptr::NonNull<u8>,
    len: usize,
    layout: std::alloc::Layout,
}

// SAFETY: `AlignedBuf` owns its allocation exclusively and exposes it only through
// `&[u8]`/`&mut [u8]`, matching `Vec<u8>`'s Send/Sync story.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let len = bytes.len().max(1);
        let layout = std::alloc::Layout::from_size_align(len, 8).expect("len/align overflow");
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = std::ptr::NonNull::new(ptr).expect("allocation failure");
        // SAFETY: `ptr` is valid for `bytes.len()` writes; `bytes.len() <= len`.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr(), bytes.len()) };
        Self { ptr, len: bytes.len(), layout }
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` reads for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: `ptr` is valid for `len` reads/writes for the lifetime of `self`.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        // SAFETY: `self.layout` matches the layout used in `alloc_zeroed`.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf").field("len", &self.len).finish()
    }
}

/// Optional fix-up hook run over a freshly-copied `BlockSerializer` buffer
/// before it's handed back (spec.md §4.2: "call the block-init hook that fixes
/// up embedded pointers").
pub type BlockInitHook<'a> = dyn Fn(&mut [u8]) + 'a;

/// `ResolveRequests` — spec.md §4.2.
#[tracing::instrument(skip_all, fields(requests = requests.len()))]
pub fn resolve_requests(
    collection: &ArtifactCollection,
    requests: &[ArtifactRequest],
    block_init: Option<&BlockInitHook<'_>>,
) -> Result<Vec<ResolvedArtifact>> {
    let mut seen = std::collections::HashSet::with_capacity(requests.len());
    for request in requests {
        if !seen.insert(request.type_code) {
            return Err(Error::Invalid(format!("duplicate type code {:#x} in request list", request.type_code)));
        }
    }

    requests
        .iter()
        .map(|request| {
            let chunk = collection
                .chunks()
                .iter()
                .find(|c| c.type_code == request.type_code)
                .ok_or_else(|| Error::missing_with_dep(request.name.clone(), collection.dep_node().clone()))?;

            if let ExpectedVersion::Exact(expected) = request.expected_version {
                if chunk.version != expected {
                    return Err(Error::UnsupportedVersion {
                        expected: expected.to_string(),
                        found: chunk.version.to_string(),
                        dep_node: Some(collection.dep_node().clone()),
                    });
                }
            }

            Ok(match request.data_type {
                DataType::Raw => ResolvedArtifact::Owned(AlignedBuf::from_bytes(&chunk.payload)),
                DataType::BlockSerializer => {
                    let mut buf = AlignedBuf::from_bytes(&chunk.payload);
                    if let Some(hook) = block_init {
                        hook(buf.as_mut_slice());
                    }
                    ResolvedArtifact::Owned(buf)
                }
                DataType::ReopenFunction => ResolvedArtifact::Reopen(chunk.payload.clone()),
                DataType::SharedBlob => ResolvedArtifact::Shared(chunk.payload.clone()),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn sample_collection() -> ArtifactCollection {
        let chunks = vec![
            Chunk::new(type_codes::TEXT, 1, "text", Arc::from(&b"hello world"[..])),
            Chunk::new(42, 3, "model", Arc::from(&b"\x01\x02\x03\x04"[..])),
        ];
        ArtifactCollection::new(chunks, ValidationNode::new())
    }

    #[test]
    fn invalid_iff_single_log_chunk() {
        let log_only = ArtifactCollection::new(vec![Chunk::log("boom")], ValidationNode::new());
        assert_eq!(log_only.state(), AssetState::Invalid);
        assert_eq!(log_only.error_message().as_deref(), Some("boom"));

        let mixed = ArtifactCollection::new(
            vec![Chunk::log("boom"), Chunk::new(type_codes::TEXT, 1, "t", Arc::from(&b"x"[..]))],
            ValidationNode::new(),
        );
        assert_eq!(mixed.state(), AssetState::Ready);
    }

    #[test]
    fn resolve_requests_round_trips_bytes() {
        let collection = sample_collection();
        let requests = vec![ArtifactRequest::new("text", type_codes::TEXT, ExpectedVersion::Any, DataType::Raw)];
        let resolved = resolve_requests(&collection, &requests, None).unwrap();
        match &resolved[0] {
            ResolvedArtifact::Owned(buf) => assert_eq!(buf.as_slice(), b"hello world"),
            _ => panic!("expected Owned"),
        }
    }

    #[test]
    fn resolve_requests_rejects_duplicate_type_codes() {
        let collection = sample_collection();
        let requests = vec![
            ArtifactRequest::new("a", type_codes::TEXT, ExpectedVersion::Any, DataType::Raw),
            ArtifactRequest::new("b", type_codes::TEXT, ExpectedVersion::Any, DataType::Raw),
        ];
        assert!(matches!(resolve_requests(&collection, &requests, None), Err(Error::Invalid(_))));
    }

    #[test]
    fn resolve_requests_detects_missing_and_version_mismatch() {
        let collection = sample_collection();

        let missing = vec![ArtifactRequest::new("ghost", 999, ExpectedVersion::Any, DataType::Raw)];
        assert!(matches!(resolve_requests(&collection, &missing, None), Err(Error::MissingFile { .. })));

        let wrong_version = vec![ArtifactRequest::new("model", 42, ExpectedVersion::Exact(1), DataType::Raw)];
        assert!(matches!(resolve_requests(&collection, &wrong_version, None), Err(Error::UnsupportedVersion { .. })));
    }

    #[test]
    fn reopen_function_yields_a_read_stream() {
        let collection = sample_collection();
        let requests = vec![ArtifactRequest::new("text", type_codes::TEXT, ExpectedVersion::Any, DataType::ReopenFunction)];
        let resolved = resolve_requests(&collection, &requests, None).unwrap();
        let mut cursor = resolved[0].reopen().unwrap();
        let mut buf = String::new();
        cursor.read_to_string(&mut buf).unwrap();
        assert_eq!(buf, "hello world");
    }
}
