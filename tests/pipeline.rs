//! End-to-end scenarios spanning dependency validation, the intermediate
//! store, the compiler registry, and the worker pool together (spec.md §8).

mod common;

use intermediate_compilers::artifact::chunkfile::type_codes;
use intermediate_compilers::{
    AssetState, CompileHub, CompileOperation, CompileTarget, CompilerDelegate, Error, Result, StoreConfig,
};
use std::sync::Arc;
use std::time::Duration;

/// A compile delegate that reads a source file's current bytes and mtime at
/// construction time, standing in for a real asset compiler plugin.
struct FileEchoOperation {
    name: String,
    contents: Vec<u8>,
    dependency: intermediate_compilers::depval::DependentFileState,
    fail: bool,
}

impl FileEchoOperation {
    fn from_path(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read(path).map_err(|e| Error::io(e, path))?;
        let modified = std::fs::metadata(path).ok().and_then(|m| m.modified().ok());
        let name = path.file_stem().unwrap().to_string_lossy().into_owned();
        let fail = contents.starts_with(b"BAD");
        Ok(Self {
            name,
            contents,
            dependency: intermediate_compilers::depval::DependentFileState::new(path, modified),
            fail,
        })
    }
}

impl CompileOperation for FileEchoOperation {
    fn targets(&self) -> Vec<CompileTarget> {
        vec![CompileTarget { type_code: type_codes::TEXT, name: self.name.clone() }]
    }

    fn serialize_target(&self, _index: usize) -> Result<Vec<intermediate_compilers::artifact::chunkfile::Chunk>> {
        if self.fail {
            return Err(Error::FormatError { message: "bad input marker".into(), location: None });
        }
        Ok(vec![intermediate_compilers::artifact::chunkfile::Chunk::new(
            type_codes::TEXT,
            1,
            self.name.clone(),
            Arc::<[u8]>::from(self.contents.clone()),
        )])
    }

    fn dependencies(&self) -> Vec<intermediate_compilers::depval::DependentFileState> {
        vec![self.dependency.clone()]
    }
}

struct FileEchoDelegate;

impl CompilerDelegate for FileEchoDelegate {
    fn create_compile_operation(&self, initializers: &[String]) -> Result<Box<dyn CompileOperation>> {
        Ok(Box::new(FileEchoOperation::from_path(std::path::Path::new(&initializers[0]))?))
    }
}

fn hub_with_store(base_dir: &std::path::Path) -> Arc<CompileHub> {
    let store_config = StoreConfig::builder().base_dir(base_dir).version_string("v1").build().unwrap();
    let hub = CompileHub::builder().worker_threads(2).store_config(store_config).build().unwrap();
    let hub = Arc::new(hub);
    hub.register_compiler(
        regex::Regex::new(r"\.model$").unwrap(),
        vec![type_codes::TEXT],
        "file-echo-compiler",
        "1.0",
        Arc::new(FileEchoDelegate),
    )
    .unwrap();
    hub
}

#[test]
fn empty_store_compiles_and_caches() {
    common::init_tracing();
    let store_dir = tempfile::tempdir().unwrap();
    let src_dir = tempfile::tempdir().unwrap();
    let src_path = src_dir.path().join("hero.model");
    std::fs::write(&src_path, b"mesh data v1").unwrap();

    let hub = hub_with_store(store_dir.path());

    let future = hub.request(type_codes::TEXT, vec![src_path.to_string_lossy().into_owned()]).unwrap();
    let collection = future.wait();
    assert_eq!(collection.state(), AssetState::Ready);
    assert_eq!(&*collection.chunks()[0].payload, b"mesh data v1");
}

#[test]
fn cache_hit_skips_recompilation() {
    common::init_tracing();
    let store_dir = tempfile::tempdir().unwrap();
    let src_dir = tempfile::tempdir().unwrap();
    let src_path = src_dir.path().join("hero.model");
    std::fs::write(&src_path, b"mesh data v1").unwrap();

    // First hub populates the store.
    {
        let hub = hub_with_store(store_dir.path());
        let future = hub.request(type_codes::TEXT, vec![src_path.to_string_lossy().into_owned()]).unwrap();
        assert_eq!(future.wait().state(), AssetState::Ready);
    }

    // A fresh hub (same store directory, same version string) retrieves the
    // cached artifact via `get_existing_asset` without compiling again.
    let hub = hub_with_store(store_dir.path());
    let marker = hub.registry().prepare(type_codes::TEXT, vec![src_path.to_string_lossy().into_owned()]).unwrap();
    let existing = hub.registry().get_existing_asset(&marker);
    assert!(existing.is_some());
    assert_eq!(&*existing.unwrap().chunks()[0].payload, b"mesh data v1");
}

#[test]
fn touching_the_source_file_invalidates_the_cache_entry() {
    common::init_tracing();
    let store_dir = tempfile::tempdir().unwrap();
    let src_dir = tempfile::tempdir().unwrap();
    let src_path = src_dir.path().join("hero.model");
    std::fs::write(&src_path, b"mesh data v1").unwrap();

    {
        let hub = hub_with_store(store_dir.path());
        let future = hub.request(type_codes::TEXT, vec![src_path.to_string_lossy().into_owned()]).unwrap();
        assert_eq!(future.wait().state(), AssetState::Ready);
    }

    // Force the mtime forward and rewrite the content, as an editor save would.
    std::thread::sleep(Duration::from_millis(1100));
    std::fs::write(&src_path, b"mesh data v2").unwrap();

    let hub = hub_with_store(store_dir.path());
    let marker = hub.registry().prepare(type_codes::TEXT, vec![src_path.to_string_lossy().into_owned()]).unwrap();
    // The on-disk manifest's recorded mtime no longer matches; retrieval must miss.
    assert!(hub.registry().get_existing_asset(&marker).is_none());

    let future = hub.registry().invoke_compile(marker);
    let collection = future.wait();
    assert_eq!(collection.state(), AssetState::Ready);
    assert_eq!(&*collection.chunks()[0].payload, b"mesh data v2");
}

#[test]
fn compile_failure_settles_as_invalid_with_a_log_chunk() {
    common::init_tracing();
    let store_dir = tempfile::tempdir().unwrap();
    let src_dir = tempfile::tempdir().unwrap();
    let src_path = src_dir.path().join("broken.model");
    std::fs::write(&src_path, b"BAD mesh data").unwrap();

    let hub = hub_with_store(store_dir.path());
    let future = hub.request(type_codes::TEXT, vec![src_path.to_string_lossy().into_owned()]).unwrap();
    let collection = future.wait();
    assert_eq!(collection.state(), AssetState::Invalid);
    assert!(collection.error_message().unwrap().contains("bad input marker"));
}

#[test]
fn concurrent_requests_for_the_same_asset_share_one_future() {
    common::init_tracing();
    let store_dir = tempfile::tempdir().unwrap();
    let src_dir = tempfile::tempdir().unwrap();
    let src_path = src_dir.path().join("shared.model");
    std::fs::write(&src_path, b"shared mesh").unwrap();

    let hub = hub_with_store(store_dir.path());
    let initializer = src_path.to_string_lossy().into_owned();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let hub = hub.clone();
            let initializer = initializer.clone();
            std::thread::spawn(move || hub.request(type_codes::TEXT, vec![initializer]).unwrap())
        })
        .collect();

    let futures: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for future in &futures {
        assert!(Arc::ptr_eq(future, &futures[0]));
    }
    assert_eq!(futures[0].wait().state(), AssetState::Ready);
}

#[test]
fn plugin_discovery_isolates_unloadable_candidates() {
    common::init_tracing();
    let store_dir = tempfile::tempdir().unwrap();
    let hub = hub_with_store(store_dir.path());

    let plugin_dir = tempfile::tempdir().unwrap();
    std::fs::write(plugin_dir.path().join("not_a_plugin.so"), b"not an ELF shared object").unwrap();
    std::fs::write(plugin_dir.path().join("also_bogus.so"), b"still not a library").unwrap();

    // Neither candidate exports the required ABI; discovery must not panic and
    // must simply register nothing from this directory.
    let ids = hub.discover_plugins(plugin_dir.path(), "*.so");
    assert!(ids.is_empty());

    // The in-process compiler registered separately is unaffected.
    let src_dir = tempfile::tempdir().unwrap();
    let src_path = src_dir.path().join("still_works.model");
    std::fs::write(&src_path, b"ok").unwrap();
    let future = hub.request(type_codes::TEXT, vec![src_path.to_string_lossy().into_owned()]).unwrap();
    assert_eq!(future.wait().state(), AssetState::Ready);
}
