#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod artifact;
pub mod compiler;
pub mod depval;
pub mod error;
pub mod filename_rules;
pub mod hashing;
pub mod marker;
pub mod plugin;
pub mod registry;
pub mod store;
pub mod worker;

#[cfg(feature = "project-util")]
pub mod project_util;

pub use artifact::{ArtifactCollection, ArtifactRequest, AssetState, DataType, ExpectedVersion};
pub use compiler::{CompileOperation, CompileTarget, CompilerDelegate};
pub use depval::{DependencyContext, ValidationNode};
pub use error::{Error, Result};
pub use filename_rules::FilenameRules;
pub use marker::{CompileFuture, Marker};
pub use plugin::PluginLoader;
pub use registry::CompilerRegistry;
pub use store::{IntermediateStore, StoreConfig, StoreConfigBuilder, StoreLayout};
pub use worker::WorkerPool;

use regex::Regex;
use std::{path::Path, sync::Arc};

/// The assembled compilation pipeline: a registry, its worker pool, and (optionally)
/// an intermediate store, all sharing one [`DependencyContext`].
///
/// This is the crate's top-level handle, assembled by [`PipelineBuilder`] the way
/// `foundry_compilers::Project` is assembled by `ProjectBuilder`.
pub struct CompileHub {
    registry: Arc<CompilerRegistry>,
    workers: WorkerPool,
    deps: Arc<DependencyContext>,
    plugin_loader: PluginLoader,
}

impl CompileHub {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    pub fn registry(&self) -> &Arc<CompilerRegistry> {
        &self.registry
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    pub fn dependency_context(&self) -> &Arc<DependencyContext> {
        &self.deps
    }

    /// Registers an in-process compiler delegate directly (bypassing plugin
    /// discovery — used by tests and statically-linked compilers alike).
    pub fn register_compiler(
        &self,
        regex: Regex,
        output_type_codes: Vec<u64>,
        display_name: impl Into<String>,
        source_version: impl Into<String>,
        delegate: Arc<dyn CompilerDelegate>,
    ) -> Result<u64> {
        self.registry.register_compiler(regex, output_type_codes, display_name, source_version, ValidationNode::new(), delegate)
    }

    /// Discovers and registers compiler plugins matching `pattern` under `search_dir`
    /// (spec.md §4.5).
    pub fn discover_plugins(&self, search_dir: &Path, pattern: &str) -> Vec<u64> {
        self.plugin_loader.discover_compile_operations(&self.registry, search_dir, pattern)
    }

    /// `Prepare` + `GetExistingAsset`/`InvokeCompile` combined: the whole request
    /// path from spec.md §2's data-flow summary. Returns the (possibly still
    /// `Pending`) future for this request, or `None` if no compiler matches.
    pub fn request(&self, type_code: u64, initializers: Vec<String>) -> Option<Arc<CompileFuture>> {
        let marker = self.registry.prepare(type_code, initializers)?;

        if let Some(existing) = self.registry.get_existing_asset(&marker) {
            let future = CompileFuture::pending();
            future.settle(existing);
            return Some(future);
        }

        Some(self.registry.invoke_compile(marker))
    }

    /// Coarse shutdown: waits for the worker queue to drain (spec.md §5,
    /// SPEC_FULL.md §11).
    pub fn stall_on_pending_operations(&self, cancel_all: bool) {
        self.workers.stall_on_pending_operations(cancel_all);
    }
}

/// Fluent builder for [`CompileHub`], mirroring `ProjectBuilder`'s `#[must_use]`
/// setter style.
#[must_use]
pub struct PipelineBuilder {
    store_config: Option<StoreConfig>,
    worker_threads: Option<usize>,
    filename_rules: FilenameRules,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self { store_config: None, worker_threads: None, filename_rules: FilenameRules::default() }
    }
}

impl PipelineBuilder {
    pub fn store_config(mut self, config: StoreConfig) -> Self {
        self.store_config = Some(config);
        self
    }

    pub fn worker_threads(mut self, count: usize) -> Self {
        self.worker_threads = Some(count);
        self
    }

    pub fn filename_rules(mut self, rules: FilenameRules) -> Self {
        self.filename_rules = rules;
        self
    }

    pub fn build(self) -> Result<CompileHub> {
        let deps = Arc::new(DependencyContext::with_std_fs(self.filename_rules));
        let worker_threads = self.worker_threads.unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1));
        let workers = WorkerPool::new(worker_threads);

        let store = match self.store_config {
            Some(config) => Some(Arc::new(IntermediateStore::new(config, deps.clone()))),
            None => None,
        };

        let registry = CompilerRegistry::new(deps.clone(), store, workers.clone());

        Ok(CompileHub { registry, workers, deps, plugin_loader: PluginLoader::new() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::chunkfile::type_codes;
    use crate::artifact::chunkfile::Chunk;

    struct EchoOperation {
        name: String,
    }

    impl CompileOperation for EchoOperation {
        fn targets(&self) -> Vec<CompileTarget> {
            vec![CompileTarget { type_code: type_codes::TEXT, name: self.name.clone() }]
        }

        fn serialize_target(&self, _index: usize) -> Result<Vec<Chunk>> {
            Ok(vec![Chunk::new(type_codes::TEXT, 1, self.name.clone(), Arc::from(self.name.as_bytes()))])
        }

        fn dependencies(&self) -> Vec<crate::depval::DependentFileState> {
            vec![]
        }
    }

    #[test]
    fn builder_assembles_a_working_hub() {
        let hub = CompileHub::builder().worker_threads(2).build().unwrap();
        hub.register_compiler(
            Regex::new(r"\.dae$").unwrap(),
            vec![type_codes::TEXT],
            "echo-compiler",
            "1.0",
            Arc::new(|initializers: &[String]| -> Result<Box<dyn CompileOperation>> {
                Ok(Box::new(EchoOperation { name: initializers[0].clone() }))
            }),
        )
        .unwrap();

        let future = hub.request(type_codes::TEXT, vec!["foo.dae".into()]).unwrap();
        let collection = future.wait();
        assert_eq!(collection.state(), AssetState::Ready);
    }
}
