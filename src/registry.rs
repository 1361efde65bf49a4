//! The compiler registry (spec.md §4.4): registration of compile delegates,
//! request coalescing, and the compile job body that runs on the worker pool.
//!
//! Grounded in `foundry_compilers::compilers::CompilerVersionManager`-style
//! registration bookkeeping, generalized to spec.md's regex-filtered,
//! type-code-keyed delegate table with no Solidity-specific notion of version
//! ranges.

use crate::artifact::chunkfile::Chunk;
use crate::artifact::ArtifactCollection;
use crate::compiler::CompilerDelegate;
use crate::depval::{DependencyContext, ValidationNode};
use crate::error::Result;
use crate::hashing::fnv1a64;
use crate::marker::{CompileFuture, Marker};
use crate::store::{IntermediateStore, StoreLayout};
use crate::worker::WorkerPool;
use regex::Regex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

/// `(registration_id, regex_filter, output_type_codes[], display_name,
/// source_version, compiler_dep_val, delegate, store_group_id)` — spec.md §3.
pub struct CompilerRegistration {
    pub id: u64,
    pub regex: Regex,
    pub output_type_codes: Vec<u64>,
    pub display_name: String,
    pub source_version: String,
    pub compiler_dep_val: ValidationNode,
    pub delegate: Arc<dyn CompilerDelegate>,
    pub store_group_id: Option<u64>,
}

fn request_hash(type_code: u64, initializers: &[String]) -> u64 {
    let mut hash = type_code;
    for initializer in initializers {
        hash = fnv1a64(initializer.as_bytes()) ^ hash.rotate_left(13);
    }
    hash
}

/// Registers compile delegates and coalesces concurrent requests for the same
/// `(type_code, initializers)` into one marker (spec.md §4.4).
pub struct CompilerRegistry {
    next_id: AtomicU64,
    registrations: Mutex<Vec<Arc<CompilerRegistration>>>,
    markers: Mutex<HashMap<u64, Arc<Marker>>>,
    store: Option<Arc<IntermediateStore>>,
    deps: Arc<DependencyContext>,
    workers: WorkerPool,
}

impl CompilerRegistry {
    pub fn new(deps: Arc<DependencyContext>, store: Option<Arc<IntermediateStore>>, workers: WorkerPool) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            registrations: Mutex::new(Vec::new()),
            markers: Mutex::new(HashMap::new()),
            store,
            deps,
            workers,
        })
    }

    /// `RegisterCompiler` (spec.md §4.4).
    #[allow(clippy::too_many_arguments)]
    pub fn register_compiler(
        &self,
        regex: Regex,
        output_type_codes: Vec<u64>,
        display_name: impl Into<String>,
        source_version: impl Into<String>,
        compiler_dep_val: ValidationNode,
        delegate: Arc<dyn CompilerDelegate>,
    ) -> Result<u64> {
        let display_name = display_name.into();
        let store_group_id = match &self.store {
            Some(store) => Some(store.register_group(&display_name, StoreLayout::Aggregate)?),
            None => None,
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let registration = Arc::new(CompilerRegistration {
            id,
            regex,
            output_type_codes,
            display_name,
            source_version: source_version.into(),
            compiler_dep_val,
            delegate,
            store_group_id,
        });
        self.registrations.lock().unwrap().push(registration);
        Ok(id)
    }

    /// `DeregisterCompiler` (spec.md §4.4).
    pub fn deregister_compiler(&self, id: u64) {
        self.registrations.lock().unwrap().retain(|r| r.id != id);
    }

    fn find_registration(&self, type_code: u64, first_initializer: &str) -> Option<Arc<CompilerRegistration>> {
        self.registrations
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.output_type_codes.contains(&type_code) && r.regex.is_match(first_initializer))
            .cloned()
    }

    fn registration_by_id(&self, id: u64) -> Option<Arc<CompilerRegistration>> {
        self.registrations.lock().unwrap().iter().find(|r| r.id == id).cloned()
    }

    /// `Prepare(type_code, initializers) → marker?` (spec.md §4.4).
    #[tracing::instrument(skip(self, initializers))]
    pub fn prepare(self: &Arc<Self>, type_code: u64, initializers: Vec<String>) -> Option<Arc<Marker>> {
        let hash = request_hash(type_code, &initializers);

        {
            let markers = self.markers.lock().unwrap();
            if let Some(marker) = markers.get(&hash) {
                tracing::trace!(hash, "marker coalesced with existing request");
                return Some(marker.clone());
            }
        }

        let first = initializers.first()?;
        let registration = self.find_registration(type_code, first)?;

        let marker = Marker::new(initializers, type_code, registration.id);
        let mut markers = self.markers.lock().unwrap();
        // Another thread may have raced us to the same hash; prefer whichever landed first.
        Some(markers.entry(hash).or_insert(marker).clone())
    }

    /// `Marker.GetExistingAsset()` (spec.md §4.4).
    pub fn get_existing_asset(&self, marker: &Marker) -> Option<ArtifactCollection> {
        let store = self.store.as_ref()?;
        let registration = self.registration_by_id(marker.registration_id)?;
        let group_id = registration.store_group_id?;
        let archivable_name = archivable_name(marker.initializers());
        store.retrieve(&archivable_name, group_id).ok().flatten()
    }

    /// `Marker.InvokeCompile() → future` (spec.md §4.4).
    pub fn invoke_compile(self: &Arc<Self>, marker: Arc<Marker>) -> Arc<CompileFuture> {
        if let Some(future) = marker.active_future() {
            return future;
        }

        let future = CompileFuture::pending();
        marker.set_active_future(&future);

        let registry = self.clone();
        let job_future = future.clone();
        self.workers.spawn(move || registry.run_compile_job(marker, job_future));

        future
    }

    /// The compile job body (spec.md §4.4's pseudocode).
    #[tracing::instrument(skip(self, marker, future), fields(initializer = %marker.initializers().first().map(String::as_str).unwrap_or("")))]
    fn run_compile_job(self: Arc<Self>, marker: Arc<Marker>, future: Arc<CompileFuture>) {
        let Some(registration) = self.registration_by_id(marker.registration_id) else {
            tracing::warn!("registration expired before compile job ran");
            future.settle(ArtifactCollection::invalid_with_error("registration expired", ValidationNode::new()));
            return;
        };

        let collection = match registration.delegate.create_compile_operation(marker.initializers()) {
            Ok(op) => self.run_operation(&*op, &registration, marker.type_code(), marker.initializers()),
            Err(e) => {
                let dep_node = self.make_dep_val(&[], &registration, marker.initializers());
                ArtifactCollection::invalid_with_error(e.to_string(), dep_node)
            }
        };
        future.settle(collection);
    }

    fn run_operation(
        &self,
        op: &dyn crate::compiler::CompileOperation,
        registration: &CompilerRegistration,
        requested_type: u64,
        initializers: &[String],
    ) -> ArtifactCollection {
        let deps = op.dependencies();
        let dep_node = self.make_dep_val(&deps, registration, initializers);

        let targets = op.targets();
        let mut result: Option<ArtifactCollection> = None;
        let mut all_chunks: Vec<Chunk> = Vec::new();

        for (index, target) in targets.iter().enumerate() {
            if self.store.is_none() && target.type_code != requested_type {
                continue;
            }
            let chunks = match op.serialize_target(index) {
                Ok(chunks) => chunks,
                Err(e) => return ArtifactCollection::invalid_with_error(e.to_string(), dep_node),
            };
            if target.type_code == requested_type && result.is_none() {
                result = Some(ArtifactCollection::new(chunks.clone(), dep_node.clone()));
            }
            if self.store.is_some() {
                all_chunks.extend(chunks);
            }
        }

        if let (Some(store), Some(group_id)) = (&self.store, registration.store_group_id) {
            if let Some(result) = &result {
                let name = archivable_name(initializers);
                let _ = store.store(&name, group_id, &all_chunks, result.state(), &deps, &registration.source_version);
            }
        }

        result.unwrap_or_else(|| ArtifactCollection::invalid_with_error("no matching target produced by compile operation", dep_node))
    }

    fn make_dep_val(&self, deps: &[crate::depval::DependentFileState], registration: &CompilerRegistration, initializers: &[String]) -> ValidationNode {
        let node = ValidationNode::new();
        let _ = self.deps.register_asset_dependency(&registration.compiler_dep_val, &node);
        if deps.is_empty() {
            if let Some(first) = initializers.first() {
                self.deps.register_file_dependency(&node, first);
            }
        } else {
            for dep in deps {
                self.deps.register_file_dependency(&node, &dep.filename);
            }
        }
        node
    }
}

/// Derives the store's archivable name from a request's initializers: the file
/// stem of the primary initializer (GLOSSARY: "Archivable name").
fn archivable_name(initializers: &[String]) -> String {
    initializers
        .first()
        .map(|s| {
            std::path::Path::new(s)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| s.clone())
        })
        .unwrap_or_default()
}
