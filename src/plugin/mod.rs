//! Plugin discovery and the cross-module singleton registry (spec.md §4.5, §9).

pub mod abi;

use crate::compiler::{CompileOperation, CompilerDelegate};
use crate::error::{Error, Result};
use crate::hashing::fnv1a64;
use crate::registry::CompilerRegistry;
use abi::{AttachableLibrary, LibVersionDesc};
use regex::Regex;
use std::{
    any::{Any, TypeId},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

/// A compiler plugin's self-description (spec.md §6: `ICompilerDesc`).
pub trait CompilerDesc: Send + Sync {
    fn file_kind_count(&self) -> u32;
    fn file_kind(&self, index: u32) -> FileKind;
}

/// `{ asset_types[], regex_filter, display_name, extensions_for_open_dlg }` — spec.md §6.
pub struct FileKind {
    pub asset_types: Vec<u64>,
    pub regex_filter: String,
    pub display_name: String,
    pub extensions_for_open_dlg: String,
}

/// Unlike `GetVersionInformation`/`AttachLibrary`/`DetachLibrary` (kept as real
/// `extern "C"` for ABI compatibility with non-Rust plugins, see [`abi::symbols`]),
/// `GetCompilerDesc` and `CreateCompileOperation` cross the boundary as Rust trait
/// objects; a plugin exporting these must be built with the same compiler version
/// as the host. This is the same constraint every `libloading`-based Rust plugin
/// system (rather than a stable-ABI one) accepts — documented in DESIGN.md.
pub type GetCompilerDescFn = unsafe fn() -> Box<dyn CompilerDesc>;
pub type CreateCompileOperationFn = unsafe fn(initializers: &[String]) -> Result<Box<dyn CompileOperation>>;

struct SingletonEntry {
    owner_library_id: u64,
    type_id: TypeId,
    slot: Weak<dyn Any + Send + Sync>,
}

/// Stores `(type id, erased pointer, weak count)` tuples published by attached
/// plugins, and zeroes every weak handle published by a library when it detaches
/// (spec.md §9, the plugin-singleton-lifecycle invariant).
#[derive(Default)]
pub struct CrossModuleRegistry {
    singletons: Mutex<Vec<SingletonEntry>>,
}

impl CrossModuleRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn publish<T: Any + Send + Sync>(&self, owner_library_id: u64, value: &Arc<T>) {
        let erased: Arc<dyn Any + Send + Sync> = value.clone();
        self.singletons.lock().unwrap().push(SingletonEntry {
            owner_library_id,
            type_id: TypeId::of::<T>(),
            slot: Arc::downgrade(&erased),
        });
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let singletons = self.singletons.lock().unwrap();
        singletons
            .iter()
            .find(|e| e.type_id == TypeId::of::<T>())
            .and_then(|e| e.slot.upgrade())
            .and_then(|arc| arc.downcast::<T>().ok())
    }

    /// Called on library detach: removes every singleton that library published, so
    /// any remaining weak references upgrade to `None`.
    fn clear_owner(&self, owner_library_id: u64) {
        self.singletons.lock().unwrap().retain(|e| e.owner_library_id != owner_library_id);
    }
}

/// Bridges a dynamically-loaded plugin's `CreateCompileOperation` export into the
/// in-process [`CompilerDelegate`] trait, keeping a strong reference to the
/// library alive for as long as the delegate is registered (spec.md §4.5:
/// "captures a strong reference to the library, keeping it loaded").
struct PluginCompilerDelegate {
    library: Arc<AttachedLibrary>,
    create_fn: CreateCompileOperationFn,
}

impl CompilerDelegate for PluginCompilerDelegate {
    fn create_compile_operation(&self, initializers: &[String]) -> Result<Box<dyn CompileOperation>> {
        // SAFETY: `create_fn` was resolved from `self.library`, which this delegate
        // keeps attached (non-zero refcount) for its entire lifetime.
        unsafe { (self.create_fn)(initializers) }
    }
}

/// An attached library plus the id `CrossModuleRegistry` tracks it under, detaching
/// (and clearing its published singletons) on drop.
struct AttachedLibrary {
    library: AttachableLibrary,
    id: u64,
    cross_module: Arc<CrossModuleRegistry>,
}

impl Drop for AttachedLibrary {
    fn drop(&mut self) {
        self.library.detach();
        self.cross_module.clear_owner(self.id);
    }
}

/// Attaches/detaches compiler plugin libraries and discovers the compile delegates
/// they export (spec.md §4.5).
pub struct PluginLoader {
    cross_module: Arc<CrossModuleRegistry>,
    next_library_id: AtomicU64,
}

impl PluginLoader {
    pub fn new() -> Self {
        Self { cross_module: CrossModuleRegistry::new(), next_library_id: AtomicU64::new(1) }
    }

    pub fn cross_module(&self) -> Arc<CrossModuleRegistry> {
        self.cross_module.clone()
    }

    /// `DiscoverCompileOperations(registry, pattern, search_rules)` — spec.md §4.5.
    ///
    /// `search_dir`/`pattern` together form a glob (spec.md's "search rules").
    /// Failure of any one candidate is isolated: a warning is logged and discovery
    /// continues with the next candidate.
    #[tracing::instrument(skip(self, registry))]
    pub fn discover_compile_operations(
        &self,
        registry: &Arc<CompilerRegistry>,
        search_dir: &Path,
        pattern: &str,
    ) -> Vec<u64> {
        let mut registration_ids = Vec::new();

        let glob_pattern = search_dir.join(pattern);
        let paths = match glob::glob(&glob_pattern.to_string_lossy()) {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(pattern = %glob_pattern.display(), error = %e, "invalid plugin search pattern");
                return registration_ids;
            }
        };

        for entry in paths {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    tracing::warn!(error = %e, "error walking plugin search directory");
                    continue;
                }
            };

            match self.attach_and_register(&path, registry) {
                Ok(mut ids) => registration_ids.append(&mut ids),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping plugin candidate"),
            }
        }

        registration_ids
    }

    fn attach_and_register(&self, path: &Path, registry: &Arc<CompilerRegistry>) -> Result<Vec<u64>> {
        let library_id = self.next_library_id.fetch_add(1, Ordering::SeqCst);
        let library = AttachableLibrary::new(path);
        let cross_module_ptr = Arc::as_ptr(&self.cross_module) as *mut std::ffi::c_void;
        library.try_attach(cross_module_ptr)?;

        let _version: LibVersionDesc = library.try_get_version().ok_or_else(|| Error::PluginAttachFailed {
            path: path.to_path_buf(),
            reason: "missing GetVersionInformation export".into(),
        })?;

        // SAFETY: signature matches `GetCompilerDescFn`'s contract.
        let get_desc: GetCompilerDescFn = unsafe {
            library
                .get_function(b"GetCompilerDesc\0")
                .ok_or_else(|| Error::PluginAttachFailed { path: path.to_path_buf(), reason: "missing GetCompilerDesc export".into() })?
        };
        // SAFETY: signature matches `CreateCompileOperationFn`'s contract.
        let create_op: CreateCompileOperationFn = unsafe {
            library
                .get_function(b"CreateCompileOperation\0")
                .ok_or_else(|| Error::PluginAttachFailed { path: path.to_path_buf(), reason: "missing CreateCompileOperation export".into() })?
        };

        let attached = Arc::new(AttachedLibrary { library, id: library_id, cross_module: self.cross_module.clone() });
        // SAFETY: `get_desc` was resolved from `attached.library`, which stays attached.
        let desc = unsafe { get_desc() };

        let delegate: Arc<dyn CompilerDelegate> =
            Arc::new(PluginCompilerDelegate { library: attached.clone(), create_fn: create_op });

        let mut ids = Vec::with_capacity(desc.file_kind_count() as usize);
        for i in 0..desc.file_kind_count() {
            let kind = desc.file_kind(i);
            let regex = Regex::new(&kind.regex_filter)
                .map_err(|e| Error::PluginAttachFailed { path: path.to_path_buf(), reason: e.to_string() })?;
            let compiler_dep_val = crate::depval::ValidationNode::new();
            let id = registry.register_compiler(
                regex,
                kind.asset_types,
                kind.display_name,
                format!("{}:{}", fnv1a64(path.to_string_lossy().as_bytes()), i),
                compiler_dep_val,
                delegate.clone(),
            )?;
            ids.push(id);
        }

        Ok(ids)
    }
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new()
    }
}
