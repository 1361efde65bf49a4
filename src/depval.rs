//! Dependency validation (spec.md §4.1).
//!
//! Ground truth: `original_source/Assets/IntermediatesStore.cpp`'s
//! `RetainedFileRecord`/`GetRetainedFileRecord`/`TryRegisterDependency`, and
//! the DAG-of-validation-indices design note in spec.md §9 ("the retained
//! file-records table ... should be ... explicit context objects threaded
//! through constructors" rather than process-wide globals).
//!
//! Lock discipline (spec.md §5): the retained-records lock is the
//! outermost lock in the fixed acquisition order
//! *retained-records → registry → in-flight*. It is held only long enough
//! to look up or insert a record; a freshly-created record's own
//! initialization (stat'ing the file) happens outside the lock, exactly as
//! the original source does it ("We (probably) have to create a new
//! marker... Do it outside of the mutex lock").

use crate::error::{Error, Result};
use crate::filename_rules::FilenameRules;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::SystemTime,
};

/// Abstraction over filesystem `stat`, per spec.md §1: "the core depends on
/// abstract open/read/write/stat/watch operations only."
pub trait FileStat: Send + Sync {
    /// Returns the file's modification time, or `None` if the file does not exist.
    fn modified(&self, path: &Path) -> Option<SystemTime>;
}

/// `FileStat` backed by the real filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFileStat;

impl FileStat for StdFileStat {
    fn modified(&self, path: &Path) -> Option<SystemTime> {
        std::fs::metadata(path).ok()?.modified().ok()
    }
}

/// Whether a dependent file's observed state reflects what's really on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Normal,
    /// Poisoned by [`DependencyContext::shadow_file`]; treated as changed even if the
    /// on-disk timestamp hasn't moved. Used by editors to force recompilation of
    /// in-memory edits.
    Shadowed,
}

/// `(filename, modification_time, status)` — spec.md §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentFileState {
    pub filename: PathBuf,
    pub modified: Option<SystemTime>,
    pub status: FileStatus,
}

impl DependentFileState {
    pub fn new(filename: impl Into<PathBuf>, modified: Option<SystemTime>) -> Self {
        Self { filename: filename.into(), modified, status: FileStatus::Normal }
    }
}

struct NodeInner {
    /// Monotonically increasing; 0 means "never changed since creation".
    validation_index: AtomicU64,
    /// Nodes that must also be bumped when this node changes.
    dependents: Mutex<Vec<Weak<NodeInner>>>,
}

/// A node in the dependency-validation DAG (spec.md §3).
///
/// Cheap to clone (an `Arc` underneath); this is the handle threaded through
/// artifact collections and attached to errors so callers can re-check
/// freshness later.
#[derive(Clone)]
pub struct ValidationNode(Arc<NodeInner>);

/// Alias used at error-reporting call sites (spec.md §7: "surfaced to the
/// caller with the responsible dependency-validation node attached").
pub type ValidationNodeHandle = ValidationNode;

impl ValidationNode {
    pub fn new() -> Self {
        Self(Arc::new(NodeInner { validation_index: AtomicU64::new(0), dependents: Mutex::new(Vec::new()) }))
    }

    /// Current validation index. Zero means never invalidated since creation.
    pub fn validation_index(&self) -> u64 {
        self.0.validation_index.load(Ordering::SeqCst)
    }

    /// Whether this node is still valid (spec.md §3: "zero = never changed since creation").
    pub fn is_valid(&self) -> bool {
        self.validation_index() == 0
    }

    fn bump(&self) {
        self.0.validation_index.fetch_add(1, Ordering::SeqCst);
        let dependents = self.0.dependents.lock().unwrap();
        for weak in dependents.iter() {
            if let Some(strong) = weak.upgrade() {
                ValidationNode(strong).bump();
            }
        }
    }

    fn add_dependent(&self, dependent: &ValidationNode) {
        let mut dependents = self.0.dependents.lock().unwrap();
        dependents.retain(|w| w.strong_count() > 0);
        if !dependents.iter().any(|w| w.upgrade().map_or(false, |s| Arc::ptr_eq(&s, &dependent.0))) {
            dependents.push(Arc::downgrade(&dependent.0));
        }
    }

    /// `true` if `target` is reachable from `self` by following dependent edges.
    fn can_reach(&self, target: &ValidationNode) -> bool {
        if Arc::ptr_eq(&self.0, &target.0) {
            return true;
        }
        let dependents = self.0.dependents.lock().unwrap();
        dependents.iter().filter_map(|w| w.upgrade()).any(|s| ValidationNode(s).can_reach(target))
    }
}

impl Default for ValidationNode {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ValidationNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationNode").field("validation_index", &self.validation_index()).finish()
    }
}

struct RetainedFileRecordInner {
    state: Mutex<DependentFileState>,
    node: ValidationNode,
}

/// Process-wide (well: per-[`DependencyContext`]) cached state for one filename,
/// shared by every validation node that depends on it (spec.md §3).
#[derive(Clone)]
pub struct RetainedFileRecord(Arc<RetainedFileRecordInner>);

impl RetainedFileRecord {
    pub fn state(&self) -> DependentFileState {
        self.0.state.lock().unwrap().clone()
    }

    pub fn node(&self) -> ValidationNode {
        self.0.node.clone()
    }
}

/// Owns the retained-file-records table and mediates all dependency-validation DAG
/// operations. One instance is constructed by the application and threaded through
/// every [`crate::store::IntermediateStore`] / [`crate::registry::CompilerRegistry`]
/// that needs it (spec.md §9: no process-wide singleton).
pub struct DependencyContext {
    rules: FilenameRules,
    stat: Arc<dyn FileStat>,
    records: Mutex<HashMap<u64, RetainedFileRecord>>,
}

impl DependencyContext {
    pub fn new(rules: FilenameRules, stat: Arc<dyn FileStat>) -> Self {
        Self { rules, stat, records: Mutex::new(HashMap::new()) }
    }

    pub fn with_std_fs(rules: FilenameRules) -> Self {
        Self::new(rules, Arc::new(StdFileStat))
    }

    pub fn rules(&self) -> FilenameRules {
        self.rules
    }

    /// Looks up or creates the retained file record for `filename` (memoized — a
    /// second request for the same filename returns the same record).
    pub fn retained_record(&self, filename: impl AsRef<Path>) -> RetainedFileRecord {
        let filename = filename.as_ref();
        let hash = self.rules.hash(filename);

        if let Some(existing) = self.records.lock().unwrap().get(&hash) {
            return existing.clone();
        }

        // Stat the file outside the lock; it can be expensive (spec.md §5).
        let modified = self.stat.modified(filename);
        let candidate = RetainedFileRecord(Arc::new(RetainedFileRecordInner {
            state: Mutex::new(DependentFileState::new(filename, modified)),
            node: ValidationNode::new(),
        }));

        let mut records = self.records.lock().unwrap();
        // Another thread may have won the race; discard our candidate if so.
        records.entry(hash).or_insert(candidate).clone()
    }

    /// RegisterFileDependency(node, filename) — spec.md §4.1.
    ///
    /// At-most-once per (node, file) pair: re-registering the same pair is a no-op
    /// because `ValidationNode::add_dependent` de-duplicates by pointer identity.
    pub fn register_file_dependency(&self, node: &ValidationNode, filename: impl AsRef<Path>) {
        let record = self.retained_record(filename);
        record.node().add_dependent(node);
    }

    /// RegisterAssetDependency(node, parentNode) — spec.md §4.1. Installs a
    /// `node -> parentNode` edge: when `node` changes, `parentNode` is invalidated too.
    pub fn register_asset_dependency(&self, node: &ValidationNode, parent: &ValidationNode) -> Result<()> {
        // Cycle check: reject if `parent` already transitively depends on (can reach) `node`,
        // i.e. if `node` is already downstream of `parent`'s own invalidation chain.
        if parent.can_reach(node) {
            return Err(Error::Cyclic);
        }
        node.add_dependent(parent);
        Ok(())
    }

    /// OnChange(record) — fired by the (out-of-scope) filesystem monitor when `filename`
    /// is observed to change. Updates the retained record's modification time and bumps
    /// validation indices on every transitive dependent node.
    pub fn on_change(&self, filename: impl AsRef<Path>) {
        let filename = filename.as_ref();
        let hash = self.rules.hash(filename);
        let record = match self.records.lock().unwrap().get(&hash).cloned() {
            Some(record) => record,
            None => return, // nothing has ever depended on this file; nothing to invalidate
        };
        {
            let mut state = record.0.state.lock().unwrap();
            state.modified = self.stat.modified(filename);
        }
        record.node().bump();
    }

    /// ShadowFile(filename) — spec.md §4.1: poisons the record so downstream
    /// recompilation is forced without a real mtime change, and synthesizes a change
    /// event so directory-level watchers also observe it.
    pub fn shadow_file(&self, filename: impl AsRef<Path>) {
        let filename = filename.as_ref();
        let record = self.retained_record(filename);
        {
            let mut state = record.0.state.lock().unwrap();
            state.status = FileStatus::Shadowed;
        }
        record.node().bump();

        // Supplemented from original_source/Assets/IntermediateAssets.cpp: also notify
        // any validation node registered against the containing directory, so
        // directory-granularity dependents invalidate too (SPEC_FULL.md §11).
        if let Some(parent_dir) = filename.parent() {
            if let Some(dir_hash) = Some(self.rules.hash(parent_dir)) {
                if let Some(dir_record) = self.records.lock().unwrap().get(&dir_hash).cloned() {
                    dir_record.node().bump();
                }
            }
        }
    }

    /// Registers `node` as a dependent of the directory containing `path`, so a later
    /// `shadow_file` or `on_change` on a file inside that directory can bump it too.
    pub fn register_directory_dependency(&self, node: &ValidationNode, dir: impl AsRef<Path>) {
        self.register_file_dependency(node, dir);
    }

    /// TryRegisterDependency(node, recordedState, assetName) — spec.md §4.1.
    ///
    /// Compares a recorded `DependentFileState` (read back from an on-disk dependency
    /// manifest) against the retained record's current state. Always re-registers
    /// `node` as a dependent of the file (so future changes still invalidate it), even
    /// when the comparison fails.
    pub fn try_register_dependency(
        &self,
        node: &ValidationNode,
        recorded: &DependentFileState,
        asset_name: &str,
    ) -> bool {
        let record = self.retained_record(&recorded.filename);
        record.node().add_dependent(node);

        let current = record.state();

        if current.status == FileStatus::Shadowed {
            tracing::trace!(asset = asset_name, file = %recorded.filename.display(), "invalidated: dependency shadowed");
            return false;
        }
        match current.modified {
            None => {
                tracing::trace!(asset = asset_name, file = %recorded.filename.display(), "invalidated: dependency missing");
                false
            }
            Some(modified) if Some(modified) != recorded.modified => {
                tracing::trace!(asset = asset_name, file = %recorded.filename.display(), "invalidated: dependency time differs");
                false
            }
            _ => true,
        }
    }
}
