//! The intermediate store (spec.md §4.3): versioned on-disk cache with deferred
//! directory selection, per-group product indices, and dependency-file I/O.
//!
//! Grounded in `foundry_compilers::cache::SolFilesCache` for the "versioned
//! cache keyed by a manifest file" shape, and in
//! `original_source/Assets/IntermediatesStore.cpp` for the directory-selection
//! algorithm and the in-flight/read-refcount concurrency rules, which have no
//! analogue in the teacher crate.

pub mod depfile;

use crate::artifact::chunkfile::{self, Chunk};
use crate::artifact::{ArtifactCollection, AssetState};
use crate::depval::{DependencyContext, DependentFileState, ValidationNode};
use crate::error::{Error, Result};
use crate::hashing::hash_pair;
use depfile::DepFile;
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

/// `(base_dir, version_string, config_string, universal_flag)` — spec.md §4.3.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    base_dir: PathBuf,
    version_string: String,
    config_string: String,
    universal: bool,
}

/// Fluent builder for [`StoreConfig`], mirroring `ProjectBuilder`'s `#[must_use]`
/// setter style.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct StoreConfigBuilder {
    base_dir: Option<PathBuf>,
    version_string: String,
    config_string: String,
    universal: bool,
}

impl StoreConfigBuilder {
    pub fn base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(dir.into());
        self
    }

    pub fn version_string(mut self, version: impl Into<String>) -> Self {
        self.version_string = version.into();
        self
    }

    pub fn config_string(mut self, config: impl Into<String>) -> Self {
        self.config_string = config.into();
        self
    }

    pub fn universal(mut self, universal: bool) -> Self {
        self.universal = universal;
        self
    }

    pub fn build(self) -> Result<StoreConfig> {
        let base_dir = self.base_dir.ok_or_else(|| Error::msg("StoreConfig requires a base_dir"))?;
        Ok(StoreConfig {
            base_dir,
            version_string: if self.version_string.is_empty() { "0".into() } else { self.version_string },
            config_string: if self.config_string.is_empty() { "default".into() } else { self.config_string },
            universal: self.universal,
        })
    }
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }
}

/// How a group's compile products are laid out on disk. Supplemented from
/// `original_source/Assets/LooseFilesCache.h` (loose-files storage) alongside the
/// aggregate chunk-file convention this crate defaults new groups to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreLayout {
    /// Each chunk is its own file under the group directory.
    Loose,
    /// All chunks for one archivable name are packed into a single chunk file.
    Aggregate,
}

struct Group {
    layout: StoreLayout,
    dir: PathBuf,
}

#[derive(Default)]
struct InFlight {
    stores: HashSet<u64>,
    reads: HashMap<u64, u32>,
}

fn make_safe_name(name: &str) -> String {
    name.chars().map(|c| if c == ':' || c == '*' { '-' } else { c }).collect()
}

/// The versioned on-disk intermediate cache (spec.md §4.3).
pub struct IntermediateStore {
    config: StoreConfig,
    resolved_base: Mutex<Option<PathBuf>>,
    groups: Mutex<HashMap<u64, Group>>,
    in_flight: Mutex<InFlight>,
    deps: Arc<DependencyContext>,
}

impl IntermediateStore {
    pub fn new(config: StoreConfig, deps: Arc<DependencyContext>) -> Self {
        Self { config, resolved_base: Mutex::new(None), groups: Mutex::new(HashMap::new()), in_flight: Mutex::new(InFlight::default()), deps }
    }

    /// Directory selection (spec.md §4.3, one-time and deferred to first use).
    #[tracing::instrument(skip(self))]
    fn resolve_base_directory(&self) -> Result<PathBuf> {
        {
            let resolved = self.resolved_base.lock().unwrap();
            if let Some(dir) = resolved.as_ref() {
                return Ok(dir.clone());
            }
        }

        if self.config.universal {
            let dir = self.config.base_dir.join(".int").join("u");
            fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir))?;
            *self.resolved_base.lock().unwrap() = Some(dir.clone());
            return Ok(dir);
        }

        let cfg_dir = self.config.base_dir.join(format!(".int-{}", self.config.config_string));
        fs::create_dir_all(&cfg_dir).map_err(|e| Error::io(e, &cfg_dir))?;

        let mut used = HashSet::new();
        let mut good_dir = None;

        if let Ok(entries) = fs::read_dir(&cfg_dir) {
            for entry in entries.flatten() {
                let Ok(file_type) = entry.file_type() else { continue };
                if !file_type.is_dir() {
                    continue;
                }
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Ok(index) = name.parse::<u32>() else { continue };
                used.insert(index);

                let marker_path = entry.path().join(".store");
                let Ok(contents) = fs::read_to_string(&marker_path) else { continue };
                if marker_version(&contents) == Some(self.config.version_string.as_str()) {
                    tracing::debug!(dir = %entry.path().display(), "adopting existing store directory");
                    good_dir = Some(entry.path());
                    break;
                }
            }
        }

        let resolved = match good_dir {
            Some(dir) => dir,
            None => {
                let mut index = 0u32;
                while used.contains(&index) {
                    index += 1;
                }
                let dir = cfg_dir.join(index.to_string());
                fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir))?;
                let marker_path = dir.join(".store");
                fs::write(&marker_path, format!("VersionString={}\n", self.config.version_string))
                    .map_err(|e| Error::io(e, &marker_path))?;
                tracing::debug!(dir = %dir.display(), "created new store directory");
                dir
            }
        };

        *self.resolved_base.lock().unwrap() = Some(resolved.clone());
        Ok(resolved)
    }

    /// Registers a compile-products group, creating its directory if new. Returns the
    /// stable `group_id` (a hash of `name`).
    pub fn register_group(&self, name: &str, layout: StoreLayout) -> Result<u64> {
        let group_id = crate::hashing::fnv1a64(name.as_bytes());
        if self.groups.lock().unwrap().contains_key(&group_id) {
            return Ok(group_id);
        }

        let base = self.resolve_base_directory()?;
        let dir = base.join(make_safe_name(name));
        fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir))?;
        self.groups.lock().unwrap().insert(group_id, Group { layout, dir });
        Ok(group_id)
    }

    fn product_key(&self, archivable_name: &str, group_id: u64) -> u64 {
        hash_pair(crate::hashing::fnv1a64(archivable_name.as_bytes()), group_id)
    }

    /// Store operation (spec.md §4.3).
    #[tracing::instrument(skip(self, chunks, dependencies), fields(archivable_name))]
    pub fn store(
        &self,
        archivable_name: &str,
        group_id: u64,
        chunks: &[Chunk],
        state: AssetState,
        dependencies: &[DependentFileState],
        version_string: &str,
    ) -> Result<()> {
        let key = self.product_key(archivable_name, group_id);
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if in_flight.stores.contains(&key) {
                return Err(Error::Conflict { key });
            }
            if in_flight.reads.get(&key).copied().unwrap_or(0) != 0 {
                return Err(Error::ReadInProgress { key });
            }
            in_flight.stores.insert(key);
        }
        let result = self.store_inner(archivable_name, group_id, chunks, state, dependencies, version_string);
        self.in_flight.lock().unwrap().stores.remove(&key);
        result
    }

    fn store_inner(
        &self,
        archivable_name: &str,
        group_id: u64,
        chunks: &[Chunk],
        state: AssetState,
        dependencies: &[DependentFileState],
        version_string: &str,
    ) -> Result<()> {
        let groups = self.groups.lock().unwrap();
        let group = groups.get(&group_id).ok_or_else(|| Error::msg("group has not been registered"))?;
        let safe_name = make_safe_name(archivable_name);
        let dir = group.dir.clone();
        let layout = group.layout;
        drop(groups);

        fs::create_dir_all(&dir).map_err(|e| Error::io(e, &dir))?;

        let mut manifest_entries = Vec::new();
        match layout {
            StoreLayout::Aggregate => {
                let path = dir.join(&safe_name);
                let bytes = chunkfile::build_chunk_file(chunks, version_string, "", |_| true);
                fs::write(&path, &bytes).map_err(|e| Error::io(e, &path))?;
                for chunk in chunks {
                    manifest_entries.push((chunk.type_code, chunk.version, path.clone()));
                }
            }
            StoreLayout::Loose => {
                for chunk in chunks {
                    let file_name = format!("{safe_name}.{:016x}", chunk.type_code);
                    let path = dir.join(&file_name);
                    fs::write(&path, &chunk.payload).map_err(|e| Error::io(e, &path))?;
                    manifest_entries.push((chunk.type_code, chunk.version, path));
                }
            }
        }

        let manifest_path = dir.join(format!("{safe_name}.manifest"));
        let manifest_json = serde_json::to_vec_pretty(&manifest_entries).map_err(Error::msg)?;
        fs::write(&manifest_path, manifest_json).map_err(|e| Error::io(e, &manifest_path))?;

        let state_path = dir.join(format!("{safe_name}.state"));
        let state_str = match state {
            AssetState::Ready => "ready",
            AssetState::Invalid => "invalid",
            AssetState::Pending => "pending",
        };
        fs::write(&state_path, state_str).map_err(|e| Error::io(e, &state_path))?;

        let dep_path = dir.join(format!("{safe_name}.deps"));
        let manifest = DepFile::build(&dir, dependencies);
        manifest.write(&dep_path)?;

        Ok(())
    }

    /// Retrieve operation (spec.md §4.3). Returns `Ok(None)` if any recorded
    /// dependency fails re-validation, forcing a recompile.
    #[tracing::instrument(skip(self), fields(archivable_name))]
    pub fn retrieve(&self, archivable_name: &str, group_id: u64) -> Result<Option<ArtifactCollection>> {
        let key = self.product_key(archivable_name, group_id);
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if in_flight.stores.contains(&key) {
                return Err(Error::Conflict { key });
            }
            *in_flight.reads.entry(key).or_insert(0) += 1;
        }
        let result = self.retrieve_inner(archivable_name, group_id);
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Some(count) = in_flight.reads.get_mut(&key) {
                *count = count.saturating_sub(1);
            }
        }
        result
    }

    fn retrieve_inner(&self, archivable_name: &str, group_id: u64) -> Result<Option<ArtifactCollection>> {
        let groups = self.groups.lock().unwrap();
        let group = match groups.get(&group_id) {
            Some(group) => group,
            None => return Ok(None),
        };
        let safe_name = make_safe_name(archivable_name);
        let dir = group.dir.clone();
        let layout = group.layout;
        drop(groups);

        let manifest_path = dir.join(format!("{safe_name}.manifest"));
        let manifest_bytes = match fs::read(&manifest_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(e, &manifest_path)),
        };
        let manifest_entries: Vec<(u64, u32, PathBuf)> = serde_json::from_slice(&manifest_bytes).map_err(Error::msg)?;

        let dep_path = dir.join(format!("{safe_name}.deps"));
        let dep_file = DepFile::read(&dep_path)?;
        let node = ValidationNode::new();
        for state in dep_file.to_dependent_file_states() {
            if !self.deps.try_register_dependency(&node, &state, archivable_name) {
                return Ok(None);
            }
        }

        let chunks = match layout {
            StoreLayout::Aggregate => {
                let Some((_, _, path)) = manifest_entries.first() else { return Ok(Some(ArtifactCollection::new(vec![], node))) };
                let bytes = fs::read(path).map_err(|e| Error::io(e, path))?;
                chunkfile::read_chunk_file(&bytes)?.chunks
            }
            StoreLayout::Loose => {
                let mut chunks = Vec::with_capacity(manifest_entries.len());
                for (type_code, version, path) in &manifest_entries {
                    let payload = fs::read(path).map_err(|e| Error::io(e, path))?;
                    chunks.push(Chunk::new(*type_code, *version, safe_name.clone(), Arc::<[u8]>::from(payload)));
                }
                chunks
            }
        };

        Ok(Some(ArtifactCollection::new(chunks, node)))
    }
}

fn marker_version(contents: &str) -> Option<&str> {
    contents.lines().find_map(|line| line.strip_prefix("VersionString=")).map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::chunkfile::type_codes;
    use crate::filename_rules::FilenameRules;

    fn test_store() -> (tempfile::TempDir, IntermediateStore) {
        let tmp = tempfile::tempdir().unwrap();
        let config = StoreConfig::builder()
            .base_dir(tmp.path())
            .version_string("v1")
            .config_string("test")
            .build()
            .unwrap();
        let deps = Arc::new(DependencyContext::with_std_fs(FilenameRules::default()));
        (tmp, IntermediateStore::new(config, deps))
    }

    #[test]
    fn store_then_retrieve_round_trips() {
        let (_tmp, store) = test_store();
        let group = store.register_group("models", StoreLayout::Aggregate).unwrap();
        let chunks = vec![Chunk::new(type_codes::TEXT, 1, "text", Arc::from(&b"hi"[..]))];
        store.store("foo", group, &chunks, AssetState::Ready, &[], "v1").unwrap();

        let collection = store.retrieve("foo", group).unwrap().unwrap();
        assert_eq!(collection.chunks().len(), 1);
        assert_eq!(&*collection.chunks()[0].payload, b"hi");
    }

    #[test]
    fn loose_layout_round_trips_chunk_version() {
        let (_tmp, store) = test_store();
        let group = store.register_group("skeletons", StoreLayout::Loose).unwrap();
        let chunks = vec![Chunk::new(type_codes::TEXT, 7, "text", Arc::from(&b"bones"[..]))];
        store.store("foo", group, &chunks, AssetState::Ready, &[], "v1").unwrap();

        let collection = store.retrieve("foo", group).unwrap().unwrap();
        assert_eq!(collection.chunks().len(), 1);
        assert_eq!(collection.chunks()[0].version, 7);
        assert_eq!(&*collection.chunks()[0].payload, b"bones");
    }

    #[test]
    fn retrieve_missing_product_returns_none() {
        let (_tmp, store) = test_store();
        let group = store.register_group("models", StoreLayout::Aggregate).unwrap();
        assert!(store.retrieve("nope", group).unwrap().is_none());
    }

    #[test]
    fn concurrent_store_rejected_as_conflict() {
        let (_tmp, store) = test_store();
        let group = store.register_group("models", StoreLayout::Aggregate).unwrap();
        store.in_flight.lock().unwrap().stores.insert(store.product_key("foo", group));
        let err = store.store("foo", group, &[], AssetState::Ready, &[], "v1").unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[test]
    fn store_while_reading_rejected() {
        let (_tmp, store) = test_store();
        let group = store.register_group("models", StoreLayout::Aggregate).unwrap();
        let key = store.product_key("foo", group);
        store.in_flight.lock().unwrap().reads.insert(key, 1);
        let err = store.store("foo", group, &[], AssetState::Ready, &[], "v1").unwrap_err();
        assert!(matches!(err, Error::ReadInProgress { .. }));
    }

    #[test]
    fn safe_name_replaces_unsafe_characters() {
        assert_eq!(make_safe_name("weapons:sword*01"), "weapons-sword-01");
    }
}
