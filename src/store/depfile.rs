//! Dependency manifest format (spec.md §4.3, §6).
//!
//! The original format is an attribute-tree text document (`BasePath` root
//! attribute, a `Dependencies` element whose children carry `ModTimeH`/
//! `ModTimeL`). This crate keeps the same logical shape but serializes it as
//! JSON via `serde_json`, matching the teacher crate's preference for
//! `serde_json` over a bespoke text format everywhere it persists metadata
//! (`cache.rs`'s `SolFilesCache`).

use crate::depval::{DependentFileState, FileStatus};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// One recorded dependency, relative to the manifest's `base_path`.
///
/// `modified_high`/`modified_low` mirror the original's 64-bit-time-split-in-two
/// text-portable encoding; shadowed dependencies omit them entirely (`None`),
/// which retrieval treats as an immediate invalidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepEntry {
    pub filename: PathBuf,
    pub modified_high: Option<u32>,
    pub modified_low: Option<u32>,
}

/// The dependency manifest written alongside a stored compile product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepFile {
    pub base_path: PathBuf,
    pub dependencies: Vec<DepEntry>,
}

fn split_time(time: SystemTime) -> (u32, u32) {
    let secs = time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    ((secs >> 32) as u32, secs as u32)
}

fn join_time(high: u32, low: u32) -> SystemTime {
    let secs = ((high as u64) << 32) | low as u64;
    UNIX_EPOCH + Duration::from_secs(secs)
}

impl DepFile {
    /// Builds a manifest from dependency states, making each filename relative to
    /// `base_path` (spec.md §4.3: "so the cache can be relocated without
    /// rewriting every record").
    pub fn build(base_path: &Path, states: &[DependentFileState]) -> Self {
        let dependencies = states
            .iter()
            .map(|state| {
                let filename = state.filename.strip_prefix(base_path).unwrap_or(&state.filename).to_path_buf();
                let (modified_high, modified_low) = match (state.status, state.modified) {
                    (FileStatus::Shadowed, _) => (None, None),
                    (FileStatus::Normal, Some(t)) => {
                        let (h, l) = split_time(t);
                        (Some(h), Some(l))
                    }
                    (FileStatus::Normal, None) => (None, None),
                };
                DepEntry { filename, modified_high, modified_low }
            })
            .collect();
        Self { base_path: base_path.to_path_buf(), dependencies }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).map_err(|e| Error::msg(e))?;
        fs::write(path, json).map_err(|e| Error::io(e, path))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| Error::io(e, path))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::msg(e))
    }

    /// Reconstructs absolute-path [`DependentFileState`]s for re-validation against
    /// the retained file records.
    pub fn to_dependent_file_states(&self) -> Vec<DependentFileState> {
        self.dependencies
            .iter()
            .map(|entry| {
                let filename = self.base_path.join(&entry.filename);
                let modified = match (entry.modified_high, entry.modified_low) {
                    (Some(h), Some(l)) => Some(join_time(h, l)),
                    _ => None,
                };
                let status = if entry.modified_high.is_none() && entry.modified_low.is_none() {
                    FileStatus::Shadowed
                } else {
                    FileStatus::Normal
                };
                DependentFileState { filename, modified, status }
            })
            .collect()
    }
}
