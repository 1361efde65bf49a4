//! Utilities for creating and testing store workspaces, gated behind the
//! `project-util` feature — the same pattern as the teacher crate's own
//! `project-util` feature (`foundry_compilers::utils::tempdir`), which exists
//! purely so integration tests and downstream crates can scaffold a disposable
//! workspace without pulling `tempfile` into a normal build.

use crate::error::{Error, Result};
use crate::store::StoreConfig;
use tempfile::TempDir;

/// A disposable `<base_dir>` for an [`IntermediateStore`](crate::store::IntermediateStore),
/// deleted when dropped.
///
/// Mirrors the teacher's `tempdir()` helper, generalized from "a named tempdir"
/// to "a tempdir plus a ready-to-use [`StoreConfig`] pointed at it".
pub struct TempStoreWorkspace {
    dir: TempDir,
}

impl TempStoreWorkspace {
    pub fn new(name: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(name)
            .tempdir()
            .map_err(|err| Error::io(err, std::env::temp_dir()))?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }

    /// Builds a [`StoreConfig`] rooted at this workspace with the given version
    /// and config strings; `universal` defaults to `false`.
    pub fn store_config(&self, version_string: &str, config_string: &str) -> Result<StoreConfig> {
        StoreConfig::builder()
            .base_dir(self.dir.path())
            .version_string(version_string)
            .config_string(config_string)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_a_usable_store_config() {
        let workspace = TempStoreWorkspace::new("intermediate-compilers-test").unwrap();
        let config = workspace.store_config("1.0", "debug").unwrap();
        assert!(workspace.path().exists());
        drop(config);
    }
}
