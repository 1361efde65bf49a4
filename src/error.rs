//! Crate-wide error type.
//!
//! Mirrors the constructor-helper style of `foundry_compilers::error::SolcError`:
//! a single enum, `thiserror`-derived, with small helper constructors that
//! attach path/context information to raw I/O errors rather than letting
//! `std::io::Error` propagate bare.

use crate::depval::ValidationNodeHandle;
use std::{fmt, path::PathBuf};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A line/column location inside a malformed authoring file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Crate-wide error type. Each variant corresponds to one of the error kinds
/// in spec.md §7.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A requested chunk, plugin, or source is absent.
    #[error("missing file or chunk: {what}")]
    MissingFile {
        what: String,
        /// Dependency node the caller should re-check after filesystem changes, if any.
        dep_node: Option<ValidationNodeHandle>,
    },

    /// Chunk or plugin version mismatch.
    #[error("unsupported version: expected {expected}, found {found}")]
    UnsupportedVersion {
        expected: String,
        found: String,
        dep_node: Option<ValidationNodeHandle>,
    },

    /// Malformed input file.
    #[error("format error{}: {message}", location.map(|l| format!(" at {l}")).unwrap_or_default())]
    FormatError { message: String, location: Option<Location> },

    /// A store operation was rejected because a conflicting operation is in flight.
    #[error("conflicting store operation in flight for key {key:x}")]
    Conflict { key: u64 },

    /// A store operation was rejected because a read is in progress for the same key.
    #[error("read in progress for key {key:x}")]
    ReadInProgress { key: u64 },

    /// A compiler plugin failed to attach (library missing, subdependency missing, ABI mismatch).
    #[error("plugin attach failed for {path}: {reason}")]
    PluginAttachFailed { path: PathBuf, reason: String },

    /// A dependency-validation DAG edge would have introduced a cycle.
    #[error("cyclic dependency graph edge rejected")]
    Cyclic,

    /// Duplicate type code in a request list, or any other programmer-error shaped input.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// I/O error with the path that caused it attached.
    #[error("I/O error at {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },

    /// Catch-all, carries only a message.
    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// Helper mirroring `SolcError::io(err, path)`: attach path context to a raw I/O error.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn msg(message: impl fmt::Display) -> Self {
        Self::Unknown(message.to_string())
    }

    pub fn missing(what: impl Into<String>) -> Self {
        Self::MissingFile { what: what.into(), dep_node: None }
    }

    pub fn missing_with_dep(what: impl Into<String>, dep_node: ValidationNodeHandle) -> Self {
        Self::MissingFile { what: what.into(), dep_node: Some(dep_node) }
    }

    /// Returns the dependency node attached to this error, if any (§7: "surfaced ... with the
    /// responsible dependency-validation node attached").
    pub fn dep_node(&self) -> Option<ValidationNodeHandle> {
        match self {
            Self::MissingFile { dep_node, .. } | Self::UnsupportedVersion { dep_node, .. } => {
                dep_node.clone()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_carries_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err = Error::io(io_err, "/tmp/foo.dae");
        assert!(err.to_string().contains("/tmp/foo.dae"));
    }

    #[test]
    fn format_error_with_location_renders_location() {
        let err = Error::FormatError {
            message: "bad vertex count".into(),
            location: Some(Location { line: 17, column: 4 }),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("bad vertex count"));
        assert!(rendered.contains("line 17"));
    }
}
