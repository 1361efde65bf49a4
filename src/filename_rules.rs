//! Filename normalization rules (spec.md §3, §9: "never compare raw strings").
//!
//! Grounded in `foundry_compilers::utils::source_name` and the `path-slash`
//! dependency already used by the teacher crate to normalize separators for
//! cross-platform comparisons (`lib.rs::rebase_path`).

use path_slash::PathExt as _;
use std::path::Path;

/// Encapsulates how two filenames are compared/hashed for identity purposes.
///
/// A single process-wide value, threaded explicitly through every
/// constructor that needs to compare or hash filenames (never read from a
/// global), per spec.md §9's "encapsulate a `FilenameRules` value and apply
/// it at every hashing/comparison site".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilenameRules {
    case_sensitive: bool,
}

impl Default for FilenameRules {
    fn default() -> Self {
        // Matches the original implementation's default: case-insensitive comparison with
        // slash-direction normalization (safe on both POSIX and Windows source trees).
        Self { case_sensitive: false }
    }
}

impl FilenameRules {
    pub fn new(case_sensitive: bool) -> Self {
        Self { case_sensitive }
    }

    pub fn case_sensitive() -> Self {
        Self::new(true)
    }

    /// Normalizes a filename to a canonical `String` form: forward slashes, and lower-cased
    /// unless `case_sensitive` was requested.
    ///
    /// `to_slash_lossy` only rewrites the *host's* native separator (a no-op on
    /// POSIX, where `\` is a legal filename character, not a separator), so a
    /// literal backslash is also folded to `/` here — the store must treat a
    /// dependency manifest written on one platform as identical to the same
    /// path requested from another.
    pub fn normalize(&self, filename: impl AsRef<Path>) -> String {
        let slashed = filename.as_ref().to_slash_lossy().replace('\\', "/");
        if self.case_sensitive {
            slashed
        } else {
            slashed.to_lowercase()
        }
    }

    /// Hashes a filename under these rules.
    pub fn hash(&self, filename: impl AsRef<Path>) -> u64 {
        crate::hashing::fnv1a64(self.normalize(filename).as_bytes())
    }

    /// Returns `true` if the two filenames are identical under these rules.
    pub fn eq(&self, a: impl AsRef<Path>, b: impl AsRef<Path>) -> bool {
        self.normalize(a) == self.normalize(b)
    }
}
