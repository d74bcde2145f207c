//! Deciding which code locations are traced.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::HashMap;
use parking_lot::Mutex;

use crate::config::ConfigError;

/// The directory whose code is traced.
///
/// The root is resolved to a canonical absolute path once, on construction.
/// Each file is then resolved once and the answer cached, so the hot path is a hash lookup.
#[derive(Clone)]
pub struct MonitoredRoot {
    inner: Arc<Inner>,
}

struct Inner {
    canonical: PathBuf,

    /// The root as given, made absolute but not canonicalized (symlinks intact).
    absolute: PathBuf,

    /// Where relative source paths are resolved from.
    base_dir: PathBuf,

    verdicts: Mutex<HashMap<String, bool>>,
}

impl std::fmt::Debug for MonitoredRoot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoredRoot")
            .field("canonical", &self.inner.canonical)
            .finish_non_exhaustive()
    }
}

impl MonitoredRoot {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let root = root.as_ref();
        let invalid = |source| ConfigError::InvalidRoot {
            path: root.to_owned(),
            source,
        };

        let base_dir = std::env::current_dir().map_err(invalid)?;
        let canonical = root.canonicalize().map_err(invalid)?;
        let absolute = if root.is_absolute() {
            root.to_owned()
        } else {
            base_dir.join(root)
        };

        mt_log::debug!("Tracing code under {}", canonical.display());

        Ok(Self {
            inner: Arc::new(Inner {
                canonical,
                absolute,
                base_dir,
                verdicts: Default::default(),
            }),
        })
    }

    /// The canonical root directory.
    pub fn path(&self) -> &Path {
        &self.inner.canonical
    }

    /// Is the given source file inside the monitored root?
    ///
    /// Relative paths (as produced by `file!()`) are tried against the current
    /// directory and each of its ancestors.
    pub fn contains(&self, file: &str) -> bool {
        if file.is_empty() || file.starts_with('<') {
            return false; // synthetic locations such as `<unattributed>`
        }

        if let Some(verdict) = self.inner.verdicts.lock().get(file) {
            return *verdict;
        }

        let verdict = self.resolve(Path::new(file));
        self.inner.verdicts.lock().insert(file.to_owned(), verdict);
        verdict
    }

    fn resolve(&self, file: &Path) -> bool {
        if file.is_absolute() {
            return self.is_under_root(file);
        }

        self.inner
            .base_dir
            .ancestors()
            .map(|dir| dir.join(file))
            .find(|candidate| candidate.exists())
            .is_some_and(|candidate| self.is_under_root(&candidate))
    }

    fn is_under_root(&self, path: &Path) -> bool {
        if path.starts_with(&self.inner.absolute) || path.starts_with(&self.inner.canonical) {
            return true;
        }
        path.canonicalize()
            .is_ok_and(|canonical| canonical.starts_with(&self.inner.canonical))
    }
}

// ----------------------------------------------------------------------------

/// Functions that are never traced.
///
/// * `name::` is a module: every function under it is denied.
/// * `a::b` is a path: that function and everything under it is denied.
/// * `name` is a function name: denied wherever it is defined.
#[derive(Clone, Debug, Default)]
pub struct DenyList {
    entries: Vec<String>,
}

impl DenyList {
    pub fn new(entries: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_denied(&self, function: &str) -> bool {
        let last_segment = function.rsplit("::").next().unwrap_or(function);
        self.entries.iter().any(|entry| {
            if entry.ends_with("::") {
                function.starts_with(entry.as_str())
            } else if entry.contains("::") {
                function == entry
                    || function
                        .strip_prefix(entry.as_str())
                        .is_some_and(|rest| rest.starts_with("::"))
            } else {
                last_segment == entry
            }
        })
    }
}
