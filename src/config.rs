// Engine configuration.
//
// Hosts usually build this from their own option plumbing (CLI flags or
// ini files); the defaults here match the documented flag defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Default number of executions buffered before a store commit.
pub const DEFAULT_BATCH_SIZE: usize = 20;

/// Default fingerprint-cache bound.
/// At a few KB per fingerprint this caps worst-case memory near 500 MB.
pub const DEFAULT_CACHE_SIZE: usize = 100_000;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Project root; stored filenames are relative to this.
    pub project_root: PathBuf,

    /// Store file. Defaults to `<project_root>/.cache/diff/store.db`.
    pub db_path: PathBuf,

    /// Fingerprint-cache bound (entries).
    pub cache_size: usize,

    /// Test executions buffered per write transaction.
    pub batch_size: usize,
}

impl Config {
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        let project_root = project_root.into();
        let db_path = default_db_path(&project_root);
        Self {
            project_root,
            db_path,
            cache_size: DEFAULT_CACHE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_db_path(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.db_path = db_path.into();
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new(".")
    }
}

fn default_db_path(root: &Path) -> PathBuf {
    root.join(".cache").join("diff").join("store.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_derive_from_root() {
        let config = Config::new("/tmp/proj");
        assert_eq!(
            config.db_path,
            PathBuf::from("/tmp/proj/.cache/diff/store.db")
        );
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.cache_size, DEFAULT_CACHE_SIZE);
    }

    #[test]
    fn builders_override_defaults() {
        let config = Config::new(".")
            .with_db_path("/tmp/other.db")
            .with_batch_size(0)
            .with_cache_size(10);
        assert_eq!(config.db_path, PathBuf::from("/tmp/other.db"));
        // batch size never drops below one
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.cache_size, 10);
    }

    #[test]
    fn deserializes_with_defaults() {
        let config: Config = serde_json::from_str(r#"{"batch_size": 50}"#).unwrap();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.cache_size, DEFAULT_CACHE_SIZE);
    }
}
