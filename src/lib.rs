// diffselect: block-level test selection
//
// This crate provides the core for change-driven test selection:
// - Python AST parsing into checksummed code blocks
// - Per-file fingerprints (SHA-256 + CRC-32 block checksums)
// - SQLite dependency store mapping tests to the fingerprints they touched
// - Three-level change detection (mtime, content hash, block diff)
// - Baseline/incremental planning and store merging

mod cache;
mod changes;
mod config;
mod error;
mod fingerprint;
mod merge;
mod parser;
mod plan;
mod store;
mod types;

pub use cache::FingerprintCache;
pub use changes::{detect_changes, MTIME_EPSILON};
pub use config::{Config, DEFAULT_BATCH_SIZE, DEFAULT_CACHE_SIZE};
pub use error::{Error, Result};
pub use fingerprint::{
    coverage_fingerprints, discover_python_files, fingerprint_file, fingerprint_files,
};
pub use merge::{merge_stores, MergeStats};
pub use parser::{parse_blocks, MODULE_BLOCK, PARSE_ERROR_BLOCK};
pub use plan::{Engine, Plan, RunMode};
pub use store::{
    DependencyStore, PendingExecution, StoreStats, StoredFingerprint, SCHEMA_VERSION,
};
pub use types::{Block, ChangedFiles, EnvironmentSpec, Fingerprint, TestOutcome};
