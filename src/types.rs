// Core value types shared by every component.
//
// Fingerprints are immutable once produced; the cache and the store hand
// them around by Arc or by value, never by mutable reference.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A named, contiguous region of one source file.
///
/// Blocks are the granularity at which code changes are tracked. Named
/// blocks carry the dotted path from the module root (`Outer.Inner.method`);
/// two synthetic names exist: `<module>` for the top-level remainder and
/// `<parse_error>` for files the parser rejects.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    /// Dotted path from module root, or a synthetic name.
    pub name: String,

    /// Starting line number (1-indexed, inclusive; first decorator line
    /// for decorated definitions).
    pub start_line: usize,

    /// Ending line number (1-indexed, inclusive).
    pub end_line: usize,

    /// CRC-32 of the normalized block text, stored by bit pattern.
    pub checksum: i32,
}

/// The per-file record stored for change detection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Path relative to the project root, forward-slash normalized.
    pub filename: String,

    /// SHA-256 of the file bytes, lowercase hex.
    pub content_hash: String,

    /// Modification time, seconds since epoch.
    pub mtime: f64,

    /// One checksum per block, in source order (`<module>` included).
    pub checksums: Vec<i32>,

    /// Block list with line ranges, kept for coverage translation.
    /// Dropped before the fingerprint is persisted.
    pub blocks: Option<Vec<Block>>,
}

impl Fingerprint {
    /// Copy without the block list, as stored in the database.
    pub fn without_blocks(&self) -> Fingerprint {
        Fingerprint {
            filename: self.filename.clone(),
            content_hash: self.content_hash.clone(),
            mtime: self.mtime,
            checksums: self.checksums.clone(),
            blocks: None,
        }
    }
}

/// Result of change detection across the project.
#[derive(Clone, Debug, Default)]
pub struct ChangedFiles {
    /// Every file with a detected difference, including new and deleted
    /// ones, in no particular order.
    pub modified: Vec<String>,

    /// filename -> checksums that were added, removed, or mutated.
    /// An entry may be empty when a file was touched but no block differs.
    pub changed_blocks: HashMap<String, Vec<i32>>,

    /// Files present on disk with no stored fingerprint.
    pub new_files: Vec<String>,

    /// Files with stored fingerprints that are gone (or unreadable).
    pub deleted_files: Vec<String>,
}

impl ChangedFiles {
    pub fn has_changes(&self) -> bool {
        !self.modified.is_empty()
    }

    pub fn total_changed_blocks(&self) -> usize {
        self.changed_blocks.values().map(|v| v.len()).sum()
    }
}

/// The interpreter context a test executed under. Distinct environments
/// produce disjoint execution sets.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub name: String,
    pub system_packages: String,
    pub python_version: String,
}

impl EnvironmentSpec {
    pub fn new(
        name: impl Into<String>,
        system_packages: impl Into<String>,
        python_version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            system_packages: system_packages.into(),
            python_version: python_version.into(),
        }
    }
}

/// One finished test, as reported by the host runner.
///
/// `touched_files` maps project-root-relative filenames to the 1-based
/// line numbers the test executed, as delivered by the host's coverage
/// mechanism.
#[derive(Clone, Debug)]
pub struct TestOutcome {
    pub test_name: String,
    pub duration: Option<f64>,
    pub failed: bool,
    /// True when the test ran because it previously failed, not because
    /// of a code change.
    pub forced: bool,
    pub touched_files: HashMap<String, Vec<usize>>,
}
