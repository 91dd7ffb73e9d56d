// Three-level change detection.
//
// Level 1 compares stat mtimes against the stored rows (cheap, catches
// the common "nothing touched" case). Level 2 re-hashes suspects and
// clears files whose bytes did not change, refreshing their stored mtime.
// Level 3 re-fingerprints what is left and diffs block checksums. Each
// level short-circuits the next.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, warn};

use crate::cache::FingerprintCache;
use crate::error::Result;
use crate::fingerprint::{content_hash, discover_python_files, mtime_seconds, relative_filename};
use crate::store::{DependencyStore, StoredFingerprint};
use crate::types::ChangedFiles;

/// Tolerance for mtime equality. Coarser-granularity filesystems only
/// produce false suspects, which Level 2 absorbs.
pub const MTIME_EPSILON: f64 = 0.001;

enum SuspectOutcome {
    /// Hash matched every stored row; carry the fresh mtime to store.
    ContentUnchanged { mtime: f64 },
    /// Block-level diff, possibly empty.
    Changed { checksums: Vec<i32> },
    /// Vanished or unreadable between the scan and the read.
    Deleted,
}

/// Detect changes between the working tree and the store.
///
/// The output maps each changed file to the symmetric difference between
/// its fresh checksum set and the union of its stored checksum sets. New
/// files contribute their full fresh set, deleted files their full stored
/// union. mtimes confirmed by the Level-2 hash are refreshed in the store.
pub fn detect_changes(
    root: &Path,
    store: &DependencyStore,
    cache: &FingerprintCache,
) -> Result<ChangedFiles> {
    let stored = store.fingerprint_records()?;

    let on_disk: HashMap<String, PathBuf> = discover_python_files(root)
        .into_iter()
        .map(|path| (relative_filename(&path, root), path))
        .collect();

    let mut result = ChangedFiles::default();
    let mut suspects: Vec<(String, PathBuf, &Vec<StoredFingerprint>)> = Vec::new();

    for (filename, rows) in &stored {
        let Some(path) = on_disk.get(filename) else {
            result.deleted_files.push(filename.clone());
            result.modified.push(filename.clone());
            result
                .changed_blocks
                .insert(filename.clone(), checksum_union(rows));
            continue;
        };

        match std::fs::metadata(path).and_then(|m| m.modified().map(|_| m)) {
            Ok(metadata) => {
                let mtime = mtime_seconds(&metadata, path)?;
                let stored_mtime = rows.iter().map(|r| r.mtime).fold(f64::MIN, f64::max);
                if (mtime - stored_mtime).abs() <= MTIME_EPSILON {
                    continue; // Level 1: untouched
                }
                suspects.push((filename.clone(), path.clone(), rows));
            }
            Err(e) => {
                warn!(file = filename.as_str(), error = %e, "unreadable file treated as deleted");
                result.deleted_files.push(filename.clone());
                result.modified.push(filename.clone());
                result
                    .changed_blocks
                    .insert(filename.clone(), checksum_union(rows));
            }
        }
    }

    // Levels 2 and 3 over the suspects, in parallel.
    let outcomes: Vec<(String, SuspectOutcome)> = suspects
        .par_iter()
        .map(|(filename, path, rows)| {
            (filename.clone(), classify_suspect(path, root, rows, cache))
        })
        .collect();

    for (filename, outcome) in outcomes {
        match outcome {
            SuspectOutcome::ContentUnchanged { mtime } => {
                store.touch_file_mtime(&filename, mtime)?;
            }
            SuspectOutcome::Changed { checksums } => {
                result.modified.push(filename.clone());
                result.changed_blocks.insert(filename, checksums);
            }
            SuspectOutcome::Deleted => {
                let union = stored.get(&filename).map(|r| checksum_union(r)).unwrap_or_default();
                result.deleted_files.push(filename.clone());
                result.modified.push(filename.clone());
                result.changed_blocks.insert(filename, union);
            }
        }
    }

    // Files with no stored row: their whole checksum set counts as changed.
    let new_entries: Vec<(String, Option<Vec<i32>>)> = on_disk
        .par_iter()
        .filter(|(filename, _)| !stored.contains_key(*filename))
        .map(|(filename, path)| {
            let checksums = match cache.get_or_compute(path, root) {
                Ok(fp) => Some(fp.checksums.clone()),
                Err(e) => {
                    warn!(file = filename.as_str(), error = %e, "cannot fingerprint new file");
                    None
                }
            };
            (filename.clone(), checksums)
        })
        .collect();

    for (filename, checksums) in new_entries {
        let Some(checksums) = checksums else { continue };
        result.new_files.push(filename.clone());
        result.modified.push(filename.clone());
        result.changed_blocks.insert(filename, dedup(checksums));
    }

    debug!(
        modified = result.modified.len(),
        new = result.new_files.len(),
        deleted = result.deleted_files.len(),
        "change detection finished"
    );
    Ok(result)
}

fn classify_suspect(
    path: &Path,
    root: &Path,
    rows: &[StoredFingerprint],
    cache: &FingerprintCache,
) -> SuspectOutcome {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable suspect treated as deleted");
            return SuspectOutcome::Deleted;
        }
    };

    // Level 2: content hash
    let hash = content_hash(&bytes);
    if rows.iter().all(|r| r.content_hash == hash) {
        let mtime = std::fs::metadata(path)
            .ok()
            .and_then(|m| mtime_seconds(&m, path).ok())
            .unwrap_or(0.0);
        return SuspectOutcome::ContentUnchanged { mtime };
    }

    // Level 3: block diff
    let fresh = match cache.get_or_compute(path, root) {
        Ok(fp) => fp,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "suspect vanished during diff");
            return SuspectOutcome::Deleted;
        }
    };

    let fresh_set: HashSet<i32> = fresh.checksums.iter().copied().collect();
    let stored_set: HashSet<i32> = rows
        .iter()
        .flat_map(|r| r.checksums.iter().copied())
        .collect();
    let mut checksums: Vec<i32> = fresh_set.symmetric_difference(&stored_set).copied().collect();
    checksums.sort_unstable();
    SuspectOutcome::Changed { checksums }
}

fn checksum_union(rows: &[StoredFingerprint]) -> Vec<i32> {
    let set: HashSet<i32> = rows
        .iter()
        .flat_map(|r| r.checksums.iter().copied())
        .collect();
    let mut union: Vec<i32> = set.into_iter().collect();
    union.sort_unstable();
    union
}

fn dedup(checksums: Vec<i32>) -> Vec<i32> {
    let set: HashSet<i32> = checksums.into_iter().collect();
    let mut out: Vec<i32> = set.into_iter().collect();
    out.sort_unstable();
    out
}
