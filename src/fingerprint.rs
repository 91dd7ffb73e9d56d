// File fingerprinting.
//
// A fingerprint is the per-file record change detection runs on: the
// root-relative filename, the SHA-256 of the file bytes, the stat mtime,
// and one CRC-32 checksum per block. This module also translates per-test
// coverage maps into fingerprints restricted to the blocks a test
// actually executed, and discovers the project's Python files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::warn;
use walkdir::WalkDir;

use crate::cache::FingerprintCache;
use crate::error::{Error, Result};
use crate::parser::parse_blocks;
use crate::types::{Block, Fingerprint};

/// SHA-256 of a byte blob, lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Path relative to the project root, forward-slash normalized.
///
/// Paths outside the root are kept whole (still slash-normalized) so the
/// caller can filter them out by prefix.
pub fn relative_filename(path: &Path, root: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let segments: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    segments.join("/")
}

/// Seconds since epoch from a stat, as stored in fingerprints.
pub(crate) fn mtime_seconds(metadata: &std::fs::Metadata, path: &Path) -> Result<f64> {
    let modified = metadata
        .modified()
        .map_err(|e| Error::io(path.to_path_buf(), e))?;
    Ok(modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0))
}

/// Fingerprint a single file.
pub fn fingerprint_file(path: &Path, root: &Path) -> Result<Fingerprint> {
    let bytes = std::fs::read(path).map_err(|e| Error::io(path.to_path_buf(), e))?;
    let metadata = std::fs::metadata(path).map_err(|e| Error::io(path.to_path_buf(), e))?;
    let mtime = mtime_seconds(&metadata, path)?;
    let hash = content_hash(&bytes);
    Ok(fingerprint_from_bytes(path, root, &bytes, hash, mtime))
}

/// Build a fingerprint from bytes already read (and hashed) by the
/// caller. This is the parse step the cache skips on a hit.
pub(crate) fn fingerprint_from_bytes(
    path: &Path,
    root: &Path,
    bytes: &[u8],
    content_hash: String,
    mtime: f64,
) -> Fingerprint {
    let source = String::from_utf8_lossy(bytes);
    let blocks = parse_blocks(&source);
    Fingerprint {
        filename: relative_filename(path, root),
        content_hash,
        mtime,
        checksums: blocks.iter().map(|b| b.checksum).collect(),
        blocks: Some(blocks),
    }
}

/// Fingerprint a list of files in parallel. Output order matches input
/// order; per-file failures stay attached to their slot.
pub fn fingerprint_files(paths: &[PathBuf], root: &Path) -> Vec<Result<Fingerprint>> {
    paths
        .par_iter()
        .map(|path| fingerprint_file(path, root))
        .collect()
}

/// Find every `.py` file under the project root, sorted for determinism.
/// Hidden directories and `__pycache__` are skipped.
pub fn discover_python_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !(name.starts_with('.') && e.depth() > 0) && name != "__pycache__"
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry.file_type().is_file()
                && entry.path().extension().and_then(|s| s.to_str()) == Some("py")
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// Translate one test's coverage map into dependency fingerprints.
///
/// `touched` maps root-relative filenames to 1-based executed lines. Each
/// file is fingerprinted through the cache, then its checksum list is
/// restricted to blocks that executed at least one line; a line inside a
/// nested definition marks the inner block and every enclosing block.
/// Files whose coverage hits no block, and files that cannot be read,
/// contribute nothing.
pub fn coverage_fingerprints(
    touched: &HashMap<String, Vec<usize>>,
    root: &Path,
    cache: &FingerprintCache,
) -> Vec<Fingerprint> {
    let mut entries: Vec<(&String, &Vec<usize>)> = touched.iter().collect();
    entries.sort_by_key(|(filename, _)| filename.as_str());

    entries
        .par_iter()
        .filter_map(|(filename, lines)| {
            let path = root.join(filename.as_str());
            let fp = match cache.get_or_compute(&path, root) {
                Ok(fp) => fp,
                Err(e) => {
                    warn!(file = filename.as_str(), error = %e, "skipping uncoverable file");
                    return None;
                }
            };

            let blocks = fp.blocks.as_deref()?;
            let mut sorted_lines = (*lines).clone();
            sorted_lines.sort_unstable();

            let executed: Vec<i32> = blocks
                .iter()
                .filter(|b| block_executed(b, &sorted_lines))
                .map(|b| b.checksum)
                .collect();
            if executed.is_empty() {
                return None;
            }

            Some(Fingerprint {
                filename: fp.filename.clone(),
                content_hash: fp.content_hash.clone(),
                mtime: fp.mtime,
                checksums: executed,
                blocks: None,
            })
        })
        .collect()
}

/// Binary search of the sorted executed-line list against the block's
/// inclusive line range.
fn block_executed(block: &Block, sorted_lines: &[usize]) -> bool {
    let idx = sorted_lines.partition_point(|&line| line < block.start_line);
    idx < sorted_lines.len() && sorted_lines[idx] <= block.end_line
}
