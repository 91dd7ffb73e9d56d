// In-memory fingerprint cache.
//
// Keyed by (absolute path, content hash): the file is read and hashed on
// every lookup, but the expensive parse is skipped whenever the same
// content has been fingerprinted before. The bound keeps memory finite on
// large codebases; when it is exceeded, the ~10% oldest entries by
// insertion order are dropped in one sweep.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};
use crate::fingerprint::{content_hash, fingerprint_from_bytes, mtime_seconds};
use crate::types::Fingerprint;

struct Entry {
    inserted: u64,
    fp: Arc<Fingerprint>,
}

struct Inner {
    map: HashMap<(PathBuf, String), Entry>,
    next_stamp: u64,
}

/// Bounded concurrent map from (absolute path, content hash) to an
/// immutable shared fingerprint.
pub struct FingerprintCache {
    inner: RwLock<Inner>,
    max_size: usize,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl FingerprintCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                map: HashMap::new(),
                next_stamp: 0,
            }),
            max_size: max_size.max(1),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Fingerprint `path`, skipping the parse when this exact content has
    /// been seen at this path before. A hit whose stored mtime drifted
    /// from the current stat is refreshed in place without reparsing.
    pub fn get_or_compute(&self, path: &Path, root: &Path) -> Result<Arc<Fingerprint>> {
        let bytes = std::fs::read(path).map_err(|e| Error::io(path.to_path_buf(), e))?;
        let metadata = std::fs::metadata(path).map_err(|e| Error::io(path.to_path_buf(), e))?;
        let mtime = mtime_seconds(&metadata, path)?;
        let hash = content_hash(&bytes);
        let key = (path.to_path_buf(), hash.clone());

        {
            let inner = self.inner.read();
            if let Some(entry) = inner.map.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                if entry.fp.mtime == mtime {
                    return Ok(Arc::clone(&entry.fp));
                }
            } else {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut inner = self.inner.write();
        if let Some(entry) = inner.map.get_mut(&key) {
            // Same content, newer stat: refresh the mtime, keep the parse.
            if entry.fp.mtime != mtime {
                let mut refreshed = (*entry.fp).clone();
                refreshed.mtime = mtime;
                entry.fp = Arc::new(refreshed);
            }
            return Ok(Arc::clone(&entry.fp));
        }

        let fp = Arc::new(fingerprint_from_bytes(path, root, &bytes, hash, mtime));
        if inner.map.len() >= self.max_size {
            evict_oldest(&mut inner.map, self.max_size / 10);
        }
        let stamp = inner.next_stamp;
        inner.next_stamp += 1;
        inner.map.insert(
            key,
            Entry {
                inserted: stamp,
                fp: Arc::clone(&fp),
            },
        );
        Ok(fp)
    }

    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// (hits, misses, hit rate).
    pub fn stats(&self) -> (usize, usize, f64) {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };
        (hits, misses, rate)
    }

    pub fn clear(&self) {
        self.inner.write().map.clear();
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// Drop the `count` entries with the lowest insertion stamps (at least one).
fn evict_oldest(map: &mut HashMap<(PathBuf, String), Entry>, count: usize) {
    let count = count.max(1);
    let mut stamps: Vec<(u64, (PathBuf, String))> = map
        .iter()
        .map(|(key, entry)| (entry.inserted, key.clone()))
        .collect();
    stamps.sort_unstable_by_key(|(stamp, _)| *stamp);
    for (_, key) in stamps.into_iter().take(count) {
        map.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn second_lookup_is_a_hit() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.py");
        fs::write(&path, "def f():\n    return 1\n").unwrap();

        let cache = FingerprintCache::new(16);
        let first = cache.get_or_compute(&path, dir.path()).unwrap();
        let second = cache.get_or_compute(&path, dir.path()).unwrap();

        assert_eq!(first.checksums, second.checksums);
        let (hits, misses, rate) = cache.stats();
        assert_eq!((hits, misses), (1, 1));
        assert!(rate > 0.49 && rate < 0.51);
    }

    #[test]
    fn content_change_is_a_miss() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.py");
        fs::write(&path, "def f():\n    return 1\n").unwrap();

        let cache = FingerprintCache::new(16);
        let first = cache.get_or_compute(&path, dir.path()).unwrap();

        fs::write(&path, "def f():\n    return 2\n").unwrap();
        let second = cache.get_or_compute(&path, dir.path()).unwrap();

        assert_ne!(first.content_hash, second.content_hash);
        let (_, misses, _) = cache.stats();
        assert_eq!(misses, 2);
        // Both contents stay cached under their own hash.
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn touch_refreshes_mtime_without_reparse() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.py");
        let source = "def f():\n    return 1\n";
        fs::write(&path, source).unwrap();

        let cache = FingerprintCache::new(16);
        let first = cache.get_or_compute(&path, dir.path()).unwrap();

        std::thread::sleep(std::time::Duration::from_millis(20));
        fs::write(&path, source).unwrap(); // same bytes, new mtime

        let second = cache.get_or_compute(&path, dir.path()).unwrap();
        assert_eq!(first.content_hash, second.content_hash);
        assert!(second.mtime >= first.mtime);
        let (hits, _, _) = cache.stats();
        assert_eq!(hits, 1);
    }

    #[test]
    fn eviction_drops_oldest_tenth() {
        let dir = tempdir().unwrap();
        let cache = FingerprintCache::new(20);

        let mut paths = Vec::new();
        for i in 0..20 {
            let path = dir.path().join(format!("f{i}.py"));
            fs::write(&path, format!("x = {i}\n")).unwrap();
            cache.get_or_compute(&path, dir.path()).unwrap();
            paths.push(path);
        }
        assert_eq!(cache.len(), 20);

        // One more insert triggers a sweep of the two oldest entries.
        let extra = dir.path().join("extra.py");
        fs::write(&extra, "x = 'extra'\n").unwrap();
        cache.get_or_compute(&extra, dir.path()).unwrap();
        assert_eq!(cache.len(), 19);
    }

    #[test]
    fn clear_resets_contents_and_stats() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("m.py");
        fs::write(&path, "x = 1\n").unwrap();

        let cache = FingerprintCache::new(4);
        cache.get_or_compute(&path, dir.path()).unwrap();
        cache.clear();

        assert!(cache.is_empty());
        assert_eq!(cache.stats(), (0, 0, 0.0));
    }
}
