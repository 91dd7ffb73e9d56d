// Dependency store.
//
// A single-file SQLite database mapping test executions to the file
// fingerprints they touched. Writes go through immediate transactions so
// conflicts between parallel workers fail fast into the 30-second busy
// timeout instead of mid-transaction; readers proceed concurrently under
// WAL.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::error::{Error, Result};
use crate::types::{EnvironmentSpec, Fingerprint};

/// Bumped on any incompatible schema or blob-layout change.
pub const SCHEMA_VERSION: &str = "1";

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// One fingerprint row as stored.
#[derive(Clone, Debug)]
pub struct StoredFingerprint {
    pub id: i64,
    pub filename: String,
    pub content_hash: String,
    pub mtime: f64,
    pub checksums: Vec<i32>,
}

/// A finished test waiting for its batch commit.
#[derive(Clone, Debug)]
pub struct PendingExecution {
    pub test_name: String,
    pub duration: Option<f64>,
    pub failed: bool,
    pub forced: bool,
    pub fingerprints: Vec<Fingerprint>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub executions: usize,
    pub files: usize,
    pub fingerprints: usize,
}

pub struct DependencyStore {
    conn: Arc<RwLock<Connection>>,
}

impl std::fmt::Debug for DependencyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependencyStore").finish_non_exhaustive()
    }
}

impl DependencyStore {
    /// Open (creating if necessary) the store at `path`.
    ///
    /// Fails with `StoreCorrupt` when the file is not a database or its
    /// recorded schema version does not match this build.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(parent.to_path_buf(), e))?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA mmap_size = 268435456;
             PRAGMA foreign_keys = ON;",
        )?;
        conn.execute_batch(include_str!("schema.sql"))?;

        let store = Self {
            conn: Arc::new(RwLock::new(conn)),
        };
        store.check_schema_version()?;
        Ok(store)
    }

    fn check_schema_version(&self) -> Result<()> {
        match self.get_metadata("schema_version")? {
            None => {
                self.set_metadata("schema_version", SCHEMA_VERSION)?;
                Ok(())
            }
            Some(version) if version == SCHEMA_VERSION => Ok(()),
            Some(version) => Err(Error::StoreCorrupt(format!(
                "schema version {version}, expected {SCHEMA_VERSION}"
            ))),
        }
    }

    /// Shared handle to the underlying connection, for the merge engine.
    pub(crate) fn raw_conn(&self) -> Arc<RwLock<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Checkpoint the WAL into the main file, truncating the sidecars.
    pub fn close(&self) -> Result<()> {
        let conn = self.conn.write();
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        Ok(())
    }

    // -- metadata ----------------------------------------------------------

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.read();
        let value = conn
            .query_row(
                "SELECT data FROM metadata WHERE dataid = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn set_metadata(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.write();
        conn.execute(
            "INSERT INTO metadata (dataid, data) VALUES (?1, ?2)
             ON CONFLICT(dataid) DO UPDATE SET data = excluded.data",
            params![key, value],
        )?;
        Ok(())
    }

    /// The path prefixes the store was built with, if recorded.
    pub fn get_scope(&self) -> Result<Option<Vec<String>>> {
        match self.get_metadata("scope")? {
            None => Ok(None),
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| Error::StoreCorrupt(format!("unreadable scope metadata: {e}"))),
        }
    }

    pub fn set_scope(&self, scope: &[String]) -> Result<()> {
        let raw = serde_json::to_string(scope)
            .map_err(|e| Error::StoreCorrupt(format!("unencodable scope: {e}")))?;
        self.set_metadata("scope", &raw)
    }

    // -- environments ------------------------------------------------------

    /// Idempotent lookup-or-insert on the unique environment triple.
    pub fn get_or_create_environment(&self, env: &EnvironmentSpec) -> Result<i64> {
        if let Some(id) = self.find_environment(env)? {
            return Ok(id);
        }
        let conn = self.conn.write();
        conn.execute(
            "INSERT OR IGNORE INTO environment
             (environment_name, system_packages, python_version)
             VALUES (?1, ?2, ?3)",
            params![env.name, env.system_packages, env.python_version],
        )?;
        drop(conn);
        // INSERT OR IGNORE + re-select tolerates a concurrent creator.
        self.find_environment(env)?
            .ok_or_else(|| Error::StoreCorrupt("environment vanished after insert".to_string()))
    }

    pub fn find_environment(&self, env: &EnvironmentSpec) -> Result<Option<i64>> {
        let conn = self.conn.read();
        let id = conn
            .query_row(
                "SELECT id FROM environment
                 WHERE environment_name = ?1 AND system_packages = ?2 AND python_version = ?3",
                params![env.name, env.system_packages, env.python_version],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    // -- test executions ---------------------------------------------------

    /// Commit a batch of finished tests in one immediate transaction.
    ///
    /// For each execution: prior rows for the same (environment, test)
    /// are deleted (their junction rows cascade), fingerprints are
    /// upserted on their identity triple, and the new row plus its edges
    /// are inserted. Orphaned fingerprints are pruned at the end of the
    /// batch.
    pub fn save_test_executions(&self, env_id: i64, batch: &[PendingExecution]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for pending in batch {
            tx.execute(
                "DELETE FROM test_execution WHERE environment_id = ?1 AND test_name = ?2",
                params![env_id, pending.test_name],
            )?;
            tx.execute(
                "INSERT INTO test_execution (environment_id, test_name, duration, failed, forced)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    env_id,
                    pending.test_name,
                    pending.duration,
                    pending.failed as i64,
                    pending.forced as i64,
                ],
            )?;
            let execution_id = tx.last_insert_rowid();

            for fp in &pending.fingerprints {
                let fp_id = upsert_fingerprint(&tx, fp)?;
                tx.execute(
                    "INSERT OR IGNORE INTO test_execution_file_fp
                     (test_execution_id, fingerprint_id) VALUES (?1, ?2)",
                    params![execution_id, fp_id],
                )?;
            }
        }

        tx.execute(
            "DELETE FROM file_fp WHERE id NOT IN
             (SELECT DISTINCT fingerprint_id FROM test_execution_file_fp)",
            [],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Update the outcome columns of an existing execution row without
    /// touching its dependency edges. No-op when the row does not exist.
    pub fn update_test_outcome(
        &self,
        env_id: i64,
        test_name: &str,
        duration: Option<f64>,
        failed: bool,
    ) -> Result<()> {
        let mut conn = self.conn.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE test_execution SET failed = ?1, duration = COALESCE(?2, duration)
             WHERE environment_id = ?3 AND test_name = ?4",
            params![failed as i64, duration, env_id, test_name],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Every test name with an execution row in this environment.
    pub fn known_test_names(&self, env_id: i64) -> Result<HashSet<String>> {
        let conn = self.conn.read();
        let mut stmt =
            conn.prepare("SELECT test_name FROM test_execution WHERE environment_id = ?1")?;
        let names = stmt
            .query_map(params![env_id], |row| row.get(0))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        Ok(names)
    }

    pub fn execution_count(&self, env_id: i64) -> Result<usize> {
        let conn = self.conn.read();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM test_execution WHERE environment_id = ?1",
            params![env_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // -- fingerprints ------------------------------------------------------

    /// All fingerprint rows, grouped by filename. Change detection loads
    /// this once instead of querying per file.
    pub fn fingerprint_records(&self) -> Result<HashMap<String, Vec<StoredFingerprint>>> {
        let conn = self.conn.read();
        let mut stmt =
            conn.prepare("SELECT id, filename, fsha, mtime, method_checksums FROM file_fp")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, Vec<u8>>(4)?,
            ))
        })?;

        let mut by_file: HashMap<String, Vec<StoredFingerprint>> = HashMap::new();
        for row in rows {
            let (id, filename, content_hash, mtime, blob) = row?;
            let checksums = deserialize_checksums(&blob)?;
            by_file
                .entry(filename.clone())
                .or_default()
                .push(StoredFingerprint {
                    id,
                    filename,
                    content_hash,
                    mtime: mtime.unwrap_or(0.0),
                    checksums,
                });
        }
        Ok(by_file)
    }

    pub fn list_fingerprints_for_file(&self, filename: &str) -> Result<Vec<StoredFingerprint>> {
        let conn = self.conn.read();
        let mut stmt = conn.prepare(
            "SELECT id, filename, fsha, mtime, method_checksums
             FROM file_fp WHERE filename = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![filename], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<f64>>(3)?,
                row.get::<_, Vec<u8>>(4)?,
            ))
        })?;

        let mut fps = Vec::new();
        for row in rows {
            let (id, filename, content_hash, mtime, blob) = row?;
            fps.push(StoredFingerprint {
                id,
                filename,
                content_hash,
                mtime: mtime.unwrap_or(0.0),
                checksums: deserialize_checksums(&blob)?,
            });
        }
        Ok(fps)
    }

    /// Remove every fingerprint row for a file that no longer exists.
    /// Junction rows cascade; executions keep their other edges.
    pub fn delete_fingerprints_for_file(&self, filename: &str) -> Result<()> {
        let mut conn = self.conn.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM file_fp WHERE filename = ?1", params![filename])?;
        tx.commit()?;
        Ok(())
    }

    /// Refresh the stored mtime after a Level-2 hash match confirmed the
    /// content did not change.
    pub fn touch_file_mtime(&self, filename: &str, mtime: f64) -> Result<()> {
        let conn = self.conn.write();
        conn.execute(
            "UPDATE file_fp SET mtime = ?1 WHERE filename = ?2",
            params![mtime, filename],
        )?;
        Ok(())
    }

    // -- affected-test resolution ------------------------------------------

    /// Tests whose dependency fingerprints intersect the changed-checksum
    /// sets, plus every test whose latest execution failed.
    ///
    /// One read transaction, one parameterized query over all changed
    /// files; each distinct checksum blob is deserialized at most once.
    pub fn affected_tests(
        &self,
        env_id: i64,
        changed: &HashMap<String, Vec<i32>>,
    ) -> Result<BTreeSet<String>> {
        let conn = self.conn.read();
        let tx = conn.unchecked_transaction()?;

        let mut affected = BTreeSet::new();

        if !changed.is_empty() {
            let filenames: Vec<&str> = changed.keys().map(|s| s.as_str()).collect();
            let placeholders: String = (2..=filenames.len() + 1)
                .map(|i| format!("?{i}"))
                .collect::<Vec<_>>()
                .join(", ");
            let query = format!(
                "SELECT fp.id, fp.filename, fp.method_checksums, te.test_name
                 FROM file_fp fp
                 JOIN test_execution_file_fp teff ON teff.fingerprint_id = fp.id
                 JOIN test_execution te ON te.id = teff.test_execution_id
                 WHERE te.environment_id = ?1 AND fp.filename IN ({placeholders})"
            );

            let changed_sets: HashMap<&str, HashSet<i32>> = changed
                .iter()
                .map(|(file, checksums)| (file.as_str(), checksums.iter().copied().collect()))
                .collect();

            let mut stmt = tx.prepare(&query)?;
            let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&env_id];
            params_vec.extend(filenames.iter().map(|f| f as &dyn rusqlite::ToSql));

            // fingerprint row id -> did its checksum set intersect
            let mut hit_cache: HashMap<i64, bool> = HashMap::new();

            let rows = stmt.query_map(params_vec.as_slice(), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            for row in rows {
                let (fp_id, filename, blob, test_name) = row?;
                let hit = match hit_cache.get(&fp_id) {
                    Some(&hit) => hit,
                    None => {
                        let checksums = deserialize_checksums(&blob)?;
                        let hit = changed_sets
                            .get(filename.as_str())
                            .map(|set| checksums.iter().any(|c| set.contains(c)))
                            .unwrap_or(false);
                        hit_cache.insert(fp_id, hit);
                        hit
                    }
                };
                if hit {
                    affected.insert(test_name);
                }
            }
        }

        // Failing tests stay selected until they pass, regardless of the
        // change analysis.
        let mut stmt = tx.prepare(
            "SELECT test_name FROM test_execution WHERE environment_id = ?1 AND failed = 1",
        )?;
        let failing = stmt.query_map(params![env_id], |row| row.get::<_, String>(0))?;
        for name in failing {
            affected.insert(name?);
        }

        Ok(affected)
    }

    // -- diagnostics -------------------------------------------------------

    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.read();
        let executions: i64 =
            conn.query_row("SELECT COUNT(*) FROM test_execution", [], |row| row.get(0))?;
        let files: i64 = conn.query_row("SELECT COUNT(DISTINCT filename) FROM file_fp", [], |row| {
            row.get(0)
        })?;
        let fingerprints: i64 =
            conn.query_row("SELECT COUNT(*) FROM file_fp", [], |row| row.get(0))?;
        Ok(StoreStats {
            executions: executions as usize,
            files: files as usize,
            fingerprints: fingerprints as usize,
        })
    }
}

/// Find or insert a fingerprint row, matching on the identity triple.
fn upsert_fingerprint(tx: &rusqlite::Transaction<'_>, fp: &Fingerprint) -> Result<i64> {
    let blob = serialize_checksums(&fp.checksums);
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM file_fp
             WHERE filename = ?1 AND fsha = ?2 AND method_checksums = ?3",
            params![fp.filename, fp.content_hash, blob],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    tx.execute(
        "INSERT INTO file_fp (filename, method_checksums, mtime, fsha)
         VALUES (?1, ?2, ?3, ?4)",
        params![fp.filename, blob, fp.mtime, fp.content_hash],
    )?;
    Ok(tx.last_insert_rowid())
}

/// Pack checksums as little-endian 4-byte signed integers, source order.
pub(crate) fn serialize_checksums(checksums: &[i32]) -> Vec<u8> {
    checksums.iter().flat_map(|c| c.to_le_bytes()).collect()
}

pub(crate) fn deserialize_checksums(blob: &[u8]) -> Result<Vec<i32>> {
    if blob.len() % 4 != 0 {
        return Err(Error::StoreCorrupt(format!(
            "checksum blob of {} bytes is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}
