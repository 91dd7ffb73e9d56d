// Store merging.
//
// Combines N store shards (e.g. one per parallel CI worker) into one
// output store. Inputs are opened read-only and copied under one
// immediate transaction each: environments dedup on their unique triple,
// fingerprints on their identity triple, and executions replace earlier
// rows for the same (environment, test) — so later inputs win ties, and
// the operation is associative up to that tie-break.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::error::{Error, Result};
use crate::store::{deserialize_checksums, DependencyStore, SCHEMA_VERSION};

/// Per-input row counts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeStats {
    pub input: PathBuf,
    pub environments: usize,
    pub fingerprints: usize,
    pub executions: usize,
}

/// Merge every input store into `output`, in order.
///
/// The output is created if missing and may already contain data; merging
/// into a populated store follows the same tie-break rules.
pub fn merge_stores<P: AsRef<Path>>(output: &Path, inputs: &[P]) -> Result<Vec<MergeStats>> {
    let out = DependencyStore::open(output)?;
    let mut stats = Vec::with_capacity(inputs.len());
    let mut scope: Vec<String> = out.get_scope()?.unwrap_or_default();

    for input in inputs {
        let input = input.as_ref();
        let merged = merge_one(&out, input)?;
        debug!(
            input = %input.display(),
            executions = merged.0.executions,
            "merged input store"
        );
        for prefix in merged.1 {
            if !scope.contains(&prefix) {
                scope.push(prefix);
            }
        }
        stats.push(merged.0);
    }

    scope.sort();
    if !scope.is_empty() {
        out.set_scope(&scope)?;
    }
    out.close()?;
    Ok(stats)
}

fn merge_one(out: &DependencyStore, input: &Path) -> Result<(MergeStats, Vec<String>)> {
    let src = Connection::open_with_flags(
        input,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    let version: Option<String> = src
        .query_row(
            "SELECT data FROM metadata WHERE dataid = 'schema_version'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if version.as_deref() != Some(SCHEMA_VERSION) {
        return Err(Error::StoreCorrupt(format!(
            "input {} has schema version {:?}, expected {SCHEMA_VERSION}",
            input.display(),
            version
        )));
    }

    let scope: Vec<String> = src
        .query_row(
            "SELECT data FROM metadata WHERE dataid = 'scope'",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| Error::StoreCorrupt(format!("unreadable scope metadata: {e}")))?
        .unwrap_or_default();

    let environments = read_environments(&src)?;
    let fingerprints = read_fingerprints(&src)?;
    let executions = read_executions(&src)?;
    let junctions = read_junctions(&src)?;

    let stats = MergeStats {
        input: input.to_path_buf(),
        environments: environments.len(),
        fingerprints: fingerprints.len(),
        executions: executions.len(),
    };

    let conn = out.raw_conn();
    let mut conn = conn.write();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut env_map: HashMap<i64, i64> = HashMap::new();
    for env in &environments {
        let id = find_or_insert_environment(&tx, env)?;
        env_map.insert(env.id, id);
    }

    let mut fp_map: HashMap<i64, i64> = HashMap::new();
    for fp in &fingerprints {
        // Validate the blob before it propagates into the output.
        deserialize_checksums(&fp.blob)?;
        let id = find_or_insert_fingerprint(&tx, fp)?;
        fp_map.insert(fp.id, id);
    }

    let mut exec_map: HashMap<i64, i64> = HashMap::new();
    for exec in &executions {
        let Some(&env_id) = env_map.get(&exec.environment_id) else {
            continue; // dangling row in the input; skip
        };
        // Last write wins on (environment, test): drop whatever an
        // earlier input (or the output's own past) recorded.
        tx.execute(
            "DELETE FROM test_execution WHERE environment_id = ?1 AND test_name = ?2",
            params![env_id, exec.test_name],
        )?;
        tx.execute(
            "INSERT INTO test_execution (environment_id, test_name, duration, failed, forced)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![env_id, exec.test_name, exec.duration, exec.failed, exec.forced],
        )?;
        exec_map.insert(exec.id, tx.last_insert_rowid());
    }

    for (exec_id, fp_id) in &junctions {
        let (Some(&exec_id), Some(&fp_id)) = (exec_map.get(exec_id), fp_map.get(fp_id)) else {
            continue;
        };
        tx.execute(
            "INSERT OR IGNORE INTO test_execution_file_fp (test_execution_id, fingerprint_id)
             VALUES (?1, ?2)",
            params![exec_id, fp_id],
        )?;
    }

    tx.commit()?;
    Ok((stats, scope))
}

struct SrcEnvironment {
    id: i64,
    name: String,
    system_packages: String,
    python_version: String,
}

struct SrcFingerprint {
    id: i64,
    filename: String,
    blob: Vec<u8>,
    mtime: Option<f64>,
    fsha: String,
}

struct SrcExecution {
    id: i64,
    environment_id: i64,
    test_name: String,
    duration: Option<f64>,
    failed: i64,
    forced: i64,
}

fn read_environments(src: &Connection) -> Result<Vec<SrcEnvironment>> {
    let mut stmt = src.prepare(
        "SELECT id, environment_name, system_packages, python_version FROM environment ORDER BY id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SrcEnvironment {
                id: row.get(0)?,
                name: row.get(1)?,
                system_packages: row.get(2)?,
                python_version: row.get(3)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn read_fingerprints(src: &Connection) -> Result<Vec<SrcFingerprint>> {
    let mut stmt =
        src.prepare("SELECT id, filename, method_checksums, mtime, fsha FROM file_fp ORDER BY id")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SrcFingerprint {
                id: row.get(0)?,
                filename: row.get(1)?,
                blob: row.get(2)?,
                mtime: row.get(3)?,
                fsha: row.get(4)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn read_executions(src: &Connection) -> Result<Vec<SrcExecution>> {
    let mut stmt = src.prepare(
        "SELECT id, environment_id, test_name, duration, failed, forced
         FROM test_execution ORDER BY id",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(SrcExecution {
                id: row.get(0)?,
                environment_id: row.get(1)?,
                test_name: row.get(2)?,
                duration: row.get(3)?,
                failed: row.get(4)?,
                forced: row.get(5)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn read_junctions(src: &Connection) -> Result<Vec<(i64, i64)>> {
    let mut stmt = src.prepare(
        "SELECT test_execution_id, fingerprint_id FROM test_execution_file_fp
         ORDER BY test_execution_id, fingerprint_id",
    )?;
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn find_or_insert_environment(tx: &rusqlite::Transaction<'_>, env: &SrcEnvironment) -> Result<i64> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM environment
             WHERE environment_name = ?1 AND system_packages = ?2 AND python_version = ?3",
            params![env.name, env.system_packages, env.python_version],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    tx.execute(
        "INSERT INTO environment (environment_name, system_packages, python_version)
         VALUES (?1, ?2, ?3)",
        params![env.name, env.system_packages, env.python_version],
    )?;
    Ok(tx.last_insert_rowid())
}

fn find_or_insert_fingerprint(tx: &rusqlite::Transaction<'_>, fp: &SrcFingerprint) -> Result<i64> {
    let existing: Option<i64> = tx
        .query_row(
            "SELECT id FROM file_fp
             WHERE filename = ?1 AND fsha = ?2 AND method_checksums = ?3",
            params![fp.filename, fp.fsha, fp.blob],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(id) = existing {
        return Ok(id);
    }
    tx.execute(
        "INSERT INTO file_fp (filename, method_checksums, mtime, fsha)
         VALUES (?1, ?2, ?3, ?4)",
        params![fp.filename, fp.blob, fp.mtime, fp.fsha],
    )?;
    Ok(tx.last_insert_rowid())
}
