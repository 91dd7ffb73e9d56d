// Baseline/incremental orchestration.
//
// The engine owns the store and the fingerprint cache, decides which
// collected tests run, and writes executions back after the host reports
// results. Baseline sessions record full dependency edges in batches;
// incremental sessions only update the outcome columns of existing rows,
// so a failure observed under incremental keeps its test selected and a
// later pass releases it.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, warn};

use crate::cache::FingerprintCache;
use crate::changes::detect_changes;
use crate::config::Config;
use crate::error::Result;
use crate::fingerprint::{coverage_fingerprints, fingerprint_file};
use crate::store::{DependencyStore, PendingExecution, StoreStats};
use crate::types::{ChangedFiles, EnvironmentSpec, TestOutcome};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Populate or update the store with fresh test-to-block edges.
    Baseline,
    /// Select from the current store without rewriting edges.
    Incremental,
}

/// What the runner should do with the collected tests.
#[derive(Clone, Debug, Default)]
pub struct Plan {
    pub run: BTreeSet<String>,
    pub skip: BTreeSet<String>,
    pub warnings: Vec<String>,
    /// The change analysis behind the selection, when one ran.
    pub changed: ChangedFiles,
}

impl Plan {
    fn run_all(collected: &[String], warnings: Vec<String>) -> Self {
        Plan {
            run: collected.iter().cloned().collect(),
            skip: BTreeSet::new(),
            warnings,
            changed: ChangedFiles::default(),
        }
    }
}

enum RecordPolicy {
    /// Record full executions with dependency edges (baseline).
    Full,
    /// Only update failed/duration on existing rows (incremental).
    OutcomeOnly,
}

struct Session {
    env_id: Option<i64>,
    policy: RecordPolicy,
}

pub struct Engine {
    config: Config,
    store: DependencyStore,
    cache: FingerprintCache,
    session: Option<Session>,
    pending: Vec<PendingExecution>,
    /// Files the plan-time analysis found deleted; their stale
    /// fingerprints are dropped once the baseline batch lands.
    deleted_at_plan: Vec<String>,
}

impl Engine {
    /// Open the store (creating it if needed) and set up the cache.
    pub fn open(config: Config) -> Result<Self> {
        let store = DependencyStore::open(&config.db_path)?;
        let cache = FingerprintCache::new(config.cache_size);
        Ok(Self {
            config,
            store,
            cache,
            session: None,
            pending: Vec::new(),
            deleted_at_plan: Vec::new(),
        })
    }

    /// Decide which collected tests to run and which to skip, and arm the
    /// session for the matching write policy.
    pub fn plan(
        &mut self,
        env: &EnvironmentSpec,
        collected: &[String],
        mode: RunMode,
        force: bool,
        scope: &[String],
    ) -> Result<Plan> {
        self.pending.clear();
        self.deleted_at_plan.clear();

        let plan = match mode {
            RunMode::Baseline => self.plan_baseline(env, collected, force, scope)?,
            RunMode::Incremental => self.plan_incremental(env, collected, scope)?,
        };
        debug!(
            run = plan.run.len(),
            skip = plan.skip.len(),
            warnings = plan.warnings.len(),
            "plan ready"
        );
        Ok(plan)
    }

    fn plan_baseline(
        &mut self,
        env: &EnvironmentSpec,
        collected: &[String],
        force: bool,
        scope: &[String],
    ) -> Result<Plan> {
        let env_id = self.store.get_or_create_environment(env)?;
        self.session = Some(Session {
            env_id: Some(env_id),
            policy: RecordPolicy::Full,
        });

        let mut warnings = Vec::new();
        let populated = self.store.execution_count(env_id)? > 0;
        let scope_superset = self.scope_superset(scope, populated, &mut warnings)?;
        self.record_scope(scope)?;

        if force || !populated || scope_superset {
            return Ok(Plan::run_all(collected, warnings));
        }

        // Incremental baseline: re-run only what moved, plus tests the
        // store has never seen; untouched rows stay as they are.
        let changed = detect_changes(&self.config.project_root, &self.store, &self.cache)?;
        self.deleted_at_plan = changed.deleted_files.clone();
        let affected = self.store.affected_tests(env_id, &changed.changed_blocks)?;
        let known = self.store.known_test_names(env_id)?;

        Ok(selection(collected, &affected, &known, warnings, changed))
    }

    fn plan_incremental(
        &mut self,
        env: &EnvironmentSpec,
        collected: &[String],
        scope: &[String],
    ) -> Result<Plan> {
        let Some(env_id) = self.store.find_environment(env)? else {
            warn!(environment = env.name.as_str(), "environment not in store; running all tests");
            self.session = Some(Session {
                env_id: None,
                policy: RecordPolicy::OutcomeOnly,
            });
            return Ok(Plan::run_all(
                collected,
                vec![format!(
                    "environment '{}' has no recorded executions; running all tests",
                    env.name
                )],
            ));
        };

        self.session = Some(Session {
            env_id: Some(env_id),
            policy: RecordPolicy::OutcomeOnly,
        });

        let mut warnings = Vec::new();
        let populated = self.store.execution_count(env_id)? > 0;
        if !populated {
            warnings.push("store has no executions for this environment; running all tests".into());
            warn!("empty store under incremental mode; running all tests");
            return Ok(Plan::run_all(collected, warnings));
        }
        self.scope_superset(scope, populated, &mut warnings)?;

        let changed = detect_changes(&self.config.project_root, &self.store, &self.cache)?;
        let affected = self.store.affected_tests(env_id, &changed.changed_blocks)?;
        let known = self.store.known_test_names(env_id)?;

        Ok(selection(collected, &affected, &known, warnings, changed))
    }

    /// Warn when the current collection scope reaches outside what the
    /// store was built with. Subsets pass silently.
    fn scope_superset(
        &self,
        scope: &[String],
        populated: bool,
        warnings: &mut Vec<String>,
    ) -> Result<bool> {
        if !populated {
            return Ok(false);
        }
        let Some(stored) = self.store.get_scope()? else {
            return Ok(false);
        };
        if scope_covered(scope, &stored) {
            return Ok(false);
        }
        warnings.push(format!(
            "collection scope {:?} is wider than the stored scope {:?}; \
             tests outside the stored scope have no recorded dependencies",
            scope, stored
        ));
        warn!(?scope, ?stored, "collection scope exceeds stored scope");
        Ok(true)
    }

    fn record_scope(&self, scope: &[String]) -> Result<()> {
        let mut merged: BTreeSet<String> = self.store.get_scope()?.unwrap_or_default().into_iter().collect();
        if scope.is_empty() {
            merged.insert(String::new());
        } else {
            merged.extend(scope.iter().cloned());
        }
        let merged: Vec<String> = merged.into_iter().collect();
        self.store.set_scope(&merged)
    }

    /// Buffer (baseline) or apply (incremental) one reported result.
    pub fn record_result(&mut self, outcome: TestOutcome) -> Result<()> {
        let Some(session) = &self.session else {
            warn!(test = outcome.test_name.as_str(), "result reported before plan; ignoring");
            return Ok(());
        };
        let Some(env_id) = session.env_id else {
            return Ok(());
        };

        match session.policy {
            RecordPolicy::OutcomeOnly => {
                self.store
                    .update_test_outcome(env_id, &outcome.test_name, outcome.duration, outcome.failed)
            }
            RecordPolicy::Full => {
                let mut fingerprints = coverage_fingerprints(
                    &outcome.touched_files,
                    &self.config.project_root,
                    &self.cache,
                );
                if fingerprints.is_empty() {
                    // Hosts without coverage still get the test's own file
                    // as a dependency, so edits to it re-select the test.
                    if let Some(own_file) = outcome.test_name.split("::").next() {
                        let path = self.config.project_root.join(own_file);
                        if let Ok(fp) = fingerprint_file(&path, &self.config.project_root) {
                            fingerprints.push(fp.without_blocks());
                        }
                    }
                }

                self.pending.push(PendingExecution {
                    test_name: outcome.test_name,
                    duration: outcome.duration,
                    failed: outcome.failed,
                    forced: outcome.forced,
                    fingerprints,
                });
                if self.pending.len() >= self.config.batch_size {
                    self.flush_pending(env_id)?;
                }
                Ok(())
            }
        }
    }

    /// Commit buffered executions and drop fingerprints of files the
    /// plan-time analysis found deleted.
    pub fn flush(&mut self) -> Result<()> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        let Some(env_id) = session.env_id else {
            return Ok(());
        };
        if matches!(session.policy, RecordPolicy::Full) {
            self.flush_pending(env_id)?;
            for filename in std::mem::take(&mut self.deleted_at_plan) {
                self.store.delete_fingerprints_for_file(&filename)?;
            }
        }
        Ok(())
    }

    fn flush_pending(&mut self, env_id: i64) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        debug!(batch = batch.len(), "committing execution batch");
        self.store.save_test_executions(env_id, &batch)
    }

    /// Checkpoint the store's WAL into the main file.
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        self.store.close()
    }

    pub fn store_stats(&self) -> Result<StoreStats> {
        self.store.stats()
    }

    /// (hits, misses, hit rate) of the fingerprint cache.
    pub fn cache_stats(&self) -> (usize, usize, f64) {
        self.cache.stats()
    }
}

/// Affected ∪ never-seen, restricted to the collection.
fn selection(
    collected: &[String],
    affected: &BTreeSet<String>,
    known: &HashSet<String>,
    warnings: Vec<String>,
    changed: ChangedFiles,
) -> Plan {
    let mut run = BTreeSet::new();
    let mut skip = BTreeSet::new();
    for test in collected {
        if affected.contains(test) || !known.contains(test) {
            run.insert(test.clone());
        } else {
            skip.insert(test.clone());
        }
    }
    Plan {
        run,
        skip,
        warnings,
        changed,
    }
}

/// True when every current prefix is inside some stored prefix. An empty
/// prefix stands for the whole project root.
fn scope_covered(current: &[String], stored: &[String]) -> bool {
    let whole_root = |s: &str| s.is_empty() || s == ".";
    if stored.iter().any(|s| whole_root(s)) {
        return true;
    }
    if current.is_empty() {
        // Whole-root collection against a narrower stored scope.
        return false;
    }
    current.iter().all(|c| {
        stored.iter().any(|s| {
            c == s
                || (c.starts_with(s.as_str())
                    && c.as_bytes().get(s.len()) == Some(&b'/'))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    fn env() -> EnvironmentSpec {
        EnvironmentSpec::new("default", "", "3.12.0")
    }

    struct Harness {
        dir: TempDir,
        engine: Engine,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let config = Config::new(dir.path()).with_batch_size(2);
            let engine = Engine::open(config).unwrap();
            Self { dir, engine }
        }

        fn root(&self) -> &Path {
            self.dir.path()
        }

        fn write(&self, name: &str, source: &str) {
            fs::write(self.root().join(name), source).unwrap();
        }

        /// Simulated coverage: the test touched every line of each file.
        fn touched(&self, files: &[&str]) -> HashMap<String, Vec<usize>> {
            files
                .iter()
                .map(|f| {
                    let source = fs::read_to_string(self.root().join(f)).unwrap();
                    let lines: Vec<usize> = (1..=source.lines().count().max(1)).collect();
                    (f.to_string(), lines)
                })
                .collect()
        }

        fn outcome(&self, test: &str, failed: bool, files: &[&str]) -> TestOutcome {
            TestOutcome {
                test_name: test.to_string(),
                duration: Some(0.05),
                failed,
                forced: false,
                touched_files: self.touched(files),
            }
        }

        /// Baseline run of a passing test suite over the given files.
        fn baseline(&mut self, tests: &[(&str, &[&str])]) {
            let collected: Vec<String> = tests.iter().map(|(t, _)| t.to_string()).collect();
            let plan = self
                .engine
                .plan(&env(), &collected, RunMode::Baseline, false, &[])
                .unwrap();
            for (test, files) in tests {
                if plan.run.contains(*test) {
                    let outcome = self.outcome(test, false, files);
                    self.engine.record_result(outcome).unwrap();
                }
            }
            self.engine.flush().unwrap();
        }

        fn plan_diff(&mut self, collected: &[&str]) -> Plan {
            let collected: Vec<String> = collected.iter().map(|s| s.to_string()).collect();
            self.engine
                .plan(&env(), &collected, RunMode::Incremental, false, &[])
                .unwrap()
        }
    }

    #[test]
    fn first_baseline_runs_everything() {
        let mut h = Harness::new();
        h.write("m.py", "def f():\n    return 1\n");
        h.write("test_m.py", "from m import f\ndef test_f():\n    assert f() == 1\n");

        let plan = h
            .engine
            .plan(
                &env(),
                &["test_m.py::test_f".to_string()],
                RunMode::Baseline,
                false,
                &[],
            )
            .unwrap();
        assert_eq!(plan.run.len(), 1);
        assert!(plan.skip.is_empty());
        assert!(plan.warnings.is_empty());
    }

    #[test]
    fn unchanged_project_skips_everything() {
        // Scenario: baseline, then an incremental run with no edits.
        let mut h = Harness::new();
        h.write("m.py", "def f():\n    return 1\n");
        h.write("test_m.py", "from m import f\ndef test_f():\n    assert f() == 1\n");
        h.baseline(&[("test_m.py::test_f", &["m.py", "test_m.py"])]);

        let plan = h.plan_diff(&["test_m.py::test_f"]);
        assert!(plan.run.is_empty());
        assert_eq!(plan.skip.len(), 1);
        assert!(plan.skip.contains("test_m.py::test_f"));
    }

    #[test]
    fn edit_selects_dependent_test_and_failure_keeps_it_selected() {
        // Scenario: edit a dependency, watch the test stay selected while
        // it fails and drop out once it passes.
        let mut h = Harness::new();
        h.write("m.py", "def f():\n    return 1\n");
        h.write("test_m.py", "from m import f\ndef test_f():\n    assert f() == 1\n");
        h.baseline(&[("test_m.py::test_f", &["m.py", "test_m.py"])]);

        std::thread::sleep(std::time::Duration::from_millis(20));
        h.write("m.py", "def f():\n    return 2\n");

        let plan = h.plan_diff(&["test_m.py::test_f"]);
        assert!(plan.run.contains("test_m.py::test_f"));

        // The selected test fails; incremental recording keeps the edges
        // but flips the flag.
        let outcome = h.outcome("test_m.py::test_f", true, &["m.py", "test_m.py"]);
        h.engine.record_result(outcome).unwrap();
        h.engine.flush().unwrap();

        // No further edits: the failing test is still selected.
        let plan = h.plan_diff(&["test_m.py::test_f"]);
        assert!(plan.run.contains("test_m.py::test_f"));

        // It passes; the next run releases it. (The dependency edges
        // still point at the old fingerprint, so the file edit keeps
        // reselecting it until a baseline refresh — clear it first.)
        let outcome = h.outcome("test_m.py::test_f", false, &["m.py", "test_m.py"]);
        h.engine.record_result(outcome).unwrap();
        h.engine.flush().unwrap();
        h.baseline(&[("test_m.py::test_f", &["m.py", "test_m.py"])]);

        let plan = h.plan_diff(&["test_m.py::test_f"]);
        assert!(plan.run.is_empty());
    }

    #[test]
    fn never_seen_test_is_always_selected() {
        let mut h = Harness::new();
        h.write("m.py", "def f():\n    return 1\n");
        h.write("test_m.py", "from m import f\ndef test_f():\n    assert f() == 1\n");
        h.baseline(&[("test_m.py::test_f", &["m.py", "test_m.py"])]);

        let plan = h.plan_diff(&["test_m.py::test_f", "test_new.py::test_g"]);
        assert!(plan.run.contains("test_new.py::test_g"));
        assert!(plan.skip.contains("test_m.py::test_f"));
    }

    #[test]
    fn incremental_with_empty_store_warns_and_runs_all() {
        let mut h = Harness::new();
        h.write("test_m.py", "def test_f():\n    assert True\n");

        let plan = h.plan_diff(&["test_m.py::test_f"]);
        assert_eq!(plan.run.len(), 1);
        assert!(!plan.warnings.is_empty());
    }

    #[test]
    fn forced_baseline_runs_all_despite_clean_tree() {
        let mut h = Harness::new();
        h.write("m.py", "def f():\n    return 1\n");
        h.write("test_m.py", "from m import f\ndef test_f():\n    assert f() == 1\n");
        h.baseline(&[("test_m.py::test_f", &["m.py", "test_m.py"])]);

        let plan = h
            .engine
            .plan(
                &env(),
                &["test_m.py::test_f".to_string()],
                RunMode::Baseline,
                true,
                &[],
            )
            .unwrap();
        assert_eq!(plan.run.len(), 1);
        assert!(plan.skip.is_empty());
    }

    #[test]
    fn incremental_baseline_reruns_only_the_affected_subset() {
        let mut h = Harness::new();
        h.write("a.py", "def fa():\n    return 1\n");
        h.write("b.py", "def fb():\n    return 2\n");
        h.write("test_a.py", "from a import fa\ndef test_a():\n    assert fa() == 1\n");
        h.write("test_b.py", "from b import fb\ndef test_b():\n    assert fb() == 2\n");
        h.baseline(&[
            ("test_a.py::test_a", &["a.py", "test_a.py"]),
            ("test_b.py::test_b", &["b.py", "test_b.py"]),
        ]);

        std::thread::sleep(std::time::Duration::from_millis(20));
        h.write("a.py", "def fa():\n    return 11\n");

        let collected = vec!["test_a.py::test_a".to_string(), "test_b.py::test_b".to_string()];
        let plan = h
            .engine
            .plan(&env(), &collected, RunMode::Baseline, false, &[])
            .unwrap();
        assert!(plan.run.contains("test_a.py::test_a"));
        assert!(plan.skip.contains("test_b.py::test_b"));

        // Re-record the affected test; the untouched row must survive.
        let outcome = h.outcome("test_a.py::test_a", false, &["a.py", "test_a.py"]);
        h.engine.record_result(outcome).unwrap();
        h.engine.flush().unwrap();

        let plan = h.plan_diff(&["test_a.py::test_a", "test_b.py::test_b"]);
        assert!(plan.run.is_empty());
        assert_eq!(plan.skip.len(), 2);
    }

    #[test]
    fn baseline_twice_without_changes_is_idempotent() {
        let mut h = Harness::new();
        h.write("m.py", "def f():\n    return 1\n");
        h.write("test_m.py", "from m import f\ndef test_f():\n    assert f() == 1\n");
        h.baseline(&[("test_m.py::test_f", &["m.py", "test_m.py"])]);
        let before = h.engine.store_stats().unwrap();

        // Second baseline selects nothing, so nothing is rewritten.
        let plan = h
            .engine
            .plan(
                &env(),
                &["test_m.py::test_f".to_string()],
                RunMode::Baseline,
                false,
                &[],
            )
            .unwrap();
        assert!(plan.run.is_empty());
        h.engine.flush().unwrap();

        assert_eq!(h.engine.store_stats().unwrap(), before);
    }

    #[test]
    fn batch_overflow_commits_midway() {
        let mut h = Harness::new();
        for i in 0..3 {
            h.write(&format!("test_{i}.py"), &format!("def test_{i}():\n    assert True\n"));
        }
        let collected: Vec<String> = (0..3).map(|i| format!("test_{i}.py::test_{i}")).collect();
        h.engine
            .plan(&env(), &collected, RunMode::Baseline, false, &[])
            .unwrap();

        // batch_size is 2: the first two results commit on overflow.
        for i in 0..2 {
            let file = format!("test_{i}.py");
            let outcome = h.outcome(&format!("test_{i}.py::test_{i}"), false, &[&file]);
            h.engine.record_result(outcome).unwrap();
        }
        assert_eq!(h.engine.store_stats().unwrap().executions, 2);

        let outcome = h.outcome("test_2.py::test_2", false, &["test_2.py"]);
        h.engine.record_result(outcome).unwrap();
        assert_eq!(h.engine.store_stats().unwrap().executions, 2);
        h.engine.flush().unwrap();
        assert_eq!(h.engine.store_stats().unwrap().executions, 3);
    }

    #[test]
    fn deleted_file_selects_dependents_then_baseline_prunes_it() {
        let mut h = Harness::new();
        h.write("m.py", "def f():\n    return 1\n");
        h.write(
            "test_m.py",
            "try:\n    from m import f\nexcept ImportError:\n    f = lambda: 1\ndef test_f():\n    assert f() == 1\n",
        );
        h.baseline(&[("test_m.py::test_f", &["m.py", "test_m.py"])]);

        fs::remove_file(h.root().join("m.py")).unwrap();

        let plan = h.plan_diff(&["test_m.py::test_f"]);
        assert!(plan.run.contains("test_m.py::test_f"));

        // A baseline pass after the deletion drops the stale fingerprints.
        let collected = vec!["test_m.py::test_f".to_string()];
        let plan = h
            .engine
            .plan(&env(), &collected, RunMode::Baseline, false, &[])
            .unwrap();
        assert!(plan.run.contains("test_m.py::test_f"));
        let outcome = h.outcome("test_m.py::test_f", false, &["test_m.py"]);
        h.engine.record_result(outcome).unwrap();
        h.engine.flush().unwrap();

        assert!(h
            .engine
            .store
            .list_fingerprints_for_file("m.py")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn scope_subset_is_silent_superset_warns() {
        let mut h = Harness::new();
        fs::create_dir_all(h.root().join("tests/unit")).unwrap();
        fs::create_dir_all(h.root().join("tests/integration")).unwrap();
        h.write("tests/unit/test_u.py", "def test_u():\n    assert True\n");
        h.write("tests/integration/test_i.py", "def test_i():\n    assert True\n");

        let collected = vec!["tests/unit/test_u.py::test_u".to_string()];
        h.engine
            .plan(&env(), &collected, RunMode::Baseline, false, &["tests/unit".to_string()])
            .unwrap();
        let outcome = h.outcome("tests/unit/test_u.py::test_u", false, &["tests/unit/test_u.py"]);
        h.engine.record_result(outcome).unwrap();
        h.engine.flush().unwrap();

        // Same scope: silent.
        let plan = h
            .engine
            .plan(
                &env(),
                &collected,
                RunMode::Incremental,
                false,
                &["tests/unit".to_string()],
            )
            .unwrap();
        assert!(plan.warnings.is_empty());

        // Wider scope: warns, still proceeds.
        let wide: Vec<String> = vec![
            "tests/unit/test_u.py::test_u".to_string(),
            "tests/integration/test_i.py::test_i".to_string(),
        ];
        let plan = h
            .engine
            .plan(&env(), &wide, RunMode::Incremental, false, &["tests".to_string()])
            .unwrap();
        assert!(!plan.warnings.is_empty());
        // The never-seen test still gets selected.
        assert!(plan.run.contains("tests/integration/test_i.py::test_i"));
    }

    #[test]
    fn scope_covered_respects_path_boundaries() {
        let stored = vec!["tests/unit".to_string()];
        assert!(scope_covered(&["tests/unit".to_string()], &stored));
        assert!(scope_covered(&["tests/unit/sub".to_string()], &stored));
        assert!(!scope_covered(&["tests/unittest".to_string()], &stored));
        assert!(!scope_covered(&["tests".to_string()], &stored));
        assert!(!scope_covered(&[], &stored));
        assert!(scope_covered(&["anything".to_string()], &[String::new()]));
    }
}
