use std::collections::{BTreeMap, HashSet};

use tally_core::collector::{ResultCollector, SuiteInfo, SuiteStats, TestAttributes};
use tally_core::errors::StoreError;
use tally_core::model::{ModelRecord, PipelineRecord, TestResult, TestRun, TestStatus};
use tally_core::spool;
use tally_core::storage::sqlite::SqliteStore;
use tally_core::storage::{ResultStore, StoreStats};
use tempfile::tempdir;

fn suite(name: &str, items: &[(&str, &str)]) -> SuiteInfo {
    SuiteInfo {
        name: name.into(),
        items: items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
    }
}

fn no_attrs() -> TestAttributes {
    TestAttributes::default()
}

#[test]
fn nested_run_archives_once_with_aggregated_counts() {
    let store = SqliteStore::memory().unwrap();
    let dir = tempdir().unwrap();
    let mut collector = ResultCollector::with_store(
        Some(Box::new(store.clone())),
        dir.path().join("spool.jsonl"),
    );

    // Two passed and one failed test across a depth-2 tree.
    collector.on_suite_start(&suite("nightly", &[("model", "sonnet-4")]), 0);
    collector.on_suite_start(&suite("math", &[]), 1);
    collector.on_test_end("add", TestStatus::Pass, &no_attrs());
    collector.on_test_end("sub", TestStatus::Pass, &no_attrs());
    collector.on_suite_start(&suite("deep", &[]), 2);
    collector.on_test_end("div", TestStatus::Fail, &no_attrs());
    collector.on_suite_end(&SuiteStats::default(), 2);
    collector.on_suite_end(&SuiteStats::default(), 1);
    collector.on_suite_end(&SuiteStats::default(), 0);

    let runs = store.recent_runs(10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].suite, "nightly");
    assert_eq!(runs[0].total, 3);
    assert_eq!(runs[0].passed, 2);
    assert_eq!(runs[0].failed, 1);
    assert_eq!(runs[0].model, "sonnet-4");

    let stats = store.stats().unwrap();
    assert_eq!(stats.results, Some(3));
    // The referenced model was upserted alongside the run.
    assert_eq!(stats.models, Some(1));
}

#[test]
fn depth_three_tree_still_produces_one_run() {
    let store = SqliteStore::memory().unwrap();
    let dir = tempdir().unwrap();
    let mut collector = ResultCollector::with_store(
        Some(Box::new(store.clone())),
        dir.path().join("spool.jsonl"),
    );

    collector.on_suite_start(&suite("root", &[]), 0);
    for d in 1..=3usize {
        collector.on_suite_start(&suite("inner", &[]), d);
    }
    collector.on_test_end("leaf", TestStatus::Pass, &no_attrs());
    for d in (1..=3usize).rev() {
        collector.on_suite_end(&SuiteStats::default(), d);
    }
    collector.on_suite_end(&SuiteStats::default(), 0);

    let runs = store.recent_runs(10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].total, 1);
    assert_eq!(runs[0].suite, "root");
}

#[test]
fn grading_payload_in_log_lines_is_attached() {
    let store = SqliteStore::memory().unwrap();
    let dir = tempdir().unwrap();
    let mut collector = ResultCollector::with_store(
        Some(Box::new(store.clone())),
        dir.path().join("spool.jsonl"),
    );

    collector.on_suite_start(&suite("graded", &[]), 0);
    let attrs = TestAttributes {
        duration_seconds: Some(1.0),
        messages: vec![
            "starting grader".into(),
            r#"grading-json: {"v":1,"score":0.9,"question":"2+2?","expected":"4","actual":"4","reason":"exact"}"#.into(),
        ],
    };
    collector.on_test_end("add", TestStatus::Pass, &attrs);
    collector.on_suite_end(&SuiteStats::default(), 0);

    let export = store.export_json().unwrap();
    let result = &export["runs"][0]["results"][0];
    assert_eq!(result["score"], 0.9);
    assert_eq!(result["expected"], "4");
    assert_eq!(result["reason"], "exact");
}

/// Store stub that is permanently unreachable.
struct UnreachableStore;

impl ResultStore for UnreachableStore {
    fn write_run(&self, _run: &TestRun, _results: &[TestResult]) -> Result<i64, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    fn upsert_model(&self, _rec: &ModelRecord) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    fn upsert_pipeline(&self, _rec: &PipelineRecord) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    fn recent_runs(&self, _limit: u32) -> Result<Vec<TestRun>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    fn recent_pipeline_urls(&self, _limit: u32) -> Result<HashSet<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    fn export_json(&self) -> Result<serde_json::Value, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
    fn stats(&self) -> Result<StoreStats, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

#[test]
fn unreachable_store_spools_and_replay_recovers() {
    let dir = tempdir().unwrap();
    let spool_path = dir.path().join("spool.jsonl");

    let mut collector =
        ResultCollector::with_store(Some(Box::new(UnreachableStore)), spool_path.clone());
    collector.on_suite_start(&suite("nightly", &[("model", "sonnet-4")]), 0);
    collector.on_test_end("add", TestStatus::Pass, &no_attrs());
    collector.on_test_end("div", TestStatus::Fail, &no_attrs());
    // The flush must not panic or surface an error to the runner.
    collector.on_suite_end(&SuiteStats::default(), 0);

    let text = std::fs::read_to_string(&spool_path).unwrap();
    assert_eq!(text.lines().count(), 1);

    // Out-of-band replay into a store that is back up.
    let store = SqliteStore::memory().unwrap();
    let outcome = spool::replay(&store, &spool_path).unwrap();
    assert_eq!(outcome.replayed, 1);
    assert_eq!(outcome.remaining, 0);

    let runs = store.recent_runs(10).unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].total, 2);
    assert_eq!(runs[0].failed, 1);

    // The spool is drained; a second replay is a no-op.
    let again = spool::replay(&store, &spool_path).unwrap();
    assert_eq!(again.replayed, 0);
    assert_eq!(store.recent_runs(10).unwrap().len(), 1);
}

#[test]
fn collector_without_any_store_spools_directly() {
    let dir = tempdir().unwrap();
    let spool_path = dir.path().join("spool.jsonl");

    let mut collector = ResultCollector::with_store(None, spool_path.clone());
    collector.on_suite_start(&suite("offline", &[]), 0);
    collector.on_test_end("t", TestStatus::Skip, &no_attrs());
    collector.on_suite_end(&SuiteStats::default(), 0);

    assert!(spool_path.exists());
}
