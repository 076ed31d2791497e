use chrono::Utc;
use tally_core::errors::StoreError;
use tally_core::model::{ModelRecord, PipelineRecord, TestResult, TestRun, TestStatus};
use tally_core::storage::sqlite::SqliteStore;
use tally_core::storage::{open_store, ResultStore};
use tempfile::tempdir;

fn sample_run(suite: &str, pipeline_url: Option<&str>) -> TestRun {
    let mut run = TestRun::new(suite, Utc::now());
    run.model = "sonnet-4".into();
    run.commit_sha = Some("cafe0123".into());
    run.branch = Some("main".into());
    run.pipeline_url = pipeline_url.map(String::from);
    run.total = 3;
    run.passed = 2;
    run.failed = 1;
    run.duration_seconds = 12.5;
    run.temperature = Some(0.2);
    run.seed = Some(7);
    run
}

fn sample_results() -> Vec<TestResult> {
    vec![
        TestResult {
            test_name: "add".into(),
            status: TestStatus::Pass,
            score: Some(1.0),
            question: Some("2+2?".into()),
            expected: Some("4".into()),
            actual: Some("4".into()),
            reason: Some("exact match".into()),
        },
        TestResult::status_only("sub", TestStatus::Pass),
        TestResult::status_only("div", TestStatus::Fail),
    ]
}

#[test]
fn write_and_query_lifecycle() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("results.db");

    let store = SqliteStore::open(&db_path)?;
    let run_id = store.write_run(&sample_run("nightly", Some("https://ci/p/1")), &sample_results())?;
    assert!(run_id > 0);

    let runs = store.recent_runs(10)?;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, Some(run_id));
    assert_eq!(runs[0].model, "sonnet-4");
    assert_eq!(runs[0].total, 3);
    assert_eq!(runs[0].passed, 2);
    assert_eq!(runs[0].temperature, Some(0.2));

    let urls = store.recent_pipeline_urls(10)?;
    assert!(urls.contains("https://ci/p/1"));

    // Verify row counts through a raw second connection.
    let conn = rusqlite::Connection::open(&db_path)?;
    let results: i64 = conn.query_row("SELECT COUNT(*) FROM results", [], |r| r.get(0))?;
    assert_eq!(results, 3);

    Ok(())
}

#[test]
fn mid_write_failure_leaves_no_partial_rows() -> anyhow::Result<()> {
    let store = SqliteStore::memory()?;

    let mut results = sample_results();
    // Out-of-range score trips the CHECK constraint after the run row and
    // the first results were already inserted inside the transaction.
    results.push(TestResult {
        test_name: "bad".into(),
        status: TestStatus::Fail,
        score: Some(2.0),
        question: None,
        expected: None,
        actual: None,
        reason: None,
    });

    let err = store
        .write_run(&sample_run("nightly", None), &results)
        .unwrap_err();
    assert!(matches!(err, StoreError::Invalid(_)));
    assert!(!err.is_retryable());

    let stats = store.stats()?;
    assert_eq!(stats.runs, Some(0));
    assert_eq!(stats.results, Some(0));
    Ok(())
}

#[test]
fn pipeline_and_model_upserts_are_idempotent() -> anyhow::Result<()> {
    let store = SqliteStore::memory()?;

    let mut rec = PipelineRecord {
        pipeline_id: 42,
        status: "running".into(),
        ref_name: Some("main".into()),
        sha: Some("cafe0123".into()),
        url: Some("https://ci/p/42".into()),
        created_at: None,
        updated_at: None,
        duration_seconds: None,
        job_count: 0,
        artifact_count: 0,
    };
    store.upsert_pipeline(&rec)?;
    rec.status = "success".into();
    rec.job_count = 3;
    store.upsert_pipeline(&rec)?;

    let stats = store.stats()?;
    assert_eq!(stats.pipelines, Some(1));

    let model = ModelRecord {
        model: "sonnet-4".into(),
        last_tested_at: Utc::now(),
    };
    store.upsert_model(&model)?;
    store.upsert_model(&model)?;
    assert_eq!(store.stats()?.models, Some(1));

    let export = store.export_json()?;
    assert_eq!(export["pipelines"][0]["status"], "success");
    assert_eq!(export["pipelines"][0]["job_count"], 3);
    Ok(())
}

#[test]
fn schema_setup_is_idempotent_across_opens() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("results.db");

    {
        let store = SqliteStore::open(&db_path)?;
        store.write_run(&sample_run("nightly", None), &sample_results())?;
    }
    let store = SqliteStore::open(&db_path)?;
    assert_eq!(store.stats()?.runs, Some(1));
    Ok(())
}

#[test]
fn legacy_model_name_column_is_renamed_on_open() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("old.db");

    // A database from before the column rename, missing the cost columns.
    {
        let conn = rusqlite::Connection::open(&db_path)?;
        conn.execute_batch(
            "CREATE TABLE runs (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               started_at TEXT NOT NULL,
               model_name TEXT NOT NULL DEFAULT '',
               model_release TEXT,
               suite TEXT NOT NULL,
               commit_sha TEXT,
               branch TEXT,
               pipeline_url TEXT,
               runner TEXT,
               runner_tags TEXT,
               total INTEGER NOT NULL DEFAULT 0,
               passed INTEGER NOT NULL DEFAULT 0,
               failed INTEGER NOT NULL DEFAULT 0,
               skipped INTEGER NOT NULL DEFAULT 0,
               duration_seconds REAL NOT NULL DEFAULT 0,
               harness_version TEXT,
               temperature REAL,
               seed INTEGER,
               top_p REAL,
               top_k INTEGER
             );
             INSERT INTO runs (started_at, model_name, suite, total, passed)
             VALUES ('2026-01-01T00:00:00+00:00', 'haiku-3', 'legacy-suite', 1, 1);",
        )?;
    }

    let store = SqliteStore::open(&db_path)?;
    let runs = store.recent_runs(10)?;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].model, "haiku-3");
    assert_eq!(runs[0].wall_seconds, None);

    // New writes land in the upgraded schema.
    store.write_run(&sample_run("nightly", None), &sample_results())?;
    assert_eq!(store.stats()?.runs, Some(2));
    Ok(())
}

#[test]
fn identical_write_sequences_yield_identical_queries() -> anyhow::Result<()> {
    let a = SqliteStore::memory()?;
    let b = SqliteStore::memory()?;

    for store in [&a, &b] {
        store.write_run(&sample_run("nightly", Some("https://ci/p/1")), &sample_results())?;
        store.write_run(&sample_run("smoke", None), &[])?;
    }

    let strip_ids = |runs: Vec<TestRun>| -> Vec<serde_json::Value> {
        runs.into_iter()
            .map(|mut run| {
                run.id = None;
                serde_json::to_value(run).unwrap()
            })
            .collect()
    };

    assert_eq!(strip_ids(a.recent_runs(10)?), strip_ids(b.recent_runs(10)?));
    Ok(())
}

#[test]
fn factory_selects_sqlite_for_plain_paths() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let conn = format!("sqlite:{}", dir.path().join("via-prefix.db").display());
    let store = open_store(&conn).map_err(|e| anyhow::anyhow!(e.to_string()))?;
    assert_eq!(store.stats()?.runs, Some(0));
    Ok(())
}
