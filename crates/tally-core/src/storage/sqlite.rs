use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::errors::StoreError;
use crate::model::{ModelRecord, PipelineRecord, TestResult, TestRun, TestStatus};
use crate::storage::{ResultStore, StoreStats};

/// Embedded single-file backend.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Unavailable(format!("create {}: {}", parent.display(), e)))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory database, used by tests.
    pub fn memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_millis(5_000))?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        migrate_legacy_columns(&conn)?;
        conn.execute_batch(crate::storage::schema::SQLITE_DDL)?;
        let cols = table_columns(&conn, "runs")?;
        add_column_if_missing(&conn, &cols, "runs", "wall_seconds", "REAL")?;
        add_column_if_missing(&conn, &cols, "runs", "cost_usd", "REAL")?;
        Ok(())
    }
}

// Databases written before the column rename carry `model_name`; upgrade
// in place before the DDL recreates indexes.
fn migrate_legacy_columns(conn: &Connection) -> Result<(), StoreError> {
    let tables: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'runs'",
        [],
        |r| r.get(0),
    )?;
    if tables == 0 {
        return Ok(());
    }
    let cols = table_columns(conn, "runs")?;
    if cols.contains("model_name") && !cols.contains("model") {
        conn.execute("ALTER TABLE runs RENAME COLUMN model_name TO model", [])?;
    }
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut out = HashSet::new();
    for r in rows {
        out.insert(r?);
    }
    Ok(out)
}

fn add_column_if_missing(
    conn: &Connection,
    cols: &HashSet<String>,
    table: &str,
    col: &str,
    ty: &str,
) -> Result<(), StoreError> {
    if !cols.is_empty() && !cols.contains(col) {
        conn.execute(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, col, ty), [])?;
    }
    Ok(())
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TestRun> {
    let started_raw: String = row.get(1)?;
    let started_at = DateTime::parse_from_rfc3339(&started_raw)
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?
        .with_timezone(&Utc);
    Ok(TestRun {
        id: Some(row.get(0)?),
        started_at,
        model: row.get(2)?,
        model_release: row.get(3)?,
        suite: row.get(4)?,
        commit_sha: row.get(5)?,
        branch: row.get(6)?,
        pipeline_url: row.get(7)?,
        runner: row.get(8)?,
        runner_tags: row.get(9)?,
        total: row.get(10)?,
        passed: row.get(11)?,
        failed: row.get(12)?,
        skipped: row.get(13)?,
        duration_seconds: row.get(14)?,
        harness_version: row.get(15)?,
        temperature: row.get(16)?,
        seed: row.get(17)?,
        top_p: row.get(18)?,
        top_k: row.get(19)?,
        wall_seconds: row.get(20)?,
        cost_usd: row.get(21)?,
    })
}

const RUN_COLUMNS: &str = "id, started_at, model, model_release, suite, commit_sha, branch, \
                           pipeline_url, runner, runner_tags, total, passed, failed, skipped, \
                           duration_seconds, harness_version, temperature, seed, top_p, top_k, \
                           wall_seconds, cost_usd";

fn results_for_run(conn: &Connection, run_id: i64) -> Result<Vec<TestResult>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT test_name, status, score, question, expected, actual, reason
         FROM results WHERE run_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![run_id], |row| {
        Ok(TestResult {
            test_name: row.get(0)?,
            status: TestStatus::parse(&row.get::<_, String>(1)?),
            score: row.get(2)?,
            question: row.get(3)?,
            expected: row.get(4)?,
            actual: row.get(5)?,
            reason: row.get(6)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

impl ResultStore for SqliteStore {
    fn write_run(&self, run: &TestRun, results: &[TestResult]) -> Result<i64, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO runs (started_at, model, model_release, suite, commit_sha, branch, \
             pipeline_url, runner, runner_tags, total, passed, failed, skipped, \
             duration_seconds, harness_version, temperature, seed, top_p, top_k, \
             wall_seconds, cost_usd)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, \
             ?17, ?18, ?19, ?20, ?21)",
            params![
                run.started_at.to_rfc3339(),
                run.model,
                run.model_release,
                run.suite,
                run.commit_sha,
                run.branch,
                run.pipeline_url,
                run.runner,
                run.runner_tags,
                run.total,
                run.passed,
                run.failed,
                run.skipped,
                run.duration_seconds,
                run.harness_version,
                run.temperature,
                run.seed,
                run.top_p,
                run.top_k,
                run.wall_seconds,
                run.cost_usd,
            ],
        )?;
        let run_id = tx.last_insert_rowid();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO results (run_id, test_name, status, score, question, expected, \
                 actual, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for r in results {
                stmt.execute(params![
                    run_id,
                    r.test_name,
                    r.status.as_str(),
                    r.score,
                    r.question,
                    r.expected,
                    r.actual,
                    r.reason,
                ])?;
            }
        }
        tx.commit()?;
        Ok(run_id)
    }

    fn upsert_model(&self, rec: &ModelRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO models (model, last_tested_at) VALUES (?1, ?2)
             ON CONFLICT(model) DO UPDATE SET last_tested_at = excluded.last_tested_at",
            params![rec.model, rec.last_tested_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn upsert_pipeline(&self, rec: &PipelineRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO pipelines (pipeline_id, status, ref_name, sha, url, created_at, \
             updated_at, duration_seconds, job_count, artifact_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(pipeline_id) DO UPDATE SET
               status = excluded.status,
               ref_name = excluded.ref_name,
               sha = excluded.sha,
               url = excluded.url,
               created_at = excluded.created_at,
               updated_at = excluded.updated_at,
               duration_seconds = excluded.duration_seconds,
               job_count = excluded.job_count,
               artifact_count = excluded.artifact_count",
            params![
                rec.pipeline_id,
                rec.status,
                rec.ref_name,
                rec.sha,
                rec.url,
                rec.created_at,
                rec.updated_at,
                rec.duration_seconds,
                rec.job_count,
                rec.artifact_count,
            ],
        )?;
        Ok(())
    }

    fn recent_runs(&self, limit: u32) -> Result<Vec<TestRun>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM runs ORDER BY id DESC LIMIT ?1",
            RUN_COLUMNS
        ))?;
        let rows = stmt.query_map(params![limit], run_from_row)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    fn recent_pipeline_urls(&self, limit: u32) -> Result<HashSet<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT pipeline_url FROM runs ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit], |row| row.get::<_, Option<String>>(0))?;
        let mut out = HashSet::new();
        for r in rows {
            if let Some(url) = r? {
                out.insert(url);
            }
        }
        Ok(out)
    }

    fn export_json(&self) -> Result<serde_json::Value, StoreError> {
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn.prepare(&format!("SELECT {} FROM runs ORDER BY id ASC", RUN_COLUMNS))?;
        let rows = stmt.query_map([], run_from_row)?;
        let mut runs = Vec::new();
        for r in rows {
            let run = r?;
            let run_id = run.id.unwrap_or_default();
            let results = results_for_run(&conn, run_id)?;
            let mut value = serde_json::to_value(&run)
                .map_err(|e| StoreError::Invalid(e.to_string()))?;
            value["results"] =
                serde_json::to_value(&results).map_err(|e| StoreError::Invalid(e.to_string()))?;
            runs.push(value);
        }

        let mut stmt = conn.prepare(
            "SELECT pipeline_id, status, ref_name, sha, url, created_at, updated_at, \
             duration_seconds, job_count, artifact_count
             FROM pipelines ORDER BY pipeline_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PipelineRecord {
                pipeline_id: row.get(0)?,
                status: row.get(1)?,
                ref_name: row.get(2)?,
                sha: row.get(3)?,
                url: row.get(4)?,
                created_at: row.get(5)?,
                updated_at: row.get(6)?,
                duration_seconds: row.get(7)?,
                job_count: row.get(8)?,
                artifact_count: row.get(9)?,
            })
        })?;
        let mut pipelines = Vec::new();
        for r in rows {
            pipelines.push(r?);
        }

        let mut stmt =
            conn.prepare("SELECT model, last_tested_at FROM models ORDER BY model ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut models = Vec::new();
        for r in rows {
            let (model, last_tested_at) = r?;
            models.push(serde_json::json!({ "model": model, "last_tested_at": last_tested_at }));
        }

        Ok(serde_json::json!({
            "runs": runs,
            "pipelines": serde_json::to_value(&pipelines)
                .map_err(|e| StoreError::Invalid(e.to_string()))?,
            "models": models,
        }))
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn.lock().unwrap();
        let count = |table: &str| -> Option<u64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| {
                r.get::<_, i64>(0).map(|n| n as u64)
            })
            .ok()
        };
        let last: Option<(i64, String)> = conn
            .query_row(
                "SELECT id, started_at FROM runs ORDER BY id DESC LIMIT 1",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .ok();
        let (last_run_id, last_run_at) = match last {
            Some((id, at)) => (Some(id), Some(at)),
            None => (None, None),
        };
        Ok(StoreStats {
            runs: count("runs"),
            results: count("results"),
            pipelines: count("pipelines"),
            models: count("models"),
            last_run_id,
            last_run_at,
        })
    }
}
