use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use postgres::NoTls;
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;

use crate::errors::StoreError;
use crate::model::{ModelRecord, PipelineRecord, TestResult, TestRun, TestStatus};
use crate::storage::{ResultStore, StoreStats};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STATEMENT_TIMEOUT_MS: u64 = 30_000;

/// Client/server relational backend. The pool is capped small: the archive
/// has at most one writer per process, the pool only covers reconnects.
pub struct PostgresStore {
    pool: Pool<PostgresConnectionManager<NoTls>>,
}

impl PostgresStore {
    pub fn open(connection: &str) -> Result<Self, StoreError> {
        let mut config = connection
            .parse::<postgres::Config>()
            .map_err(|e| StoreError::Invalid(format!("connection string: {}", e)))?;
        config.connect_timeout(CONNECT_TIMEOUT);
        config.options(format!("-c statement_timeout={}", STATEMENT_TIMEOUT_MS).as_str());
        let manager = PostgresConnectionManager::new(config, NoTls);
        let pool = Pool::builder()
            .max_size(2)
            .connection_timeout(CONNECT_TIMEOUT)
            .build(manager)?;
        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let mut client = self.pool.get()?;
        client.batch_execute(crate::storage::schema::POSTGRES_DDL)?;
        // Legacy deployments carry `model_name`; rename in place, then
        // backfill columns added after the initial schema.
        client.batch_execute(
            "DO $$ BEGIN
               IF EXISTS (SELECT 1 FROM information_schema.columns
                          WHERE table_name = 'runs' AND column_name = 'model_name')
                  AND NOT EXISTS (SELECT 1 FROM information_schema.columns
                                  WHERE table_name = 'runs' AND column_name = 'model') THEN
                 ALTER TABLE runs RENAME COLUMN model_name TO model;
               END IF;
             END $$;
             ALTER TABLE runs ADD COLUMN IF NOT EXISTS wall_seconds DOUBLE PRECISION;
             ALTER TABLE runs ADD COLUMN IF NOT EXISTS cost_usd DOUBLE PRECISION;",
        )?;
        Ok(())
    }
}

const RUN_COLUMNS: &str = "id, started_at, model, model_release, suite, commit_sha, branch, \
                           pipeline_url, runner, runner_tags, total, passed, failed, skipped, \
                           duration_seconds, harness_version, temperature, seed, top_p, top_k, \
                           wall_seconds, cost_usd";

fn run_from_row(row: &postgres::Row) -> Result<TestRun, StoreError> {
    let started_raw: String = row.get(1);
    let started_at = DateTime::parse_from_rfc3339(&started_raw)
        .map_err(|e| StoreError::Invalid(format!("started_at: {}", e)))?
        .with_timezone(&Utc);
    Ok(TestRun {
        id: Some(row.get(0)),
        started_at,
        model: row.get(2),
        model_release: row.get(3),
        suite: row.get(4),
        commit_sha: row.get(5),
        branch: row.get(6),
        pipeline_url: row.get(7),
        runner: row.get(8),
        runner_tags: row.get(9),
        total: row.get::<_, i64>(10) as u32,
        passed: row.get::<_, i64>(11) as u32,
        failed: row.get::<_, i64>(12) as u32,
        skipped: row.get::<_, i64>(13) as u32,
        duration_seconds: row.get(14),
        harness_version: row.get(15),
        temperature: row.get(16),
        seed: row.get(17),
        top_p: row.get(18),
        top_k: row.get(19),
        wall_seconds: row.get(20),
        cost_usd: row.get(21),
    })
}

fn result_from_row(row: &postgres::Row) -> TestResult {
    TestResult {
        test_name: row.get(0),
        status: TestStatus::parse(row.get::<_, &str>(1)),
        score: row.get(2),
        question: row.get(3),
        expected: row.get(4),
        actual: row.get(5),
        reason: row.get(6),
    }
}

impl ResultStore for PostgresStore {
    fn write_run(&self, run: &TestRun, results: &[TestResult]) -> Result<i64, StoreError> {
        let mut client = self.pool.get()?;
        let mut tx = client.transaction()?;
        let started_at = run.started_at.to_rfc3339();
        let total = i64::from(run.total);
        let passed = i64::from(run.passed);
        let failed = i64::from(run.failed);
        let skipped = i64::from(run.skipped);
        let row = tx.query_one(
            "INSERT INTO runs (started_at, model, model_release, suite, commit_sha, branch, \
             pipeline_url, runner, runner_tags, total, passed, failed, skipped, \
             duration_seconds, harness_version, temperature, seed, top_p, top_k, \
             wall_seconds, cost_usd)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, \
             $17, $18, $19, $20, $21)
             RETURNING id",
            &[
                &started_at,
                &run.model,
                &run.model_release,
                &run.suite,
                &run.commit_sha,
                &run.branch,
                &run.pipeline_url,
                &run.runner,
                &run.runner_tags,
                &total,
                &passed,
                &failed,
                &skipped,
                &run.duration_seconds,
                &run.harness_version,
                &run.temperature,
                &run.seed,
                &run.top_p,
                &run.top_k,
                &run.wall_seconds,
                &run.cost_usd,
            ],
        )?;
        let run_id: i64 = row.get(0);
        for r in results {
            tx.execute(
                "INSERT INTO results (run_id, test_name, status, score, question, expected, \
                 actual, reason)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                &[
                    &run_id,
                    &r.test_name,
                    &r.status.as_str(),
                    &r.score,
                    &r.question,
                    &r.expected,
                    &r.actual,
                    &r.reason,
                ],
            )?;
        }
        tx.commit()?;
        Ok(run_id)
    }

    fn upsert_model(&self, rec: &ModelRecord) -> Result<(), StoreError> {
        let mut client = self.pool.get()?;
        client.execute(
            "INSERT INTO models (model, last_tested_at) VALUES ($1, $2)
             ON CONFLICT (model) DO UPDATE SET last_tested_at = excluded.last_tested_at",
            &[&rec.model, &rec.last_tested_at.to_rfc3339()],
        )?;
        Ok(())
    }

    fn upsert_pipeline(&self, rec: &PipelineRecord) -> Result<(), StoreError> {
        let mut client = self.pool.get()?;
        let job_count = i64::from(rec.job_count);
        let artifact_count = i64::from(rec.artifact_count);
        client.execute(
            "INSERT INTO pipelines (pipeline_id, status, ref_name, sha, url, created_at, \
             updated_at, duration_seconds, job_count, artifact_count)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (pipeline_id) DO UPDATE SET
               status = excluded.status,
               ref_name = excluded.ref_name,
               sha = excluded.sha,
               url = excluded.url,
               created_at = excluded.created_at,
               updated_at = excluded.updated_at,
               duration_seconds = excluded.duration_seconds,
               job_count = excluded.job_count,
               artifact_count = excluded.artifact_count",
            &[
                &rec.pipeline_id,
                &rec.status,
                &rec.ref_name,
                &rec.sha,
                &rec.url,
                &rec.created_at,
                &rec.updated_at,
                &rec.duration_seconds,
                &job_count,
                &artifact_count,
            ],
        )?;
        Ok(())
    }

    fn recent_runs(&self, limit: u32) -> Result<Vec<TestRun>, StoreError> {
        let mut client = self.pool.get()?;
        let limit = i64::from(limit);
        let rows = client.query(
            &format!("SELECT {} FROM runs ORDER BY id DESC LIMIT $1", RUN_COLUMNS),
            &[&limit],
        )?;
        rows.iter().map(run_from_row).collect()
    }

    fn recent_pipeline_urls(&self, limit: u32) -> Result<HashSet<String>, StoreError> {
        let mut client = self.pool.get()?;
        let limit = i64::from(limit);
        let rows = client.query(
            "SELECT pipeline_url FROM runs ORDER BY id DESC LIMIT $1",
            &[&limit],
        )?;
        let mut out = HashSet::new();
        for row in &rows {
            if let Some(url) = row.get::<_, Option<String>>(0) {
                out.insert(url);
            }
        }
        Ok(out)
    }

    fn export_json(&self) -> Result<serde_json::Value, StoreError> {
        let mut client = self.pool.get()?;

        let rows = client.query(
            &format!("SELECT {} FROM runs ORDER BY id ASC", RUN_COLUMNS),
            &[],
        )?;
        let mut runs = Vec::new();
        for row in &rows {
            let run = run_from_row(row)?;
            let run_id = run.id.unwrap_or_default();
            let result_rows = client.query(
                "SELECT test_name, status, score, question, expected, actual, reason
                 FROM results WHERE run_id = $1 ORDER BY id ASC",
                &[&run_id],
            )?;
            let results: Vec<TestResult> = result_rows.iter().map(result_from_row).collect();
            let mut value =
                serde_json::to_value(&run).map_err(|e| StoreError::Invalid(e.to_string()))?;
            value["results"] =
                serde_json::to_value(&results).map_err(|e| StoreError::Invalid(e.to_string()))?;
            runs.push(value);
        }

        let rows = client.query(
            "SELECT pipeline_id, status, ref_name, sha, url, created_at, updated_at, \
             duration_seconds, job_count, artifact_count
             FROM pipelines ORDER BY pipeline_id ASC",
            &[],
        )?;
        let pipelines: Vec<PipelineRecord> = rows
            .iter()
            .map(|row| PipelineRecord {
                pipeline_id: row.get(0),
                status: row.get(1),
                ref_name: row.get(2),
                sha: row.get(3),
                url: row.get(4),
                created_at: row.get(5),
                updated_at: row.get(6),
                duration_seconds: row.get(7),
                job_count: row.get::<_, i64>(8) as u32,
                artifact_count: row.get::<_, i64>(9) as u32,
            })
            .collect();

        let rows = client.query("SELECT model, last_tested_at FROM models ORDER BY model ASC", &[])?;
        let models: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| {
                serde_json::json!({
                    "model": row.get::<_, String>(0),
                    "last_tested_at": row.get::<_, String>(1),
                })
            })
            .collect();

        Ok(serde_json::json!({
            "runs": runs,
            "pipelines": serde_json::to_value(&pipelines)
                .map_err(|e| StoreError::Invalid(e.to_string()))?,
            "models": models,
        }))
    }

    fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut client = self.pool.get()?;
        let runs = count_rows(&mut client, "runs");
        let results = count_rows(&mut client, "results");
        let pipelines = count_rows(&mut client, "pipelines");
        let models = count_rows(&mut client, "models");
        let last = client
            .query_opt("SELECT id, started_at FROM runs ORDER BY id DESC LIMIT 1", &[])
            .ok()
            .flatten();
        let (last_run_id, last_run_at) = match last {
            Some(row) => (Some(row.get::<_, i64>(0)), Some(row.get::<_, String>(1))),
            None => (None, None),
        };
        Ok(StoreStats {
            runs,
            results,
            pipelines,
            models,
            last_run_id,
            last_run_at,
        })
    }
}

fn count_rows(client: &mut postgres::Client, table: &str) -> Option<u64> {
    client
        .query_one(&format!("SELECT COUNT(*) FROM {}", table), &[])
        .ok()
        .map(|row| row.get::<_, i64>(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Connection-failure behavior is testable without a live server; the
    // full read/write path is covered by the backend-equivalence suite
    // against SQLite plus identical SQL shapes here.
    #[test]
    fn unparseable_connection_string_is_invalid() {
        let err = match PostgresStore::open("not a url") {
            Ok(_) => panic!("expected an error"),
            Err(err) => err,
        };
        assert!(matches!(err, StoreError::Invalid(_)));
    }
}
