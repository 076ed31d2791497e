pub mod postgres;
pub mod schema;
pub mod sqlite;

use std::collections::HashSet;
use std::path::Path;

use crate::errors::StoreError;
use crate::model::{ModelRecord, PipelineRecord, TestResult, TestRun};

/// Default embedded database location when no connection string is given.
pub const DEFAULT_DB_PATH: &str = ".tally/results.db";

/// Best-effort archive totals for the `status` command. Counts stay `None`
/// when a table cannot be read instead of failing the whole snapshot.
#[derive(Debug, Default)]
pub struct StoreStats {
    pub runs: Option<u64>,
    pub results: Option<u64>,
    pub pipelines: Option<u64>,
    pub models: Option<u64>,
    pub last_run_id: Option<i64>,
    pub last_run_at: Option<String>,
}

/// Storage-agnostic archive interface. Both implementations expose
/// equivalent query semantics (same columns, same ordering) so callers
/// never branch on the backend.
pub trait ResultStore: Send + Sync {
    /// Persists one run and all of its results in a single transaction.
    /// Partial writes are never observable.
    fn write_run(&self, run: &TestRun, results: &[TestResult]) -> Result<i64, StoreError>;

    fn upsert_model(&self, rec: &ModelRecord) -> Result<(), StoreError>;

    fn upsert_pipeline(&self, rec: &PipelineRecord) -> Result<(), StoreError>;

    /// Most recent runs, newest first.
    fn recent_runs(&self, limit: u32) -> Result<Vec<TestRun>, StoreError>;

    /// Pipeline-URL values of the most recent `limit` runs. This is the
    /// bounded dedup window, not a full scan.
    fn recent_pipeline_urls(&self, limit: u32) -> Result<HashSet<String>, StoreError>;

    fn export_json(&self) -> Result<serde_json::Value, StoreError>;

    fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Selects a backend from the connection string: `postgres://` or
/// `postgresql://` opens the client/server backend, anything else is
/// treated as a SQLite path (with an optional `sqlite:` prefix). An empty
/// string selects [`DEFAULT_DB_PATH`].
pub fn open_store(connection: &str) -> Result<Box<dyn ResultStore>, StoreError> {
    let connection = connection.trim();
    let connection = if connection.is_empty() { DEFAULT_DB_PATH } else { connection };
    if connection.starts_with("postgres://") || connection.starts_with("postgresql://") {
        Ok(Box::new(postgres::PostgresStore::open(connection)?))
    } else {
        let path = connection.strip_prefix("sqlite:").unwrap_or(connection);
        Ok(Box::new(sqlite::SqliteStore::open(Path::new(path))?))
    }
}
