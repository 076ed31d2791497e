//! Live ingestion path: a synchronous listener driven by the external test
//! runner's lifecycle hooks. Only depth-zero suite boundaries start and
//! flush an accumulation; nested suites feed the same pending list, which
//! is what prevents double-archiving on nested trees.
//!
//! Archival outcome never affects the runner's own pass/fail reporting: a
//! failed flush is a WARN plus a spool append, never an error.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::metadata::{self, RunMetadata};
use crate::model::{GradingPayload, ModelRecord, TestResult, TestRun, TestStatus};
use crate::spool::{self, SpoolEntry};
use crate::storage::{open_store, ResultStore};

/// Suite-start payload from the runner.
#[derive(Debug, Clone, Default)]
pub struct SuiteInfo {
    pub name: String,
    pub items: BTreeMap<String, String>,
}

/// Test-end payload from the runner. `messages` holds the test's free-text
/// log lines, one of which may carry the grading payload.
#[derive(Debug, Clone, Default)]
pub struct TestAttributes {
    pub duration_seconds: Option<f64>,
    pub messages: Vec<String>,
}

/// Runner-reported aggregate for a closing suite. Informational only; the
/// archived counts are always computed from the accumulated results.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuiteStats {
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Accumulating,
}

pub struct ResultCollector {
    store: Option<Box<dyn ResultStore>>,
    spool_path: PathBuf,
    state: State,
    suite: String,
    meta: RunMetadata,
    started_at: DateTime<Utc>,
    started_instant: Option<Instant>,
    pending: Vec<TestResult>,
}

impl ResultCollector {
    /// Opens the configured store up front. An unreachable store is an
    /// infrastructure warning; the collector still runs and spools.
    pub fn new(connection: &str, spool_path: impl Into<PathBuf>) -> Self {
        let store = match open_store(connection) {
            Ok(store) => Some(store),
            Err(e) => {
                tracing::warn!(error = %e, "result store unavailable; runs will be spooled");
                None
            }
        };
        Self::with_store(store, spool_path)
    }

    pub fn with_store(store: Option<Box<dyn ResultStore>>, spool_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            spool_path: spool_path.into(),
            state: State::Idle,
            suite: String::new(),
            meta: RunMetadata::default(),
            started_at: Utc::now(),
            started_instant: None,
            pending: Vec::new(),
        }
    }

    pub fn on_suite_start(&mut self, suite: &SuiteInfo, depth: usize) {
        if depth != 0 {
            return;
        }
        self.state = State::Accumulating;
        self.suite = suite.name.clone();
        self.meta = metadata::resolve(&suite.items);
        self.started_at = Utc::now();
        self.started_instant = Some(Instant::now());
        self.pending.clear();
    }

    pub fn on_test_end(&mut self, name: &str, status: TestStatus, attrs: &TestAttributes) {
        if self.state != State::Accumulating {
            return;
        }
        let mut result = TestResult::status_only(name, status);
        if let Some(payload) = GradingPayload::extract(attrs.messages.iter().map(String::as_str)) {
            payload.apply_to(&mut result);
        }
        self.pending.push(result);
    }

    pub fn on_suite_end(&mut self, _stats: &SuiteStats, depth: usize) {
        if depth != 0 || self.state != State::Accumulating {
            return;
        }
        let run = self.build_run();
        let results = std::mem::take(&mut self.pending);
        self.flush(run, results);
        self.state = State::Idle;
        self.started_instant = None;
    }

    fn build_run(&self) -> TestRun {
        let mut run = TestRun::new(self.suite.clone(), self.started_at);
        for result in &self.pending {
            match result.status {
                TestStatus::Pass => run.passed += 1,
                TestStatus::Fail => run.failed += 1,
                TestStatus::Skip => run.skipped += 1,
            }
        }
        run.total = self.pending.len() as u32;
        run.duration_seconds = self
            .started_instant
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        run.wall_seconds = Some(run.duration_seconds);
        self.meta.apply_to(&mut run);
        run
    }

    fn flush(&self, run: TestRun, results: Vec<TestResult>) {
        let Some(store) = &self.store else {
            self.spool(run, results);
            return;
        };
        match store.write_run(&run, &results) {
            Ok(run_id) => {
                tracing::info!(run_id, suite = %run.suite, total = run.total, "archived run");
                if !run.model.is_empty() {
                    let record = ModelRecord {
                        model: run.model.clone(),
                        last_tested_at: run.started_at,
                    };
                    if let Err(e) = store.upsert_model(&record) {
                        tracing::warn!(error = %e, model = %run.model, "model upsert failed");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, suite = %run.suite, "archival failed; spooling payload");
                self.spool(run, results);
            }
        }
    }

    fn spool(&self, run: TestRun, results: Vec<TestResult>) {
        let entry = SpoolEntry { run, results };
        if let Err(e) = spool::append(&self.spool_path, &entry) {
            tracing::warn!(error = %e, path = %self.spool_path.display(), "spool append failed; payload lost");
        }
    }
}
