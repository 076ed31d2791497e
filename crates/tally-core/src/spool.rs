//! Durable local buffer for archival payloads written while storage was
//! unreachable. One JSON object per line; replay is out-of-band and never
//! triggered mid-run.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::model::{ModelRecord, TestResult, TestRun};
use crate::storage::ResultStore;

pub const DEFAULT_SPOOL_PATH: &str = ".tally/spool.jsonl";

#[derive(Debug, Serialize, Deserialize)]
pub struct SpoolEntry {
    pub run: TestRun,
    pub results: Vec<TestResult>,
}

pub fn append(path: &Path, entry: &SpoolEntry) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct ReplayOutcome {
    pub replayed: usize,
    pub remaining: usize,
}

/// Re-archives every spooled payload. Payloads the store still cannot
/// accept for infrastructure reasons are kept for a later attempt;
/// payloads the store rejects as invalid are dropped with a warning.
pub fn replay(store: &dyn ResultStore, path: &Path) -> anyhow::Result<ReplayOutcome> {
    if !path.exists() {
        return Ok(ReplayOutcome::default());
    }
    let text = fs::read_to_string(path)?;
    let mut kept: Vec<&str> = Vec::new();
    let mut replayed = 0usize;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        let entry: SpoolEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "dropping unreadable spool line");
                continue;
            }
        };
        match store.write_run(&entry.run, &entry.results) {
            Ok(run_id) => {
                tracing::info!(run_id, suite = %entry.run.suite, "replayed spooled run");
                replayed += 1;
                if !entry.run.model.is_empty() {
                    let record = ModelRecord {
                        model: entry.run.model.clone(),
                        last_tested_at: entry.run.started_at,
                    };
                    if let Err(e) = store.upsert_model(&record) {
                        tracing::warn!(error = %e, model = %entry.run.model, "model upsert failed");
                    }
                }
            }
            Err(err) if err.is_retryable() => kept.push(line),
            Err(err) => {
                tracing::warn!(error = %err, suite = %entry.run.suite, "dropping spooled run rejected by store");
            }
        }
    }
    if kept.is_empty() {
        fs::write(path, "")?;
    } else {
        let mut remainder = kept.join("\n");
        remainder.push('\n');
        fs::write(path, remainder)?;
    }
    Ok(ReplayOutcome {
        replayed,
        remaining: kept.len(),
    })
}
