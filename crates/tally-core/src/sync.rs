//! Post-hoc ingestion path: list recent pipelines, skip the ones already
//! archived, pull result artifacts job by job, parse and write them, and
//! upsert pipeline history for every pipeline checked, including the ones
//! that yielded no artifact. The loop is strictly sequential and never
//! raises; per-item failures land in the returned summary.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::ci::{CiApi, PipelineSummary};
use crate::errors::StoreError;
use crate::model::{ModelRecord, PipelineRecord};
use crate::report::xunit;
use crate::storage::ResultStore;

/// Default size of the dedup window: how many recent runs' pipeline URLs
/// are checked before importing. Pipelines older than the window may be
/// re-imported; since import is idempotent in effect, that is an accepted
/// cost/completeness tradeoff, not a correctness bug.
pub const DEFAULT_DEDUP_WINDOW: u32 = 200;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub limit: u32,
    pub ref_name: Option<String>,
    pub status: Option<String>,
    pub dedup_window: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            limit: 20,
            ref_name: None,
            status: None,
            dedup_window: DEFAULT_DEDUP_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncError {
    pub pipeline_id: i64,
    pub job_id: Option<i64>,
    pub message: String,
}

#[derive(Debug, Default, Serialize)]
pub struct SyncSummary {
    pub pipelines_checked: u32,
    pub pipelines_skipped: u32,
    pub artifacts_downloaded: u32,
    pub runs_imported: u32,
    pub errors: Vec<SyncError>,
}

/// Bounded-window check against already-archived pipeline URLs.
pub struct Deduplicator {
    seen: HashSet<String>,
}

impl Deduplicator {
    /// Loads the window once per sync. A store read failure degrades to an
    /// empty window (everything looks new) rather than aborting the batch.
    pub fn load(store: &dyn ResultStore, window: u32) -> Self {
        let seen = match store.recent_pipeline_urls(window) {
            Ok(urls) => urls.iter().map(|u| canonical_url(u)).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "dedup window unavailable; importing without dedup");
                HashSet::new()
            }
        };
        Self { seen }
    }

    pub fn contains(&self, url: &str) -> bool {
        self.seen.contains(&canonical_url(url))
    }
}

pub fn canonical_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

pub struct SyncOrchestrator<'a> {
    pub ci: &'a dyn CiApi,
    pub store: &'a dyn ResultStore,
    pub options: SyncOptions,
}

impl SyncOrchestrator<'_> {
    pub async fn sync(&self) -> SyncSummary {
        let mut summary = SyncSummary::default();
        let dedup = Deduplicator::load(self.store, self.options.dedup_window);
        let pipelines = self
            .ci
            .list_pipelines(
                self.options.ref_name.as_deref(),
                self.options.status.as_deref(),
                self.options.limit,
            )
            .await;

        for pipeline in pipelines {
            summary.pipelines_checked += 1;
            let mut job_count = 0u32;
            let mut artifact_count = 0u32;

            let duplicate = pipeline
                .web_url
                .as_deref()
                .map(|url| dedup.contains(url))
                .unwrap_or(false);
            if duplicate {
                summary.pipelines_skipped += 1;
                tracing::debug!(pipeline_id = pipeline.id, "pipeline already archived; skipping");
            } else {
                let jobs = self.ci.list_jobs(pipeline.id, None).await;
                job_count = jobs.len() as u32;
                for job in &jobs {
                    let Some((path, bytes)) = self.ci.download_result_artifact(job.id).await else {
                        continue;
                    };
                    summary.artifacts_downloaded += 1;
                    artifact_count += 1;
                    match self.import_artifact(&pipeline, &bytes) {
                        Ok(run_id) => {
                            summary.runs_imported += 1;
                            tracing::info!(
                                pipeline_id = pipeline.id,
                                job_id = job.id,
                                run_id,
                                path = %path,
                                "imported archived run"
                            );
                        }
                        Err(message) => {
                            tracing::warn!(
                                pipeline_id = pipeline.id,
                                job_id = job.id,
                                %message,
                                "artifact import failed"
                            );
                            summary.errors.push(SyncError {
                                pipeline_id: pipeline.id,
                                job_id: Some(job.id),
                                message,
                            });
                        }
                    }
                }
            }

            // Pipeline history exists even when no artifact was found.
            let record = pipeline_record(&pipeline, job_count, artifact_count);
            if let Err(e) = self.store.upsert_pipeline(&record) {
                summary.errors.push(SyncError {
                    pipeline_id: pipeline.id,
                    job_id: None,
                    message: format!("pipeline upsert: {}", e),
                });
            }
        }

        summary
    }

    fn import_artifact(&self, pipeline: &PipelineSummary, bytes: &[u8]) -> Result<i64, String> {
        let text = std::str::from_utf8(bytes).map_err(|e| format!("artifact not utf-8: {}", e))?;
        let mut parsed = xunit::parse_document(text).map_err(|e| e.to_string())?;

        // Pipeline context fills whatever the artifact did not carry; the
        // pipeline URL always comes from the pipeline so dedup keys match.
        if let Some(url) = &pipeline.web_url {
            parsed.run.pipeline_url = Some(url.clone());
        }
        if parsed.run.commit_sha.is_none() {
            parsed.run.commit_sha = pipeline.sha.clone();
        }
        if parsed.run.branch.is_none() {
            parsed.run.branch = pipeline.ref_name.clone();
        }

        let run_id = self
            .store
            .write_run(&parsed.run, &parsed.results)
            .map_err(|e| e.to_string())?;

        if !parsed.run.model.is_empty() {
            let record = ModelRecord {
                model: parsed.run.model.clone(),
                last_tested_at: parsed.run.started_at,
            };
            if let Err(e) = self.store.upsert_model(&record) {
                tracing::warn!(error = %e, model = %parsed.run.model, "model upsert failed");
            }
        }

        Ok(run_id)
    }
}

fn pipeline_record(pipeline: &PipelineSummary, job_count: u32, artifact_count: u32) -> PipelineRecord {
    PipelineRecord {
        pipeline_id: pipeline.id,
        status: pipeline.status.clone(),
        ref_name: pipeline.ref_name.clone(),
        sha: pipeline.sha.clone(),
        url: pipeline.web_url.clone(),
        created_at: pipeline.created_at.clone(),
        updated_at: pipeline.updated_at.clone(),
        duration_seconds: pipeline.duration,
        job_count,
        artifact_count,
    }
}

#[derive(Debug, Serialize)]
pub struct VerifyReport {
    pub recent_runs: usize,
    pub newest_started_at: Option<DateTime<Utc>>,
    pub min_runs: u32,
    pub max_age_hours: i64,
}

impl VerifyReport {
    pub fn enough(&self) -> bool {
        self.recent_runs >= self.min_runs as usize
    }

    pub fn fresh(&self) -> bool {
        match self.newest_started_at {
            Some(at) => Utc::now() - at <= Duration::hours(self.max_age_hours),
            None => false,
        }
    }

    pub fn ok(&self) -> bool {
        if self.min_runs == 0 {
            return true;
        }
        self.enough() && self.fresh()
    }
}

/// CI gate over the archive: enough recent rows, and the newest one recent
/// enough. The only operation whose judgment is meant to fail a process.
pub fn verify(
    store: &dyn ResultStore,
    min_runs: u32,
    max_age_hours: i64,
) -> Result<VerifyReport, StoreError> {
    let runs = store.recent_runs(min_runs.max(1))?;
    Ok(VerifyReport {
        recent_runs: runs.len(),
        newest_started_at: runs.first().map(|r| r.started_at),
        min_runs,
        max_age_hours,
    })
}
