pub mod gitlab;

pub use gitlab::GitLabClient;

use std::env;

use async_trait::async_trait;
use serde::Deserialize;

/// Candidate locations of the result document inside a job's artifact
/// tree. Different job templates store it under different relative paths;
/// the first hit wins.
pub const ARTIFACT_CANDIDATE_PATHS: &[&str] = &[
    "results/output.xml",
    "output.xml",
    "test-results/output.xml",
    "artifacts/output.xml",
];

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSummary {
    pub id: i64,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "ref", default)]
    pub ref_name: Option<String>,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobSummary {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub stage: Option<String>,
}

/// Remote CI connection settings. Resolution priority per field: explicit
/// parameter, then the CI-runtime-injected environment (present when we
/// run inside a pipeline job), then user-supplied variables.
#[derive(Debug, Clone, Default)]
pub struct CiConfig {
    pub base_url: Option<String>,
    pub project: Option<String>,
    pub token: Option<String>,
}

impl CiConfig {
    pub fn resolve(
        base_url: Option<String>,
        project: Option<String>,
        token: Option<String>,
    ) -> Self {
        Self {
            base_url: base_url
                .or_else(|| env_nonempty("CI_API_V4_URL"))
                .or_else(|| env_nonempty("TALLY_CI_URL")),
            project: project
                .or_else(|| env_nonempty("CI_PROJECT_ID"))
                .or_else(|| env_nonempty("TALLY_CI_PROJECT")),
            token: token
                .or_else(|| env_nonempty("CI_JOB_TOKEN"))
                .or_else(|| env_nonempty("TALLY_CI_TOKEN")),
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}

/// Remote CI REST surface. Implementations never raise: every network or
/// API fault is logged internally and mapped to an empty result, so one
/// unreachable job cannot abort a sync batch.
#[async_trait]
pub trait CiApi: Send + Sync {
    async fn list_pipelines(
        &self,
        ref_name: Option<&str>,
        status: Option<&str>,
        limit: u32,
    ) -> Vec<PipelineSummary>;

    async fn list_jobs(&self, pipeline_id: i64, scope: Option<&str>) -> Vec<JobSummary>;

    /// Downloads one named artifact file; `None` means absent (or
    /// unreachable, which callers treat the same way).
    async fn download_artifact(&self, job_id: i64, path: &str) -> Option<Vec<u8>>;

    /// Tries [`ARTIFACT_CANDIDATE_PATHS`] in order and stops at the first
    /// hit. Exhausting the list is "absent", not an error.
    async fn download_result_artifact(&self, job_id: i64) -> Option<(String, Vec<u8>)> {
        for path in ARTIFACT_CANDIDATE_PATHS {
            if let Some(bytes) = self.download_artifact(job_id, path).await {
                return Some(((*path).to_string(), bytes));
            }
        }
        None
    }
}
