use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::{CiApi, CiConfig, JobSummary, PipelineSummary};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GitLabClient {
    http: reqwest::Client,
    base_url: String,
    project: String,
    token: Option<String>,
}

impl GitLabClient {
    pub fn new(config: &CiConfig) -> anyhow::Result<Self> {
        let base_url = config.base_url.clone().ok_or_else(|| {
            anyhow::anyhow!("CI base URL not configured (use --ci-url, CI_API_V4_URL, or TALLY_CI_URL)")
        })?;
        let project = config.project.clone().ok_or_else(|| {
            anyhow::anyhow!("CI project not configured (use --project, CI_PROJECT_ID, or TALLY_CI_PROJECT)")
        })?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            // Project paths like group/name travel percent-encoded.
            project: project.replace('/', "%2F"),
            token: config.token.clone(),
        })
    }

    fn url(&self, tail: &str) -> String {
        format!("{}/projects/{}/{}", self.base_url, self.project, tail)
    }

    fn request(&self, url: &str) -> reqwest::RequestBuilder {
        let mut req = self.http.get(url);
        if let Some(token) = &self.token {
            req = req.header("PRIVATE-TOKEN", token);
        }
        req
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<T> {
        let resp = self.request(url).query(query).send().await?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("{} returned {}", url, status);
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl CiApi for GitLabClient {
    async fn list_pipelines(
        &self,
        ref_name: Option<&str>,
        status: Option<&str>,
        limit: u32,
    ) -> Vec<PipelineSummary> {
        let mut query = vec![("per_page", limit.to_string())];
        if let Some(r) = ref_name {
            query.push(("ref", r.to_string()));
        }
        if let Some(s) = status {
            query.push(("status", s.to_string()));
        }
        let url = self.url("pipelines");
        match self.get_json::<Vec<PipelineSummary>>(&url, &query).await {
            Ok(mut pipelines) => {
                pipelines.truncate(limit as usize);
                pipelines
            }
            Err(e) => {
                tracing::warn!(error = %e, "pipeline listing failed");
                Vec::new()
            }
        }
    }

    async fn list_jobs(&self, pipeline_id: i64, scope: Option<&str>) -> Vec<JobSummary> {
        let mut query = Vec::new();
        if let Some(s) = scope {
            query.push(("scope", s.to_string()));
        }
        let url = self.url(&format!("pipelines/{}/jobs", pipeline_id));
        match self.get_json::<Vec<JobSummary>>(&url, &query).await {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::warn!(error = %e, pipeline_id, "job listing failed");
                Vec::new()
            }
        }
    }

    async fn download_artifact(&self, job_id: i64, path: &str) -> Option<Vec<u8>> {
        let url = self.url(&format!("jobs/{}/artifacts/{}", job_id, path));
        match self.request(&url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.bytes().await {
                Ok(bytes) => Some(bytes.to_vec()),
                Err(e) => {
                    tracing::warn!(error = %e, job_id, path, "artifact body read failed");
                    None
                }
            },
            Ok(resp) => {
                // 404 is the ordinary no-artifact-here answer.
                if resp.status() != reqwest::StatusCode::NOT_FOUND {
                    tracing::warn!(status = %resp.status(), job_id, path, "artifact request rejected");
                }
                None
            }
            Err(e) => {
                tracing::warn!(error = %e, job_id, path, "artifact download failed");
                None
            }
        }
    }
}
