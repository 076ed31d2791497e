use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Pass,
    Fail,
    Skip,
}

impl TestStatus {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "pass" | "passed" => TestStatus::Pass,
            "skip" | "skipped" => TestStatus::Skip,
            _ => TestStatus::Fail,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::Pass => "pass",
            TestStatus::Fail => "fail",
            TestStatus::Skip => "skip",
        }
    }
}

/// One archived execution: a single suite run or a combined multi-suite run.
///
/// `pipeline_url`, when present, acts as the natural dedup key for runs
/// that originated from CI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub started_at: DateTime<Utc>,
    pub model: String,
    pub model_release: Option<String>,
    pub suite: String,
    pub commit_sha: Option<String>,
    pub branch: Option<String>,
    pub pipeline_url: Option<String>,
    pub runner: Option<String>,
    pub runner_tags: Option<String>,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub duration_seconds: f64,
    pub harness_version: Option<String>,
    pub temperature: Option<f64>,
    pub seed: Option<i64>,
    pub top_p: Option<f64>,
    pub top_k: Option<i64>,
    pub wall_seconds: Option<f64>,
    pub cost_usd: Option<f64>,
}

impl TestRun {
    pub fn new(suite: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: None,
            started_at,
            model: String::new(),
            model_release: None,
            suite: suite.into(),
            commit_sha: None,
            branch: None,
            pipeline_url: None,
            runner: None,
            runner_tags: None,
            total: 0,
            passed: 0,
            failed: 0,
            skipped: 0,
            duration_seconds: 0.0,
            harness_version: None,
            temperature: None,
            seed: None,
            top_p: None,
            top_k: None,
            wall_seconds: None,
            cost_usd: None,
        }
    }
}

/// One per-test outcome, owned by exactly one [`TestRun`]. Insert-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub test_name: String,
    pub status: TestStatus,
    pub score: Option<f64>,
    pub question: Option<String>,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub reason: Option<String>,
}

impl TestResult {
    pub fn status_only(test_name: impl Into<String>, status: TestStatus) -> Self {
        Self {
            test_name: test_name.into(),
            status,
            score: None,
            question: None,
            expected: None,
            actual: None,
            reason: None,
        }
    }
}

/// Metadata-only record of a remote CI pipeline's observed existence,
/// keyed by pipeline id. Upserted on every observation, independent of
/// whether a result artifact was ever found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub pipeline_id: i64,
    pub status: String,
    pub ref_name: Option<String>,
    pub sha: Option<String>,
    pub url: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub duration_seconds: Option<f64>,
    pub job_count: u32,
    pub artifact_count: u32,
}

/// One row per distinct model identifier, refreshed whenever a run
/// references the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model: String,
    pub last_tested_at: DateTime<Utc>,
}

/// Line marker behind which the grading payload is logged during live runs.
pub const GRADING_MARKER: &str = "grading-json:";

const GRADING_VERSION: u32 = 1;

/// Structured grading sub-payload embedded in free-text log output.
///
/// Versioned explicitly; lines carrying an unknown version are ignored
/// rather than treated as errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingPayload {
    #[serde(default = "default_grading_version")]
    pub v: u32,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub expected: Option<String>,
    #[serde(default)]
    pub actual: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

fn default_grading_version() -> u32 {
    GRADING_VERSION
}

impl GradingPayload {
    /// Scans free-text lines for the first parseable grading payload.
    pub fn extract<'a, I>(lines: I) -> Option<GradingPayload>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let marker = regex::Regex::new(&format!(r"{}\s*(\{{.*\}})", GRADING_MARKER)).ok()?;
        for line in lines {
            let Some(caps) = marker.captures(line) else {
                continue;
            };
            match serde_json::from_str::<GradingPayload>(&caps[1]) {
                Ok(payload) if payload.v == GRADING_VERSION => return Some(payload),
                Ok(payload) => {
                    tracing::debug!(version = payload.v, "ignoring grading payload with unknown version");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "ignoring unparseable grading payload");
                }
            }
        }
        None
    }

    pub fn apply_to(&self, result: &mut TestResult) {
        result.score = self.score;
        result.question = self.question.clone();
        result.expected = self.expected.clone();
        result.actual = self.actual.clone();
        result.reason = self.reason.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grading_payload_extracted_from_log_lines() {
        let lines = [
            "running grader",
            r#"grading-json: {"v":1,"score":0.75,"expected":"4","actual":"four","reason":"wrong format"}"#,
        ];
        let payload = GradingPayload::extract(lines).unwrap();
        assert_eq!(payload.score, Some(0.75));
        assert_eq!(payload.expected.as_deref(), Some("4"));
    }

    #[test]
    fn grading_payload_unknown_version_ignored() {
        let lines = [r#"grading-json: {"v":99,"score":1.0}"#];
        assert!(GradingPayload::extract(lines).is_none());
    }

    #[test]
    fn grading_payload_garbage_ignored() {
        let lines = ["grading-json: {not json", "plain log line"];
        assert!(GradingPayload::extract(lines).is_none());
    }

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!(TestStatus::parse("PASS"), TestStatus::Pass);
        assert_eq!(TestStatus::parse("Skipped"), TestStatus::Skip);
        assert_eq!(TestStatus::parse("anything-else"), TestStatus::Fail);
    }
}
