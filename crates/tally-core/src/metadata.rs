//! Run-context resolution: structured metadata items first, then their
//! legacy-named aliases, then the environment conventions of the CI
//! platforms we run under (GitLab CI, GitHub Actions). Each field resolves
//! independently; an unresolved field stays `None`.

use std::collections::BTreeMap;
use std::env;

use serde::{Deserialize, Serialize};

use crate::model::TestRun;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub model: Option<String>,
    pub model_release: Option<String>,
    pub commit_sha: Option<String>,
    pub branch: Option<String>,
    pub pipeline_url: Option<String>,
    pub runner: Option<String>,
    pub runner_tags: Option<String>,
    pub harness_version: Option<String>,
    pub temperature: Option<f64>,
    pub seed: Option<i64>,
    pub top_p: Option<f64>,
    pub top_k: Option<i64>,
    pub cost_usd: Option<f64>,
}

impl RunMetadata {
    pub fn apply_to(&self, run: &mut TestRun) {
        if let Some(model) = &self.model {
            run.model = model.clone();
        }
        if self.model_release.is_some() {
            run.model_release = self.model_release.clone();
        }
        if self.commit_sha.is_some() {
            run.commit_sha = self.commit_sha.clone();
        }
        if self.branch.is_some() {
            run.branch = self.branch.clone();
        }
        if self.pipeline_url.is_some() {
            run.pipeline_url = self.pipeline_url.clone();
        }
        if self.runner.is_some() {
            run.runner = self.runner.clone();
        }
        if self.runner_tags.is_some() {
            run.runner_tags = self.runner_tags.clone();
        }
        if self.harness_version.is_some() {
            run.harness_version = self.harness_version.clone();
        }
        if self.temperature.is_some() {
            run.temperature = self.temperature;
        }
        if self.seed.is_some() {
            run.seed = self.seed;
        }
        if self.top_p.is_some() {
            run.top_p = self.top_p;
        }
        if self.top_k.is_some() {
            run.top_k = self.top_k;
        }
        if self.cost_usd.is_some() {
            run.cost_usd = self.cost_usd;
        }
    }
}

/// Resolves a flat field map into typed metadata. Item keys are matched
/// case-insensitively; the first key in each alias list that yields a
/// non-empty value wins, and environment variables are only consulted when
/// no item matched.
pub fn resolve(items: &BTreeMap<String, String>) -> RunMetadata {
    let items: BTreeMap<String, String> = items
        .iter()
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    RunMetadata {
        model: lookup(&items, &["model", "model_name"], &[]),
        model_release: lookup(&items, &["model_release", "release"], &[]),
        commit_sha: lookup(
            &items,
            &["commit", "commit_sha", "git_sha"],
            &["CI_COMMIT_SHA", "GITHUB_SHA"],
        ),
        branch: lookup(
            &items,
            &["branch", "git_branch"],
            &["CI_COMMIT_BRANCH", "CI_COMMIT_REF_NAME", "GITHUB_REF_NAME"],
        ),
        pipeline_url: lookup(&items, &["pipeline_url", "ci_url"], &["CI_PIPELINE_URL"])
            .or_else(github_run_url),
        runner: lookup(
            &items,
            &["runner", "host"],
            &["CI_RUNNER_DESCRIPTION", "RUNNER_NAME"],
        ),
        runner_tags: lookup(&items, &["runner_tags"], &["CI_RUNNER_TAGS"]),
        harness_version: lookup(&items, &["harness_version", "tool_version"], &[]),
        temperature: lookup_parsed(&items, &["temperature"]),
        seed: lookup_parsed(&items, &["seed"]),
        top_p: lookup_parsed(&items, &["top_p"]),
        top_k: lookup_parsed(&items, &["top_k"]),
        cost_usd: lookup_parsed(&items, &["cost_usd", "cost"]),
    }
}

fn lookup(items: &BTreeMap<String, String>, keys: &[&str], env_keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(value) = items.get(*key) {
            if !value.is_empty() {
                return Some(value.clone());
            }
        }
    }
    for key in env_keys {
        if let Ok(value) = env::var(key) {
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

fn lookup_parsed<T: std::str::FromStr>(items: &BTreeMap<String, String>, keys: &[&str]) -> Option<T> {
    lookup(items, keys, &[]).and_then(|v| v.parse().ok())
}

// GitHub exposes no single pipeline-URL variable; it is assembled from the
// server, repository, and run id.
fn github_run_url() -> Option<String> {
    let server = env::var("GITHUB_SERVER_URL").ok().filter(|v| !v.is_empty())?;
    let repo = env::var("GITHUB_REPOSITORY").ok().filter(|v| !v.is_empty())?;
    let run_id = env::var("GITHUB_RUN_ID").ok().filter(|v| !v.is_empty())?;
    Some(format!("{}/{}/actions/runs/{}", server.trim_end_matches('/'), repo, run_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn structured_items_resolve_with_case_normalization() {
        let meta = resolve(&items(&[
            ("Model", "sonnet-4"),
            ("TEMPERATURE", "0.2"),
            ("seed", "42"),
        ]));
        assert_eq!(meta.model.as_deref(), Some("sonnet-4"));
        assert_eq!(meta.temperature, Some(0.2));
        assert_eq!(meta.seed, Some(42));
    }

    #[test]
    fn legacy_aliases_resolve_when_canonical_absent() {
        let meta = resolve(&items(&[
            ("model_name", "haiku-3"),
            ("git_sha", "abc123"),
            ("git_branch", "main"),
        ]));
        assert_eq!(meta.model.as_deref(), Some("haiku-3"));
        assert_eq!(meta.commit_sha.as_deref(), Some("abc123"));
        assert_eq!(meta.branch.as_deref(), Some("main"));
    }

    #[test]
    fn canonical_key_beats_legacy_alias() {
        let meta = resolve(&items(&[("model", "canonical"), ("model_name", "legacy")]));
        assert_eq!(meta.model.as_deref(), Some("canonical"));
    }

    // Environment mutations live in a single test so parallel test threads
    // never race on the same variables.
    #[test]
    fn environment_tier_and_precedence() {
        env::set_var("CI_COMMIT_SHA", "env-sha");
        env::set_var("CI_COMMIT_BRANCH", "env-branch");
        env::set_var("GITHUB_SERVER_URL", "https://github.example.com");
        env::set_var("GITHUB_REPOSITORY", "acme/harness");
        env::set_var("GITHUB_RUN_ID", "777");

        // Unresolved fields fall through to the environment.
        let meta = resolve(&BTreeMap::new());
        assert_eq!(meta.commit_sha.as_deref(), Some("env-sha"));
        assert_eq!(meta.branch.as_deref(), Some("env-branch"));
        assert_eq!(
            meta.pipeline_url.as_deref(),
            Some("https://github.example.com/acme/harness/actions/runs/777")
        );

        // A structured item always beats the environment.
        let meta = resolve(&items(&[("commit", "item-sha")]));
        assert_eq!(meta.commit_sha.as_deref(), Some("item-sha"));

        env::remove_var("CI_COMMIT_SHA");
        env::remove_var("CI_COMMIT_BRANCH");
        env::remove_var("GITHUB_SERVER_URL");
        env::remove_var("GITHUB_REPOSITORY");
        env::remove_var("GITHUB_RUN_ID");
    }

    #[test]
    fn unresolved_fields_stay_empty() {
        let meta = resolve(&BTreeMap::new());
        assert!(meta.model.is_none());
        assert!(meta.harness_version.is_none());
        assert!(meta.top_k.is_none());
    }
}
