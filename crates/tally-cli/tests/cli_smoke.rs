use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn tally() -> Command {
    Command::cargo_bin("tally").unwrap()
}

#[test]
fn status_on_fresh_archive_reports_zero_runs() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("results.db");

    tally()
        .args(["status", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("runs:      0"))
        .stdout(predicate::str::contains("last run:  none"));
}

#[test]
fn verify_fails_on_empty_archive() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("results.db");

    tally()
        .args(["verify", "--min-runs", "1", "--db"])
        .arg(&db)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("verify failed"));
}

#[test]
fn verify_passes_with_min_runs_zero() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("results.db");

    tally()
        .args(["verify", "--min-runs", "0", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("verify passed"));
}

#[test]
fn export_prints_archive_json() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("results.db");

    tally()
        .args(["export", "--db"])
        .arg(&db)
        .assert()
        .success()
        .stdout(predicate::str::contains("\"runs\""))
        .stdout(predicate::str::contains("\"pipelines\""));
}

#[test]
fn ci_commands_require_configuration() {
    // Clear the environment so neither the CI-injected nor the
    // user-supplied variables can satisfy the config.
    tally()
        .env_remove("CI_API_V4_URL")
        .env_remove("CI_PROJECT_ID")
        .env_remove("CI_JOB_TOKEN")
        .env_remove("TALLY_CI_URL")
        .env_remove("TALLY_CI_PROJECT")
        .env_remove("TALLY_CI_TOKEN")
        .args(["list-pipelines"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("config error"));
}

#[test]
fn replay_spool_on_missing_file_is_a_noop() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("results.db");
    let spool = dir.path().join("spool.jsonl");

    tally()
        .args(["replay-spool", "--db"])
        .arg(&db)
        .arg("--spool")
        .arg(&spool)
        .assert()
        .success()
        .stdout(predicate::str::contains("replayed 0 spooled runs"));
}
