use std::path::{Path, PathBuf};

use anyhow::Context;
use tally_core::ci::{CiApi, CiConfig, GitLabClient};
use tally_core::spool;
use tally_core::storage::open_store;
use tally_core::sync::{self, SyncOptions, SyncOrchestrator};

use super::args::*;

pub mod exit_codes {
    pub const OK: i32 = 0;
    pub const VERIFY_FAILED: i32 = 1;
    pub const CONFIG_ERROR: i32 = 2;
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    match cli.cmd {
        Command::Status(args) => cmd_status(args),
        Command::ListPipelines(args) => cmd_list_pipelines(args).await,
        Command::ListJobs(args) => cmd_list_jobs(args).await,
        Command::FetchArtifact(args) => cmd_fetch_artifact(args).await,
        Command::Sync(args) => cmd_sync(args).await,
        Command::Verify(args) => cmd_verify(args),
        Command::ReplaySpool(args) => cmd_replay_spool(args),
        Command::Export(args) => cmd_export(args),
    }
}

fn build_client(args: &CiArgs) -> anyhow::Result<GitLabClient> {
    let config = CiConfig::resolve(args.ci_url.clone(), args.project.clone(), args.token.clone());
    GitLabClient::new(&config)
}

fn fmt_count(n: Option<u64>) -> String {
    n.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
}

fn cmd_status(args: StatusArgs) -> anyhow::Result<i32> {
    let store = open_store(&args.db).with_context(|| format!("open store {}", args.db))?;
    let stats = store.stats().context("read archive stats")?;
    println!("archive: {}", args.db);
    println!("  runs:      {}", fmt_count(stats.runs));
    println!("  results:   {}", fmt_count(stats.results));
    println!("  pipelines: {}", fmt_count(stats.pipelines));
    println!("  models:    {}", fmt_count(stats.models));
    match (stats.last_run_id, stats.last_run_at) {
        (Some(id), Some(at)) => println!("  last run:  #{} at {}", id, at),
        _ => println!("  last run:  none"),
    }
    Ok(exit_codes::OK)
}

async fn cmd_list_pipelines(args: ListPipelinesArgs) -> anyhow::Result<i32> {
    let client = match build_client(&args.ci) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("config error: {e}");
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    let pipelines = client
        .list_pipelines(args.ref_name.as_deref(), args.status.as_deref(), args.limit)
        .await;
    if pipelines.is_empty() {
        println!("no pipelines found");
        return Ok(exit_codes::OK);
    }
    for p in &pipelines {
        println!(
            "{:>10}  {:<9} {:<24} {:<10} {}",
            p.id,
            p.status,
            p.ref_name.as_deref().unwrap_or("-"),
            p.sha.as_deref().map(|s| s.get(..8).unwrap_or(s)).unwrap_or("-"),
            p.web_url.as_deref().unwrap_or("-"),
        );
    }
    println!("{} pipelines", pipelines.len());
    Ok(exit_codes::OK)
}

async fn cmd_list_jobs(args: ListJobsArgs) -> anyhow::Result<i32> {
    let client = match build_client(&args.ci) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("config error: {e}");
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    let jobs = client.list_jobs(args.pipeline_id, args.scope.as_deref()).await;
    if jobs.is_empty() {
        println!("no jobs found for pipeline {}", args.pipeline_id);
        return Ok(exit_codes::OK);
    }
    for job in &jobs {
        println!(
            "{:>10}  {:<9} {:<12} {}",
            job.id,
            job.status,
            job.stage.as_deref().unwrap_or("-"),
            job.name,
        );
    }
    println!("{} jobs in pipeline {}", jobs.len(), args.pipeline_id);
    Ok(exit_codes::OK)
}

async fn cmd_fetch_artifact(args: FetchArtifactArgs) -> anyhow::Result<i32> {
    let client = match build_client(&args.ci) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("config error: {e}");
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    let found = match &args.path {
        Some(path) => client
            .download_artifact(args.job_id, path)
            .await
            .map(|bytes| (path.clone(), bytes)),
        None => client.download_result_artifact(args.job_id).await,
    };
    match found {
        Some((path, bytes)) => {
            let out = args.out.unwrap_or_else(|| {
                Path::new(&path)
                    .file_name()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("output.xml"))
            });
            std::fs::write(&out, &bytes)
                .with_context(|| format!("write artifact to {}", out.display()))?;
            println!(
                "job {}: wrote {} bytes from {} to {}",
                args.job_id,
                bytes.len(),
                path,
                out.display()
            );
        }
        None => {
            println!(
                "job {}: no result artifact found at any candidate path",
                args.job_id
            );
        }
    }
    Ok(exit_codes::OK)
}

async fn cmd_sync(args: SyncArgs) -> anyhow::Result<i32> {
    let store = open_store(&args.db).with_context(|| format!("open store {}", args.db))?;
    let client = match build_client(&args.ci) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("config error: {e}");
            return Ok(exit_codes::CONFIG_ERROR);
        }
    };
    let orchestrator = SyncOrchestrator {
        ci: &client,
        store: store.as_ref(),
        options: SyncOptions {
            limit: args.limit,
            ref_name: args.ref_name,
            status: args.status,
            dedup_window: args.dedup_window,
        },
    };
    let summary = orchestrator.sync().await;
    println!(
        "checked {} pipelines ({} already archived)",
        summary.pipelines_checked, summary.pipelines_skipped
    );
    println!(
        "downloaded {} artifacts, imported {} runs",
        summary.artifacts_downloaded, summary.runs_imported
    );
    if !summary.errors.is_empty() {
        println!("{} errors:", summary.errors.len());
        for e in &summary.errors {
            match e.job_id {
                Some(job_id) => println!("  pipeline {} job {}: {}", e.pipeline_id, job_id, e.message),
                None => println!("  pipeline {}: {}", e.pipeline_id, e.message),
            }
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_verify(args: VerifyArgs) -> anyhow::Result<i32> {
    let store = open_store(&args.db).with_context(|| format!("open store {}", args.db))?;
    let report = sync::verify(store.as_ref(), args.min_runs, args.max_age_hours)
        .context("read archive for verify")?;
    println!(
        "recent runs: {} (minimum {})",
        report.recent_runs, report.min_runs
    );
    match report.newest_started_at {
        Some(at) => println!("newest run:  {} (maximum age {}h)", at.to_rfc3339(), report.max_age_hours),
        None => println!("newest run:  none"),
    }
    if report.ok() {
        println!("verify passed");
        Ok(exit_codes::OK)
    } else {
        println!("verify failed");
        Ok(exit_codes::VERIFY_FAILED)
    }
}

fn cmd_replay_spool(args: ReplaySpoolArgs) -> anyhow::Result<i32> {
    let store = open_store(&args.db).with_context(|| format!("open store {}", args.db))?;
    let outcome = spool::replay(store.as_ref(), &args.spool)
        .with_context(|| format!("replay spool {}", args.spool.display()))?;
    println!(
        "replayed {} spooled runs, {} left in spool",
        outcome.replayed, outcome.remaining
    );
    Ok(exit_codes::OK)
}

fn cmd_export(args: ExportArgs) -> anyhow::Result<i32> {
    let store = open_store(&args.db).with_context(|| format!("open store {}", args.db))?;
    let value = store.export_json().context("export archive")?;
    let text = serde_json::to_string_pretty(&value)?;
    match args.out {
        Some(out) => {
            std::fs::write(&out, text).with_context(|| format!("write {}", out.display()))?;
            println!("exported archive to {}", out.display());
        }
        None => println!("{}", text),
    }
    Ok(exit_codes::OK)
}
