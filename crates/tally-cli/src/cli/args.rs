use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tally",
    version,
    about = "Archive and synchronize LLM test-harness results"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show archive totals and the latest archived run
    Status(StatusArgs),
    /// List recent CI pipelines
    ListPipelines(ListPipelinesArgs),
    /// List the jobs of one pipeline
    ListJobs(ListJobsArgs),
    /// Download a result artifact from a job
    FetchArtifact(FetchArtifactArgs),
    /// Import recent CI pipelines into the archive
    Sync(SyncArgs),
    /// Gate on archive volume and freshness (exit 1 on failure)
    Verify(VerifyArgs),
    /// Re-archive payloads spooled while storage was unreachable
    ReplaySpool(ReplaySpoolArgs),
    /// Dump the archive as JSON
    Export(ExportArgs),
}

#[derive(clap::Args, Clone)]
pub struct CiArgs {
    /// CI API base URL (e.g. https://gitlab.example.com/api/v4)
    #[arg(long)]
    pub ci_url: Option<String>,

    /// CI project id or path
    #[arg(long)]
    pub project: Option<String>,

    /// CI API token
    #[arg(long, hide = true)]
    pub token: Option<String>,
}

#[derive(clap::Args, Clone)]
pub struct StatusArgs {
    /// Storage connection string (postgres://… or a SQLite path)
    #[arg(long, default_value = ".tally/results.db")]
    pub db: String,
}

#[derive(clap::Args, Clone)]
pub struct ListPipelinesArgs {
    #[command(flatten)]
    pub ci: CiArgs,

    /// Only pipelines for this git ref
    #[arg(long = "ref")]
    pub ref_name: Option<String>,

    /// Only pipelines with this status (e.g. success, failed)
    #[arg(long)]
    pub status: Option<String>,

    #[arg(long, default_value_t = 20)]
    pub limit: u32,
}

#[derive(clap::Args, Clone)]
pub struct ListJobsArgs {
    #[command(flatten)]
    pub ci: CiArgs,

    pub pipeline_id: i64,

    /// Job scope filter (e.g. success, failed)
    #[arg(long)]
    pub scope: Option<String>,
}

#[derive(clap::Args, Clone)]
pub struct FetchArtifactArgs {
    #[command(flatten)]
    pub ci: CiArgs,

    pub job_id: i64,

    /// Artifact path inside the job; candidate paths are tried when omitted
    #[arg(long)]
    pub path: Option<String>,

    /// Output file (defaults to the artifact's file name)
    #[arg(long)]
    pub out: Option<PathBuf>,
}

#[derive(clap::Args, Clone)]
pub struct SyncArgs {
    #[command(flatten)]
    pub ci: CiArgs,

    #[arg(long, default_value = ".tally/results.db")]
    pub db: String,

    /// Only pipelines for this git ref
    #[arg(long = "ref")]
    pub ref_name: Option<String>,

    /// Only pipelines with this status
    #[arg(long)]
    pub status: Option<String>,

    /// How many recent pipelines to check
    #[arg(long, default_value_t = 20)]
    pub limit: u32,

    /// How many recent runs' pipeline URLs to dedup against
    #[arg(long, default_value_t = tally_core::sync::DEFAULT_DEDUP_WINDOW)]
    pub dedup_window: u32,
}

#[derive(clap::Args, Clone)]
pub struct VerifyArgs {
    #[arg(long, default_value = ".tally/results.db")]
    pub db: String,

    /// Minimum number of archived runs expected in the window
    #[arg(long, default_value_t = 1)]
    pub min_runs: u32,

    /// Maximum age of the newest archived run, in hours
    #[arg(long, default_value_t = 168)]
    pub max_age_hours: i64,
}

#[derive(clap::Args, Clone)]
pub struct ReplaySpoolArgs {
    #[arg(long, default_value = ".tally/results.db")]
    pub db: String,

    #[arg(long, default_value = ".tally/spool.jsonl")]
    pub spool: PathBuf,
}

#[derive(clap::Args, Clone)]
pub struct ExportArgs {
    #[arg(long, default_value = ".tally/results.db")]
    pub db: String,

    /// Output file (stdout when omitted)
    #[arg(long)]
    pub out: Option<PathBuf>,
}
