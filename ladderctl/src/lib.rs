use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use ladder_core::{load_config, LadderConfig, S3Client, SqliteJobStore, SystemCommandExecutor};
use thiserror::Error;

pub mod commands;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] ladder_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(#[from] ladder_core::StoreError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] ladder_core::PipelineError),
    #[error("storage error: {0}")]
    Storage(#[from] ladder_core::StorageError),
    #[error("workspace error: {0}")]
    Workspace(#[from] ladder_core::WorkspaceError),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Ladder conversion service control interface", long_about = None)]
pub struct Cli {
    /// Path to the service configuration
    #[arg(long, default_value = "configs/ladder.toml")]
    pub config: PathBuf,
    /// Override for database.path
    #[arg(long)]
    pub database: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Conversion job operations
    #[command(subcommand)]
    Job(JobCommands),
    /// Run the conversion worker
    #[command(subcommand)]
    Worker(WorkerCommands),
    /// Workspace maintenance
    #[command(subcommand)]
    Workspace(WorkspaceCommands),
    /// Probe database and object store reachability
    Health,
}

#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// Submit a new conversion job
    Submit(JobSubmitArgs),
    /// Show one job
    Status(JobIdArg),
    /// List jobs by status
    List(JobListArgs),
    /// Request cancellation of a running job
    Cancel(JobIdArg),
    /// List recorded conversion errors for a job
    Errors(JobIdArg),
    /// List uploaded artifacts for a job
    Artifacts(JobIdArg),
}

#[derive(Args, Debug)]
pub struct JobSubmitArgs {
    /// Source bucket
    #[arg(long)]
    pub bucket: String,
    /// Source object key
    #[arg(long)]
    pub key: String,
    /// Conversion profile as inline JSON; defaults apply when omitted
    #[arg(long)]
    pub profile: Option<String>,
    /// Path to a JSON profile file (mutually exclusive with --profile)
    #[arg(long)]
    pub profile_file: Option<PathBuf>,
    /// Logical video grouping id
    #[arg(long)]
    pub video_id: Option<uuid::Uuid>,
    /// Deduplication key; resubmission returns the existing job
    #[arg(long)]
    pub idempotency_key: Option<String>,
    #[arg(long, default_value_t = 0)]
    pub priority: i64,
}

#[derive(Args, Debug)]
pub struct JobIdArg {
    pub id: uuid::Uuid,
}

#[derive(Args, Debug)]
pub struct JobListArgs {
    /// QUEUED, RUNNING, COMPLETED, FAILED or CANCELED
    #[arg(long, default_value = "QUEUED")]
    pub status: String,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum WorkerCommands {
    /// Claim queued jobs and drive them through the pipeline
    Run(WorkerRunArgs),
}

#[derive(Args, Debug)]
pub struct WorkerRunArgs {
    /// Seconds between queue polls
    #[arg(long, default_value_t = 5)]
    pub poll_secs: u64,
    /// Process the current queue once and exit
    #[arg(long)]
    pub once: bool,
}

#[derive(Subcommand, Debug)]
pub enum WorkspaceCommands {
    /// Remove unlocked orphan workspaces
    Sweep(WorkspaceSweepArgs),
}

#[derive(Args, Debug)]
pub struct WorkspaceSweepArgs {
    /// Override worker.orphan_max_age_hours
    #[arg(long)]
    pub max_age_hours: Option<u64>,
}

pub struct AppContext {
    pub config: Arc<LadderConfig>,
    pub store: SqliteJobStore,
    pub format: OutputFormat,
}

impl AppContext {
    fn load(cli: &Cli) -> Result<Self> {
        let mut config = load_config(&cli.config)?;
        if let Some(database) = &cli.database {
            config.database.path = database.to_string_lossy().into_owned();
        }
        let store = SqliteJobStore::new(&config.database.path)?;
        store.initialize()?;
        Ok(Self {
            config: Arc::new(config),
            store,
            format: cli.format,
        })
    }

    pub fn s3(&self) -> S3Client {
        S3Client::new(&self.config.s3)
    }

    pub fn executor(&self) -> Arc<SystemCommandExecutor> {
        Arc::new(SystemCommandExecutor)
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    init_tracing(&cli)?;
    let context = AppContext::load(&cli)?;

    match &cli.command {
        Commands::Job(command) => commands::jobs::run(&context, command),
        Commands::Worker(WorkerCommands::Run(args)) => {
            commands::worker::run(&context, args).await
        }
        Commands::Workspace(WorkspaceCommands::Sweep(args)) => {
            commands::worker::sweep(&context, args)
        }
        Commands::Health => commands::worker::health(&context).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_job_submit() {
        let cli = Cli::parse_from([
            "ladderctl",
            "job",
            "submit",
            "--bucket",
            "ingest",
            "--key",
            "library/movie.mkv",
            "--idempotency-key",
            "submit-42",
        ]);
        match cli.command {
            Commands::Job(JobCommands::Submit(args)) => {
                assert_eq!(args.bucket, "ingest");
                assert_eq!(args.key, "library/movie.mkv");
                assert_eq!(args.idempotency_key.as_deref(), Some("submit-42"));
                assert_eq!(args.priority, 0);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_worker_run_with_poll_interval() {
        let cli = Cli::parse_from(["ladderctl", "worker", "run", "--poll-secs", "2", "--once"]);
        match cli.command {
            Commands::Worker(WorkerCommands::Run(args)) => {
                assert_eq!(args.poll_secs, 2);
                assert!(args.once);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_workspace_sweep_override() {
        let cli = Cli::parse_from(["ladderctl", "workspace", "sweep", "--max-age-hours", "48"]);
        match cli.command {
            Commands::Workspace(WorkspaceCommands::Sweep(args)) => {
                assert_eq!(args.max_age_hours, Some(48));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}

fn init_tracing(cli: &Cli) -> Result<()> {
    // The config may be unreadable at this point; fall back to info.
    let level = load_config(&cli.config)
        .map(|config| config.log.level)
        .unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
    Ok(())
}
