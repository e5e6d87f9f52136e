use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Durable, resumable pipeline orchestrator for AI-assisted development")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the data directory and write a starter config
    Init,
    /// Submit a feature request and drive it through the pipeline
    Start {
        /// The feature request, in plain language
        request: String,
    },
    /// Resume a failed, cancelled, or interrupted run from its first
    /// incomplete stage
    Resume { run_id: Uuid },
    /// Show one run's report, or list all runs
    Status { run_id: Option<Uuid> },
    /// Request cancellation at the next stage boundary
    Cancel { run_id: Uuid },
    /// Discard a run's (typically corrupted) checkpoint
    DiscardCheckpoint {
        run_id: Uuid,
        /// Required: the run will re-execute every stage from the start
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = conductor::config::resolve_project_dir(cli.project_dir.clone())?;
    let config = conductor::config::Config::load(project_dir)?;
    let _log_guard = conductor::logging::init(&config.log_dir, cli.verbose);

    match &cli.command {
        Commands::Init => cmd::cmd_init(&config)?,
        Commands::Start { request } => cmd::cmd_start(&config, request).await?,
        Commands::Resume { run_id } => cmd::cmd_resume(&config, *run_id).await?,
        Commands::Status { run_id } => cmd::cmd_status(&config, *run_id)?,
        Commands::Cancel { run_id } => cmd::cmd_cancel(&config, *run_id).await?,
        Commands::DiscardCheckpoint { run_id, force } => {
            cmd::cmd_discard_checkpoint(&config, *run_id, *force)?
        }
    }

    Ok(())
}
