use anyhow::Result;
use clap::{Parser, Subcommand};
use conductor::config::EngineConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about = "Multi-agent workflow engine")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory holding conductor.toml and the data dir.
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Explicit config file path (overrides discovery in project dir).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new run for a feature description
    Start {
        /// The feature/task description to implement
        feature: String,

        /// Create the run without driving it
        #[arg(long)]
        no_drive: bool,
    },
    /// Resume a run from its latest checkpoint
    Resume {
        run_id: String,
    },
    /// Show a run's phase, status, and open conflicts
    Status {
        run_id: String,

        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Execute a single phase in isolation (debugging aid)
    Step {
        run_id: String,
        /// analysis | design | finalization | implementation
        phase: String,
    },
    /// List all runs
    List,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "conductor=debug" } else { "conductor=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = cli
        .project_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("."));
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default(&project_dir)?,
    };
    config = config.with_verbose(cli.verbose);
    // The data dir is relative to the project dir unless absolute.
    if config.data_dir.is_relative() {
        config.data_dir = project_dir.join(&config.data_dir);
    }

    match cli.command {
        Commands::Start { feature, no_drive } => cmd::start(config, &feature, no_drive).await,
        Commands::Resume { run_id } => cmd::resume(config, &run_id).await,
        Commands::Status { run_id, json } => cmd::status(config, &run_id, json),
        Commands::Step { run_id, phase } => cmd::step(config, &run_id, &phase).await,
        Commands::List => cmd::list(config),
    }
}
