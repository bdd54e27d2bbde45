use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use autodev::api::Orchestrator;
use autodev::config::OrchestratorConfig;

#[derive(Parser)]
#[command(name = "autodev")]
#[command(about = "Drive a persisted feature backlog through AI coding-agent runs")]
#[command(version)]
struct Cli {
    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Echo agent output records while running
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all work items
    List,
    /// Show backlog counts by status
    Status,
    /// Run agent sessions until the backlog drains
    Run {
        /// Maximum concurrent agent runs
        #[arg(long, default_value_t = 1)]
        parallel: usize,
        /// Override the idle watchdog window in milliseconds
        #[arg(long)]
        idle_timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("autodev=debug")
        } else {
            EnvFilter::new("autodev=info")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let project_dir = match cli.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let mut config = OrchestratorConfig::new(project_dir)?;
    config.verbose = cli.verbose;

    match cli.command {
        Commands::List => {
            let orchestrator = Orchestrator::new(config)?;
            autodev::cmd::list(&orchestrator).await
        }
        Commands::Status => {
            let orchestrator = Orchestrator::new(config)?;
            autodev::cmd::status(&orchestrator).await
        }
        Commands::Run {
            parallel,
            idle_timeout_ms,
        } => {
            if let Some(ms) = idle_timeout_ms {
                config.idle_timeout = Duration::from_millis(ms);
            }
            let orchestrator = Orchestrator::new(config)?;
            autodev::cmd::run(&orchestrator, parallel).await
        }
    }
}
