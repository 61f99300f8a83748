//! Stevedore command line.
//!
//! - `stevedore` / `stevedore supervise` - bind the port and run one server
//!   instance per core, restarting any that die
//! - `stevedore serve` - run a single instance (API plus worker pool)

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use stevedore::config::{AppConfig, CONFIG_PATH_VAR, ConfigError};
use stevedore::log::LogError;
use stevedore::server::ServerError;
use stevedore::supervisor::{
    ProcessConfig, Supervisor, SupervisorConfig, SupervisorError, bind_inheritable,
    shutdown_signal,
};
use thiserror::Error;
use tracing::{error, info};

/// Multi-core job queue server
#[derive(Parser)]
#[command(name = "stevedore")]
#[command(author = "Pegasus Heavy Industries LLC")]
#[command(version)]
#[command(about = "Multi-core job queue server with retries and a dead-letter queue")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file (.toml or .json)
    #[arg(short, long, global = true, env = CONFIG_PATH_VAR)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one instance per core and restart any that die (default)
    Supervise(SuperviseArgs),

    /// Run a single instance
    Serve,
}

#[derive(Args, Default)]
struct SuperviseArgs {
    /// Number of instances (defaults to supervisor.workers, then the core count)
    #[arg(short, long)]
    workers: Option<usize>,
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "stevedore failed");
            eprintln!("stevedore: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = AppConfig::load(cli.config.as_deref())?;
    let _guard = config.log_config().try_init()?;

    match cli.command.unwrap_or(Commands::Supervise(SuperviseArgs::default())) {
        Commands::Serve => {
            stevedore::server::serve(&config).await?;
        }
        Commands::Supervise(args) => {
            supervise(&config, cli.config, args.workers).await?;
        }
    }
    Ok(())
}

async fn supervise(
    config: &AppConfig,
    config_path: Option<PathBuf>,
    workers: Option<usize>,
) -> Result<(), CliError> {
    let workers = workers.unwrap_or_else(|| config.worker_count());
    let listener = bind_inheritable(config.server.address())?;
    info!(address = %config.server.address(), workers, "Listening");

    let mut command = ProcessConfig::current_exe(["serve"])?;
    if let Some(path) = config_path {
        command = command.arg("--config").arg(path.display().to_string());
    }

    let settings = &config.supervisor;
    let supervisor = Supervisor::new(
        SupervisorConfig::new(workers, command)
            .with_restart_delay(Duration::from_millis(settings.restart_delay_ms))
            .with_shutdown_timeout(Duration::from_millis(settings.shutdown_timeout_ms)),
    )
    .with_listener(listener);

    let handle = supervisor.handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        handle.shutdown();
    });

    let report = supervisor.run().await?;
    info!(
        spawned = report.spawned,
        restarts = report.restarts,
        "Supervisor stopped"
    );
    Ok(())
}
