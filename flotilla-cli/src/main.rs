use anyhow::{Context, Result};
use clap::Parser;
use flotilla_config::{ConfigLoader, FlotillaConfig};
use flotilla_logging::{init_simple_tracing, init_worker_tracing};
use std::path::PathBuf;
use tracing::{info, warn};

mod cli;
mod commands;
use cli::{Cli, Commands, ConfigCommands};
use commands::worker::WorkerArgs;

/// Load configuration from file or use defaults
fn load_config(config_path: Option<&PathBuf>) -> Result<FlotillaConfig> {
    let loader = ConfigLoader::new();

    match config_path {
        Some(path) => {
            if path.exists() {
                info!("Loading configuration from: {:?}", path);
                loader
                    .from_file(path)
                    .context(format!("Failed to load configuration from {:?}", path))
            } else {
                warn!("Configuration file not found: {:?}. Using defaults.", path);
                loader
                    .from_env()
                    .context("Failed to load configuration from environment")
            }
        }
        None => loader
            .from_env()
            .context("Failed to load configuration from environment"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_level = cli.log_level.as_deref();

    match &cli.command {
        // Launched jobs log to stderr; the launcher captures it per process
        Some(Commands::RunJob { job }) => {
            init_worker_tracing(log_level)?;
            commands::worker::run_job_command(job).await
        }
        Some(Commands::Worker {
            pool,
            idle_timeout,
            bind_address,
            advertise_host,
        }) => {
            init_worker_tracing(log_level)?;
            let config = load_config(cli.config.as_ref())?;
            let args = WorkerArgs {
                pool: pool.clone(),
                idle_timeout: *idle_timeout,
                bind_address: bind_address.clone(),
                advertise_host: advertise_host.clone(),
            };
            commands::worker::worker_command(config, args).await
        }
        Some(Commands::Run(args)) => {
            // Logging starts once the output directory exists
            let config = load_config(cli.config.as_ref())?;
            commands::run::run_command(config, args, log_level).await
        }
        Some(Commands::Query(args)) => {
            init_simple_tracing(log_level.unwrap_or("warn"))?;
            commands::query::query_command(args).await
        }
        Some(Commands::Config { config_cmd }) => {
            init_simple_tracing(log_level.unwrap_or("warn"))?;
            match config_cmd {
                ConfigCommands::Validate { config_file } => {
                    commands::config::handle_config_validate(config_file)
                }
                ConfigCommands::Generate { output, force } => {
                    commands::config::handle_config_generate(output.as_deref(), *force)
                }
            }
        }
        None => {
            // If no subcommand is provided, print help
            use clap::CommandFactory;
            let mut cmd = Cli::command();
            cmd.print_help().context("Failed to print help")?;
            println!();
            Ok(())
        }
    }
}
