//! Corral - shared service and cache lifecycle for container builds
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use corral::cli::{Cli, Commands};
use corral::config::ConfigManager;
use corral::error::CorralResult;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> CorralResult<()> {
    let cli = Cli::parse();

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = config_manager.load().await?;

    // 0 = warn (spinners only), 1 = info, 2+ = debug
    let filter = match cli.verbose {
        0 => EnvFilter::new("corral=warn"),
        1 => EnvFilter::new("corral=info"),
        _ => EnvFilter::new("corral=debug"),
    };

    if config.general.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .without_time()
            .init();
    }

    match cli.command {
        Commands::Digest(args) => corral::cli::commands::digest(args).await,
        Commands::Up(args) => corral::cli::commands::up(args, &config).await,
        Commands::Run(args) => corral::cli::commands::run(args, &config).await,
        Commands::Status => corral::cli::commands::status(&config, &config_manager).await,
        Commands::Config(args) => {
            corral::cli::commands::config(args, &config, &config_manager).await
        }
    }
}
