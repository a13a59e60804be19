//! Relay CLI - run generation requests against a model configuration

mod cli;
mod commands;
mod error;
mod output;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

pub use error::CliError;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG overrides the verbosity flag
    let default_filter = if cli.verbose {
        "relay_foundation=debug,relay_cli=debug"
    } else {
        "relay_foundation=warn,relay_cli=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_command_async(cli))
}

async fn run_command_async(cli: Cli) -> anyhow::Result<()> {
    let format = cli.output;
    let config = cli.config;

    match cli.command {
        Commands::Run(args) => {
            commands::run::run(&config, args, format).await?;
        }
        Commands::Models { preload } => {
            commands::models::run(&config, preload, format).await?;
        }
        Commands::Health { preload } => {
            commands::health::run(&config, preload, format).await?;
        }
        Commands::Validate => {
            commands::validate::run(&config, format)?;
        }
    }

    Ok(())
}
