use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod config;
mod telemetry;

use config::{Config, ConfigError};

#[derive(Parser)]
#[command(version, about = "Resilient supergraph delivery with a fallback store")]
struct Cli {
    #[arg(long, short, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Fetch the supergraph from uplink, falling back to the stored copy, and
    /// keep polling.
    Provider,
    /// Run the webhook writer and fallback responders.
    Store,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("missing `{0}` section in config")]
    MissingSection(&'static str),
    #[error(transparent)]
    Telemetry(#[from] telemetry::TelemetryError),
    #[error("could not start runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error(transparent)]
    Provider(#[from] supergraph_provider::RunError),
    #[error(transparent)]
    Store(#[from] fallback_store::FallbackStoreError),
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "exiting");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = Config::from_file(&cli.config)?;
    config.apply_env(|name| std::env::var(name).ok())?;

    let _guard = telemetry::init(&config.common)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    match cli.command {
        CliCommand::Provider => {
            let provider = config.provider.ok_or(CliError::MissingSection("provider"))?;
            runtime.block_on(supergraph_provider::run(provider))?;
        }
        CliCommand::Store => {
            let store = config.store.ok_or(CliError::MissingSection("store"))?;
            runtime.block_on(fallback_store::run(store))?;
        }
    }

    Ok(())
}
