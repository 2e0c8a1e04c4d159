//! tlsfront - serve a local backend process over TLS
//!
//! Starts the backend, terminates TLS on the public listener and relays each
//! connection to the backend on localhost until the backend exits.

mod backend;
mod config;
mod lifecycle;

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{load_config_file, Args, ConfigFile, Settings};

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))
        .context("Failed to initialize logging filter")?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args.log_level)?;

    let file = match &args.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };
    let settings = Settings::resolve(args, file).context("Invalid configuration")?;

    let status = lifecycle::run(settings).await?;
    Ok(ExitCode::from(lifecycle::exit_code(&status)))
}
