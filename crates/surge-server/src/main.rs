//! # Surge Server
//!
//! Real-time fan-out hub: payloads pushed to the ingestion endpoint are
//! broadcast to every client of the broadcast endpoint.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! surge
//!
//! # Run with custom config
//! surge --config /path/to/surge.toml
//!
//! # Run with environment variables
//! SURGE_OUTPUT__ADDRESS=0.0.0.0:5000 surge
//!
//! # Show the effective configuration
//! surge --print-config
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Surge fan-out server.
#[derive(Parser, Debug)]
#[command(name = "surge", version, about = "Real-time fan-out hub")]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = config::Config::load(cli.config.as_deref())?;

    if cli.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "surge=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(
        "Starting Surge server, output on {}, input on {}",
        config.output.address,
        if config.input.enabled {
            config.input.address.as_str()
        } else {
            "(disabled)"
        }
    );

    handlers::run_server(config).await?;

    Ok(())
}
