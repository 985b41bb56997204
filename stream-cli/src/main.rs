//! # fedistream
//!
//! Command-line watcher for fedistream event streams.
//!
//! ## Commands
//!
//! - `watch`: Connect to a stream and log cache activity until Ctrl-C
//! - `check-config`: Validate a configuration file
//!
//! ## Example
//!
//! ```bash
//! # Validate a config file
//! fedistream check-config --config fedistream.toml
//!
//! # Follow the home timeline with an access token
//! fedistream watch --config fedistream.toml --token "$TOKEN"
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod config;

use commands::{check, watch};
use config::Overrides;

/// Command-line watcher for fedistream event streams.
#[derive(Parser, Debug)]
#[command(name = "fedistream")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory for the last-event-id store
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Connect to a stream and log activity until Ctrl-C
    Watch {
        /// TOML configuration file
        #[arg(long, short)]
        config: PathBuf,

        /// Stream URL (overrides transport.url)
        #[arg(long)]
        url: Option<String>,

        /// Bearer token sent in the Authorization header
        #[arg(long)]
        token: Option<String>,
    },

    /// Validate a configuration file and print the effective values
    CheckConfig {
        /// TOML configuration file
        #[arg(long, short)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Watch { config, url, token } => {
            let config = config::load(&config, Overrides { url, token })?;

            let data_dir = match cli.data_dir {
                Some(dir) => dir,
                None => config::default_data_dir()?,
            };
            tokio::fs::create_dir_all(&data_dir)
                .await
                .context("Failed to create data directory")?;

            watch::run(config, &data_dir).await?;
        }
        Commands::CheckConfig { config } => {
            check::run(&config)?;
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
