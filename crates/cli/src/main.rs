//! Fleetping CLI
//!
//! Provisions and inspects the device registry shared with the liveness
//! agent. Edits made here reach a running agent through its
//! reconciliation pass.

mod commands;
mod config;
mod output;

use std::path::PathBuf;

use agent_lib::{registry::SqliteRegistry, DEFAULT_INTERVAL_SECS};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::{devices, import};

/// Fleetping device registry CLI
#[derive(Parser)]
#[command(name = "fpctl")]
#[command(author, version, about = "CLI for the Fleetping device registry", long_about = None)]
pub struct Cli {
    /// Registry database (can also be set via FLEETPING_DATABASE_PATH env var)
    #[arg(long, env = "FLEETPING_DATABASE_PATH")]
    pub database: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register every device of a CSV device list
    Import {
        /// Device list CSV (name in column 0, identifier in column 2)
        csv: PathBuf,

        /// Zero-based column holding the device address
        #[arg(long, default_value_t = 4)]
        address_column: usize,

        /// Probe interval in seconds for imported devices
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Show CSV devices that are not registered yet
    Missing {
        /// Device list CSV
        csv: PathBuf,

        /// Where to write the unregistered devices as JSON
        #[arg(long, short, default_value = "data.json")]
        output: PathBuf,

        /// Zero-based column holding the device address
        #[arg(long, default_value_t = 4)]
        address_column: usize,
    },

    /// List registered devices
    List {
        /// Only devices probed at this interval (seconds)
        #[arg(long, short)]
        interval: Option<u64>,
    },

    /// Change how often a device is probed
    SetInterval {
        /// Device name
        name: String,

        /// New probe interval in seconds
        seconds: u64,
    },

    /// Remove a device from the registry
    Delete {
        /// Device name
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = config::Config::load()?;
    let database = config.database(cli.database);
    let default_interval = config
        .default_interval_secs
        .unwrap_or(DEFAULT_INTERVAL_SECS);

    let registry = SqliteRegistry::open(&database)
        .await
        .with_context(|| format!("Failed to open registry {}", database.display()))?;

    // Execute command
    match cli.command {
        Commands::Import {
            csv,
            address_column,
            interval,
        } => {
            let interval = interval.unwrap_or(default_interval);
            import::import_devices(&registry, &csv, address_column, interval, cli.format).await?;
        }
        Commands::Missing {
            csv,
            output,
            address_column,
        } => {
            import::missing_devices(
                &registry,
                &csv,
                address_column,
                default_interval,
                &output,
                cli.format,
            )
            .await?;
        }
        Commands::List { interval } => {
            devices::list_devices(&registry, interval, cli.format).await?;
        }
        Commands::SetInterval { name, seconds } => {
            devices::set_interval(&registry, &name, seconds, cli.format).await?;
        }
        Commands::Delete { name } => {
            devices::delete_device(&registry, &name, cli.format).await?;
        }
    }

    Ok(())
}
