mod members;
mod migrate;
mod run;
mod signal;
mod txns;

pub use members::MembersCommand;
pub use migrate::MigrateCommand;
pub use run::RunCommand;
pub use signal::SignalCommand;
pub use txns::TxnsCommand;

use std::path::Path;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use latch::latch_core::config::{LatchConfig, LoggingConfig};

/// latch - distributed coordination for storage clusters
#[derive(Parser)]
#[command(name = "latch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, default_value = "latch.toml", global = true)]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Start a node and run until interrupted.
    Run(RunCommand),

    /// Show group members and the current leader.
    Members(MembersCommand),

    /// Show open transactions.
    Txns(TxnsCommand),

    /// Broadcast a signal to every node.
    Signal(SignalCommand),

    /// Install the PostgreSQL schema.
    Migrate(MigrateCommand),
}

impl Cli {
    /// Execute the CLI command.
    pub async fn execute(self) -> Result<()> {
        let config = load_config(&self.config)?;
        init_tracing(&config.observability.logging);

        match self.command {
            Commands::Run(cmd) => cmd.execute(config).await,
            Commands::Members(cmd) => cmd.execute(config).await,
            Commands::Txns(cmd) => cmd.execute(config).await,
            Commands::Signal(cmd) => cmd.execute(config).await,
            Commands::Migrate(cmd) => cmd.execute(config).await,
        }
    }
}

fn load_config(path: &str) -> Result<LatchConfig> {
    if !Path::new(path).exists() {
        anyhow::bail!("Configuration file not found: {}", path);
    }
    Ok(LatchConfig::from_file(path)?)
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.filter_directive()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}
