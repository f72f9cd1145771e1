use anyhow::Result;
use clap::Parser;
use console::style;

use latch::latch_core::config::{LatchConfig, StoreBackend};
use latch::latch_runtime::backend::postgres::{Database, MigrationRunner};

/// Install the PostgreSQL schema.
#[derive(Parser)]
pub struct MigrateCommand {}

impl MigrateCommand {
    pub async fn execute(self, config: LatchConfig) -> Result<()> {
        if config.cluster.backend != StoreBackend::Postgres {
            println!(
                "  {} the memory backend has no schema",
                style("-").dim()
            );
            return Ok(());
        }

        let db = Database::from_config(&config.cluster).await?;
        let applied = MigrationRunner::new(db.pool().clone()).run().await;
        db.close().await;
        let applied = applied?;

        println!();
        if applied.is_empty() {
            println!("  {} schema is up to date", style("-").dim());
        }
        for name in &applied {
            println!("  {} {}", style("applied").green(), name);
        }
        println!();
        Ok(())
    }
}
