use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use console::style;
use tracing::info;

use latch::latch_core::config::LatchConfig;
use latch::latch_core::coordination::ReplayHandler;
use latch::latch_core::error::Result as LatchResult;
use latch::latch_core::signal::Signal;
use latch::latch_core::transaction::Transaction;
use latch::{SyncCallbacks, SyncContext};

/// Start a node and run until Ctrl-C.
#[derive(Parser)]
pub struct RunCommand {
    /// Node id (overrides config).
    #[arg(long)]
    pub node: Option<u16>,

    /// Never take part in leader election.
    #[arg(long)]
    pub no_leader: bool,
}

impl RunCommand {
    pub async fn execute(self, mut config: LatchConfig) -> Result<()> {
        if let Some(id) = self.node {
            config.node.id = Some(id);
        }
        if self.no_leader {
            config.node.can_be_leader = false;
        }

        println!();
        println!(
            "  {} v{}",
            style("latch").bold().cyan(),
            env!("CARGO_PKG_VERSION")
        );
        println!();

        let ctx = Arc::new(SyncContext::builder(config).build().await?);

        let watcher = ctx.clone();
        let membership = Arc::new(move || {
            let ctx = watcher.clone();
            tokio::spawn(async move {
                match ctx.cluster_info().await {
                    Ok(info) => info!(
                        members = ?info.members,
                        leader = ?info.leader,
                        state = %ctx.leadership_state(),
                        "Group membership changed"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Failed to read cluster state"),
                }
            });
        });
        let signals = Arc::new(|signal: Signal| {
            info!(signal = %signal, "Signal received");
        });
        let replay: Arc<dyn ReplayHandler> = Arc::new(|txn: &Transaction| -> LatchResult<()> {
            info!(
                txn_id = %txn.txn_id,
                object_id = %txn.object_id,
                op = txn.op.as_str(),
                "Replaying transaction"
            );
            Ok(())
        });

        let mut callbacks = SyncCallbacks::new()
            .with_membership(membership)
            .with_signals(signals);
        if ctx.reprocessing().is_some() {
            callbacks = callbacks.with_replay(replay);
        }

        if let Err(e) = ctx.start(callbacks).await {
            ctx.shutdown().await;
            return Err(e.into());
        }

        let info = ctx.cluster_info().await?;
        println!(
            "  {} node {} in '{}'",
            style("joined").green(),
            style(info.node_id).bold(),
            info.namespace
        );
        println!(
            "  {} {}",
            style("leader").dim(),
            if info.is_leader() {
                style("this node".to_string()).green()
            } else {
                style(
                    info.leader
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "none".to_string()),
                )
                .yellow()
            }
        );
        println!();

        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");
        ctx.shutdown().await;

        println!("\n  {}", style("stopped").dim());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_command_overrides() {
        let cmd = RunCommand {
            node: Some(5),
            no_leader: true,
        };
        assert_eq!(cmd.node, Some(5));
        assert!(cmd.no_leader);
    }
}
