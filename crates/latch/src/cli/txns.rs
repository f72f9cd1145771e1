use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use console::style;

use latch::latch_core::clock::SystemClock;
use latch::latch_core::cluster::NodeId;
use latch::latch_core::config::LatchConfig;
use latch::latch_core::coordination::TransactionManager;
use latch::latch_runtime::transactions::StoreTransactionManager;
use latch::{local_hostname, Backends};

/// List nodes with open transactions, or one node's open transactions.
#[derive(Parser)]
pub struct TxnsCommand {
    /// Show the open transactions of this node.
    #[arg(long)]
    pub node: Option<u16>,
}

impl TxnsCommand {
    pub async fn execute(self, config: LatchConfig) -> Result<()> {
        let clock = Arc::new(SystemClock);
        let backends = Backends::connect(&config, clock.clone(), &local_hostname(), false).await?;
        let manager = StoreTransactionManager::new(backends.store.clone(), clock);
        let result = self.print(&manager).await;
        backends.close().await;
        result
    }

    async fn print(&self, manager: &dyn TransactionManager) -> Result<()> {
        println!();
        match self.node {
            None => {
                let nodes = manager.get_node_ids_with_open_transactions().await?;
                if nodes.is_empty() {
                    println!("  {} no open transactions", style("-").dim());
                }
                for node in nodes {
                    let open = manager.iterate_transactions(node).await?.len();
                    println!("  {} node {} ({} open)", style("*").cyan(), node, open);
                }
            }
            Some(id) => {
                let node = NodeId::new(id)?;
                let txns = manager.iterate_transactions(node).await?;
                if txns.is_empty() {
                    println!("  {} node {} has no open transactions", style("-").dim(), node);
                }
                for (txn_id, txn) in txns {
                    println!(
                        "  {} {} {} {}",
                        style(txn_id).cyan(),
                        txn.op.as_str(),
                        txn.object_id,
                        style(txn.timestamp).dim()
                    );
                }
            }
        }
        println!();
        Ok(())
    }
}
