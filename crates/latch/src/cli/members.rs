use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use console::style;

use latch::latch_core::clock::SystemClock;
use latch::latch_core::cluster::NodeId;
use latch::latch_core::config::LatchConfig;
use latch::latch_core::store::CoordinationStore;
use latch::latch_runtime::cluster::{current_leader, MEMBERS_KEY};
use latch::{local_hostname, Backends};

/// Show group members and the current leader.
#[derive(Parser)]
pub struct MembersCommand {}

impl MembersCommand {
    pub async fn execute(self, config: LatchConfig) -> Result<()> {
        let backends = Backends::connect(&config, Arc::new(SystemClock), &local_hostname(), false).await?;
        let result = print_members(backends.store.as_ref()).await;
        backends.close().await;
        result
    }
}

async fn print_members(store: &dyn CoordinationStore) -> Result<()> {
    let members = member_ids(store).await?;
    let leader = current_leader(store).await?;

    println!();
    if members.is_empty() {
        println!("  {} no members", style("-").dim());
    }
    for id in &members {
        let marker = if Some(*id) == leader {
            style("leader").green().to_string()
        } else {
            String::new()
        };
        println!("  {} {} {}", style("*").cyan(), id, marker);
    }
    println!();
    match leader {
        Some(id) => println!("  {} node {}", style("leader present:").green(), id),
        None => println!("  {}", style("no leader").yellow()),
    }
    println!();
    Ok(())
}

async fn member_ids(store: &dyn CoordinationStore) -> Result<Vec<NodeId>> {
    let mut ids: Vec<NodeId> = store
        .children(MEMBERS_KEY)
        .await?
        .iter()
        .filter_map(|c| NodeId::from_str(c))
        .collect();
    ids.sort();
    Ok(ids)
}
