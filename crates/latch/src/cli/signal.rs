use anyhow::Result;
use clap::Parser;
use console::style;

use latch::latch_core::config::LatchConfig;
use latch::latch_core::signal::Signal;
use latch::{SyncCallbacks, SyncContext};

/// Broadcast a signal once.
#[derive(Parser)]
pub struct SignalCommand {
    /// DESIGN, AUTH_CHANGE or JAVASCRIPT_CLEAR_CACHE.
    #[arg(value_parser = parse_signal)]
    pub signal: Signal,
}

fn parse_signal(s: &str) -> std::result::Result<Signal, String> {
    Signal::from_str(s).ok_or_else(|| {
        let known: Vec<&str> = Signal::ALL.iter().map(|s| s.as_str()).collect();
        format!("unknown signal '{}', expected one of {}", s, known.join(", "))
    })
}

impl SignalCommand {
    pub async fn execute(self, mut config: LatchConfig) -> Result<()> {
        // A transient sender never competes for leadership or replays.
        config.node.id = None;
        config.node.can_be_leader = false;
        if let Some(reprocessing) = config.reprocessing.as_mut() {
            reprocessing.enabled = false;
        }

        let ctx = SyncContext::builder(config).build().await?;
        let result = async {
            ctx.start(SyncCallbacks::new()).await?;
            ctx.signals().send_signal(self.signal).await
        }
        .await;
        ctx.shutdown().await;
        result?;

        println!("  {} {}", style("sent").green(), self.signal);
        Ok(())
    }
}
