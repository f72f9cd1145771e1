use std::sync::Arc;

use async_trait::async_trait;

use crate::cluster::NodeId;
use crate::error::Result;
use crate::signal::Signal;

/// Receives signals broadcast by other nodes.
#[async_trait]
pub trait SignalListener: Send + Sync {
    async fn on_signal(&self, signal: Signal);
}

#[async_trait]
impl<F> SignalListener for F
where
    F: Fn(Signal) + Send + Sync,
{
    async fn on_signal(&self, signal: Signal) {
        self(signal)
    }
}

/// Cluster-wide broadcast of [`Signal`]s.
#[async_trait]
pub trait SignalWatcher: Send + Sync {
    async fn start(&self, node_id: NodeId, listener: Arc<dyn SignalListener>) -> Result<()>;

    /// Broadcast to every other node. The sender is not notified.
    async fn send_signal(&self, signal: Signal) -> Result<()>;

    async fn shutdown(&self);
}
