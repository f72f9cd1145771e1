use std::sync::Arc;

use async_trait::async_trait;

use super::transactions::TransactionManager;
use crate::cluster::NodeId;
use crate::error::Result;
use crate::transaction::Transaction;

/// Re-applies a transaction that may not have completed.
#[async_trait]
pub trait ReplayHandler: Send + Sync {
    async fn replay(&self, txn: &Transaction) -> Result<()>;
}

#[async_trait]
impl<F> ReplayHandler for F
where
    F: Fn(&Transaction) -> Result<()> + Send + Sync,
{
    async fn replay(&self, txn: &Transaction) -> Result<()> {
        self(txn)
    }
}

/// Durable, at-least-once queue of transactions awaiting replay.
#[async_trait]
pub trait TransactionReprocessingQueue: Send + Sync {
    async fn insert(&self, txn: &Transaction, node_id: NodeId) -> Result<()>;

    async fn start(
        &self,
        handler: Arc<dyn ReplayHandler>,
        transactions: Arc<dyn TransactionManager>,
    ) -> Result<()>;

    async fn shutdown(&self);
}
