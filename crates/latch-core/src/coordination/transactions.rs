use async_trait::async_trait;

use crate::cluster::NodeId;
use crate::error::Result;
use crate::transaction::{Transaction, TxnId};

/// Crash-recoverable bookkeeping of in-flight writes, per node.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn start(&self, node_id: NodeId) -> Result<()>;

    /// Mint the next id locally, without a store round-trip.
    fn get_and_increment_next_transaction_id(&self) -> Result<TxnId>;

    /// Record `txn` as open. Idempotent for an identical payload; a
    /// different payload under the same key is a `ProtocolViolation`.
    async fn open_transaction(&self, txn_id: TxnId, node_id: NodeId, txn: &Transaction)
        -> Result<()>;

    /// Remove the record. Absent records are logged, not errors.
    async fn close_transaction(&self, txn_id: TxnId, node_id: NodeId) -> Result<()>;

    async fn get_node_ids_with_open_transactions(&self) -> Result<Vec<NodeId>>;

    /// Open transactions of `node_id` in id order, read after a sync.
    async fn iterate_transactions(&self, node_id: NodeId) -> Result<Vec<(TxnId, Transaction)>>;

    /// Remove bookkeeping for a node whose transactions were all closed.
    async fn cleanup(&self, node_id: NodeId) -> Result<()>;

    async fn is_reindex_in_process(&self) -> Result<bool>;

    async fn set_reindex_in_process(&self, in_process: bool) -> Result<()>;

    async fn shutdown(&self);
}
