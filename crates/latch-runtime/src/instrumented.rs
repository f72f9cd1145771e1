//! Decorators that log the duration and failures of coordination calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use latch_core::cluster::NodeId;
use latch_core::coordination::{NameLocker, TransactionManager};
use latch_core::error::Result;
use latch_core::transaction::{Transaction, TxnId};

async fn timed<T>(operation: &'static str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    let start = Instant::now();
    let result = fut.await;
    let elapsed_ms = start.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => tracing::debug!(operation, elapsed_ms, "Coordination call finished"),
        Err(e) => tracing::warn!(operation, elapsed_ms, error = %e, "Coordination call failed"),
    }
    result
}

async fn timed_infallible<T>(operation: &'static str, fut: impl Future<Output = T>) -> T {
    let start = Instant::now();
    let value = fut.await;
    tracing::debug!(
        operation,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Coordination call finished"
    );
    value
}

pub struct InstrumentedNameLocker {
    delegate: Arc<dyn NameLocker>,
}

impl InstrumentedNameLocker {
    pub fn new(delegate: Arc<dyn NameLocker>) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl NameLocker for InstrumentedNameLocker {
    async fn lock(&self, name: &str) -> Result<()> {
        timed("lock", self.delegate.lock(name)).await
    }

    async fn release(&self, name: &str) {
        timed_infallible("release", self.delegate.release(name)).await
    }

    fn is_locked(&self, name: &str) -> bool {
        self.delegate.is_locked(name)
    }

    async fn lock_in_order(&self, names: &[String]) -> Result<()> {
        timed("lock_in_order", self.delegate.lock_in_order(names)).await
    }

    async fn release_all(&self, names: &[String]) {
        timed_infallible("release_all", self.delegate.release_all(names)).await
    }
}

/// Only opening and closing are timed; the rest pass straight through.
pub struct InstrumentedTransactionManager {
    delegate: Arc<dyn TransactionManager>,
}

impl InstrumentedTransactionManager {
    pub fn new(delegate: Arc<dyn TransactionManager>) -> Self {
        Self { delegate }
    }
}

#[async_trait]
impl TransactionManager for InstrumentedTransactionManager {
    async fn start(&self, node_id: NodeId) -> Result<()> {
        self.delegate.start(node_id).await
    }

    fn get_and_increment_next_transaction_id(&self) -> Result<TxnId> {
        self.delegate.get_and_increment_next_transaction_id()
    }

    async fn open_transaction(
        &self,
        txn_id: TxnId,
        node_id: NodeId,
        txn: &Transaction,
    ) -> Result<()> {
        timed(
            "open_transaction",
            self.delegate.open_transaction(txn_id, node_id, txn),
        )
        .await
    }

    async fn close_transaction(&self, txn_id: TxnId, node_id: NodeId) -> Result<()> {
        timed(
            "close_transaction",
            self.delegate.close_transaction(txn_id, node_id),
        )
        .await
    }

    async fn get_node_ids_with_open_transactions(&self) -> Result<Vec<NodeId>> {
        self.delegate.get_node_ids_with_open_transactions().await
    }

    async fn iterate_transactions(&self, node_id: NodeId) -> Result<Vec<(TxnId, Transaction)>> {
        self.delegate.iterate_transactions(node_id).await
    }

    async fn cleanup(&self, node_id: NodeId) -> Result<()> {
        self.delegate.cleanup(node_id).await
    }

    async fn is_reindex_in_process(&self) -> Result<bool> {
        self.delegate.is_reindex_in_process().await
    }

    async fn set_reindex_in_process(&self, in_process: bool) -> Result<()> {
        self.delegate.set_reindex_in_process(in_process).await
    }

    async fn shutdown(&self) {
        self.delegate.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryCluster;
    use crate::lock::StripedNameLocker;
    use crate::transactions::StoreTransactionManager;
    use latch_core::testing::{ManualClock, RecordingAlerter};
    use latch_core::transaction::TxnOp;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_name_locker_passes_through() {
        let cluster = MemoryCluster::new();
        let inner = StripedNameLocker::new(
            Arc::new(cluster.connect()),
            "locks/objects",
            Arc::new(RecordingAlerter::new()),
            CancellationToken::new(),
        );
        let locker = InstrumentedNameLocker::new(Arc::new(inner));

        locker.lock("obj").await.unwrap();
        assert!(locker.is_locked("obj"));
        locker.release("obj").await;
        locker
            .lock_in_order(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        locker.release_all(&["a".to_string(), "b".to_string()]).await;
    }

    #[tokio::test]
    async fn test_transaction_manager_preserves_errors() {
        let cluster = MemoryCluster::new();
        let inner = StoreTransactionManager::new(
            Arc::new(cluster.connect()),
            Arc::new(ManualClock::new(1_000)),
        );
        let manager = InstrumentedTransactionManager::new(Arc::new(inner));
        assert!(manager.get_and_increment_next_transaction_id().is_err());

        let node = NodeId::new(2).unwrap();
        manager.start(node).await.unwrap();
        let id = manager.get_and_increment_next_transaction_id().unwrap();
        let txn = Transaction::new(id, 1_000, "obj", TxnOp::Update);
        manager.open_transaction(id, node, &txn).await.unwrap();

        let other = Transaction::new(id, 1_000, "other", TxnOp::Delete);
        assert!(manager.open_transaction(id, node, &other).await.is_err());

        manager.close_transaction(id, node).await.unwrap();
        assert!(manager.iterate_transactions(node).await.unwrap().is_empty());
    }
}
