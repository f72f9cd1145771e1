use std::sync::atomic::{AtomicI64, AtomicU16, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use latch_core::clock::Clock;
use latch_core::cluster::NodeId;
use latch_core::coordination::TransactionManager;
use latch_core::error::{LatchError, Result};
use latch_core::store::{key_join, CoordinationStore};
use latch_core::transaction::{Transaction, TxnId};

use crate::counter::DistributedCounter;

pub const OPEN_TXNS_KEY: &str = "txns/open";
pub const REINDEX_KEY: &str = "txns/reindexInProgress";

const UNSET: u16 = u16::MAX;

fn txn_key(node_id: NodeId, txn_id: TxnId) -> String {
    key_join(&[OPEN_TXNS_KEY, &node_id.to_string(), &txn_id.to_string()])
}

/// Mints ids from a logical clock of `millis * 1000 + suffix` that never
/// moves backwards. Bursts beyond 1000 ids per millisecond borrow from the
/// next millisecond instead of wrapping.
struct IdMinter {
    last_tick: AtomicI64,
}

impl IdMinter {
    fn new() -> Self {
        Self {
            last_tick: AtomicI64::new(0),
        }
    }

    fn next(&self, now_millis: i64, node_id: NodeId) -> TxnId {
        let floor = now_millis * TxnId::SUFFIX_SPACE;
        let previous = self
            .last_tick
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(floor.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        let tick = floor.max(previous + 1);
        TxnId::compose(
            tick / TxnId::SUFFIX_SPACE,
            node_id,
            (tick % TxnId::SUFFIX_SPACE) as u16,
        )
    }
}

/// [`TransactionManager`] keeping one record per open transaction under
/// `txns/open/<node>/<txnId>`.
pub struct StoreTransactionManager {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    node_id: AtomicU16,
    minter: IdMinter,
    reindex: DistributedCounter,
}

impl StoreTransactionManager {
    pub fn new(store: Arc<dyn CoordinationStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            reindex: DistributedCounter::new(store.clone(), REINDEX_KEY),
            store,
            clock,
            node_id: AtomicU16::new(UNSET),
            minter: IdMinter::new(),
        }
    }

    fn node_id(&self) -> Result<NodeId> {
        match self.node_id.load(Ordering::SeqCst) {
            UNSET => Err(LatchError::InvalidState(
                "transaction manager not started".to_string(),
            )),
            id => NodeId::new(id),
        }
    }
}

#[async_trait]
impl TransactionManager for StoreTransactionManager {
    async fn start(&self, node_id: NodeId) -> Result<()> {
        self.node_id.store(node_id.as_u16(), Ordering::SeqCst);
        tracing::debug!(node_id = %node_id, "Transaction manager started");
        Ok(())
    }

    fn get_and_increment_next_transaction_id(&self) -> Result<TxnId> {
        let node_id = self.node_id()?;
        Ok(self.minter.next(self.clock.now_millis(), node_id))
    }

    async fn open_transaction(
        &self,
        txn_id: TxnId,
        node_id: NodeId,
        txn: &Transaction,
    ) -> Result<()> {
        let key = txn_key(node_id, txn_id);
        let bytes = txn.to_bytes()?;
        match self.store.create(&key, &bytes).await {
            Ok(_) => Ok(()),
            Err(LatchError::AlreadyExists(_)) => {
                let existing = self.store.get(&key).await?;
                match existing {
                    Some(v) if v.value == bytes => {
                        tracing::warn!(txn_id = %txn_id, node_id = %node_id, "Transaction already open");
                        Ok(())
                    }
                    _ => Err(LatchError::ProtocolViolation(format!(
                        "transaction {} of node {} is already open with a different payload",
                        txn_id, node_id
                    ))),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn close_transaction(&self, txn_id: TxnId, node_id: NodeId) -> Result<()> {
        match self.store.delete(&txn_key(node_id, txn_id), None).await {
            Ok(()) => Ok(()),
            Err(LatchError::NotFound(_)) => {
                tracing::warn!(txn_id = %txn_id, node_id = %node_id, "Transaction already closed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn get_node_ids_with_open_transactions(&self) -> Result<Vec<NodeId>> {
        Ok(self
            .store
            .children(OPEN_TXNS_KEY)
            .await?
            .iter()
            .filter_map(|name| NodeId::from_str(name))
            .collect())
    }

    async fn iterate_transactions(&self, node_id: NodeId) -> Result<Vec<(TxnId, Transaction)>> {
        let prefix = key_join(&[OPEN_TXNS_KEY, &node_id.to_string()]);
        self.store.sync(&prefix).await?;

        let mut entries = Vec::new();
        for name in self.store.children(&prefix).await? {
            let Some(txn_id) = TxnId::from_str(&name) else {
                tracing::warn!(node_id = %node_id, entry = %name, "Skipping malformed transaction key");
                continue;
            };
            // Closed between listing and reading.
            let Some(value) = self.store.get(&txn_key(node_id, txn_id)).await? else {
                continue;
            };
            entries.push((txn_id, Transaction::from_bytes(&value.value)?));
        }
        entries.sort_by_key(|(id, _)| *id);
        Ok(entries)
    }

    async fn cleanup(&self, node_id: NodeId) -> Result<()> {
        let prefix = key_join(&[OPEN_TXNS_KEY, &node_id.to_string()]);
        if !self.store.children(&prefix).await?.is_empty() {
            tracing::warn!(node_id = %node_id, "Cleaning up txns, but not empty");
            return Ok(());
        }
        match self.store.delete(&prefix, None).await {
            Ok(()) | Err(LatchError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn is_reindex_in_process(&self) -> Result<bool> {
        self.store.sync(REINDEX_KEY).await?;
        Ok(self.reindex.get().await? > 0)
    }

    async fn set_reindex_in_process(&self, in_process: bool) -> Result<()> {
        self.reindex.force_set(i64::from(in_process)).await
    }

    async fn shutdown(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryCluster;
    use latch_core::testing::ManualClock;
    use latch_core::transaction::TxnOp;

    async fn started(cluster: &MemoryCluster, clock: Arc<ManualClock>, node: u16) -> StoreTransactionManager {
        let manager = StoreTransactionManager::new(Arc::new(cluster.connect()), clock);
        manager.start(NodeId::new(node).unwrap()).await.unwrap();
        manager
    }

    #[test]
    fn test_minter_is_strictly_increasing_within_a_millisecond() {
        let minter = IdMinter::new();
        let node = NodeId::new(7).unwrap();
        let mut last = minter.next(5, node);
        assert_eq!(last, TxnId::compose(5, node, 0));
        for _ in 0..2500 {
            let id = minter.next(5, node);
            assert!(id > last);
            assert_eq!(id.node_id(), Some(node));
            last = id;
        }
        // 2501 ids at t=5 spill into t=7.
        assert_eq!(last.millis(), 7);
    }

    #[test]
    fn test_minter_never_goes_backwards_with_clock() {
        let minter = IdMinter::new();
        let node = NodeId::new(1).unwrap();
        let a = minter.next(100, node);
        let b = minter.next(50, node);
        assert!(b > a);
        let c = minter.next(200, node);
        assert_eq!(c, TxnId::compose(200, node, 0));
    }

    #[tokio::test]
    async fn test_mint_before_start_fails() {
        let cluster = MemoryCluster::new();
        let manager = StoreTransactionManager::new(
            Arc::new(cluster.connect()),
            Arc::new(ManualClock::new(1)),
        );
        assert!(matches!(
            manager.get_and_increment_next_transaction_id(),
            Err(LatchError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_open_is_idempotent_for_identical_payload() {
        let cluster = MemoryCluster::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let manager = started(&cluster, clock, 3).await;
        let node = NodeId::new(3).unwrap();

        let id = manager.get_and_increment_next_transaction_id().unwrap();
        let txn = Transaction::new(id, 1_000, "obj-1", TxnOp::Update);
        manager.open_transaction(id, node, &txn).await.unwrap();
        manager.open_transaction(id, node, &txn).await.unwrap();

        let other = Transaction::new(id, 1_000, "obj-2", TxnOp::Update);
        assert!(matches!(
            manager.open_transaction(id, node, &other).await,
            Err(LatchError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_close_absent_is_not_an_error() {
        let cluster = MemoryCluster::new();
        let manager = started(&cluster, Arc::new(ManualClock::new(1)), 0).await;
        manager
            .close_transaction(TxnId::from_raw(42), NodeId::new(0).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_survivor_iterates_in_id_order_then_cleans_up() {
        let cluster = MemoryCluster::new();
        let clock = Arc::new(ManualClock::new(10_000));
        let crashed = started(&cluster, clock.clone(), 7).await;
        let node = NodeId::new(7).unwrap();

        let mut ids = Vec::new();
        for i in 0..3 {
            let id = crashed.get_and_increment_next_transaction_id().unwrap();
            let txn = Transaction::new(id, clock.now_millis(), format!("obj-{}", i), TxnOp::Update);
            crashed.open_transaction(id, node, &txn).await.unwrap();
            ids.push(id);
            clock.advance(1);
        }

        let survivor = started(&cluster, clock, 1).await;
        assert_eq!(
            survivor.get_node_ids_with_open_transactions().await.unwrap(),
            vec![node]
        );
        let open = survivor.iterate_transactions(node).await.unwrap();
        assert_eq!(open.iter().map(|(id, _)| *id).collect::<Vec<_>>(), ids);
        assert_eq!(open[2].1.object_id, "obj-2");

        for (id, _) in open {
            survivor.close_transaction(id, node).await.unwrap();
        }
        survivor.cleanup(node).await.unwrap();
        assert!(survivor
            .get_node_ids_with_open_transactions()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_with_open_transactions_keeps_them() {
        let cluster = MemoryCluster::new();
        let manager = started(&cluster, Arc::new(ManualClock::new(1)), 2).await;
        let node = NodeId::new(2).unwrap();
        let id = manager.get_and_increment_next_transaction_id().unwrap();
        manager
            .open_transaction(id, node, &Transaction::new(id, 1, "o", TxnOp::Delete))
            .await
            .unwrap();

        manager.cleanup(node).await.unwrap();
        assert_eq!(manager.iterate_transactions(node).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reindex_flag() {
        let cluster = MemoryCluster::new();
        let a = started(&cluster, Arc::new(ManualClock::new(1)), 0).await;
        let b = started(&cluster, Arc::new(ManualClock::new(1)), 1).await;

        assert!(!a.is_reindex_in_process().await.unwrap());
        a.set_reindex_in_process(true).await.unwrap();
        assert!(b.is_reindex_in_process().await.unwrap());
        b.set_reindex_in_process(false).await.unwrap();
        assert!(!a.is_reindex_in_process().await.unwrap());
    }
}
