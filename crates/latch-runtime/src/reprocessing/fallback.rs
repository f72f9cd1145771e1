use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use latch_core::alert::Alerter;
use latch_core::cluster::NodeId;
use latch_core::coordination::{ReplayHandler, TransactionManager, TransactionReprocessingQueue};
use latch_core::error::Result;
use latch_core::transaction::Transaction;

struct Buffer {
    delegate: Arc<dyn TransactionReprocessingQueue>,
    pending: StdMutex<VecDeque<(Transaction, NodeId)>>,
    transactions: StdMutex<Option<Arc<dyn TransactionManager>>>,
}

impl Buffer {
    fn push_back(&self, entry: (Transaction, NodeId)) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_back(entry);
        }
    }

    fn push_front(&self, entry: (Transaction, NodeId)) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push_front(entry);
        }
    }

    fn pop_front(&self) -> Option<(Transaction, NodeId)> {
        self.pending.lock().ok().and_then(|mut p| p.pop_front())
    }

    fn len(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    async fn flush(&self) -> usize {
        let transactions = self.transactions.lock().ok().and_then(|t| t.clone());
        let mut flushed = 0;
        while let Some((txn, node_id)) = self.pop_front() {
            if let Err(e) = self.delegate.insert(&txn, node_id).await {
                tracing::warn!(txn_id = %txn.txn_id, error = %e, "Reprocessing queue still unavailable");
                self.push_front((txn, node_id));
                break;
            }
            if let Some(transactions) = &transactions {
                if let Err(e) = transactions.close_transaction(txn.txn_id, node_id).await {
                    tracing::warn!(txn_id = %txn.txn_id, error = %e, "Failed to close flushed transaction");
                }
            }
            flushed += 1;
        }
        if flushed > 0 {
            tracing::info!(flushed, remaining = self.len(), "Flushed buffered reprocessing inserts");
        }
        flushed
    }
}

/// Wraps a [`TransactionReprocessingQueue`] so failed inserts are kept in
/// memory and retried in the background instead of failing the caller.
pub struct ErrorCatchingReprocessingQueue {
    buffer: Arc<Buffer>,
    alerter: Arc<dyn Alerter>,
    retry_interval: Duration,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ErrorCatchingReprocessingQueue {
    pub fn new(
        delegate: Arc<dyn TransactionReprocessingQueue>,
        alerter: Arc<dyn Alerter>,
        retry_interval: Duration,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            buffer: Arc::new(Buffer {
                delegate,
                pending: StdMutex::new(VecDeque::new()),
                transactions: StdMutex::new(None),
            }),
            alerter,
            retry_interval,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// Transactions waiting for the delegate to accept them.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Push buffered entries to the delegate in order, stopping at the
    /// first failure. Returns how many were delivered.
    pub async fn flush(&self) -> usize {
        self.buffer.flush().await
    }
}

#[async_trait]
impl TransactionReprocessingQueue for ErrorCatchingReprocessingQueue {
    async fn insert(&self, txn: &Transaction, node_id: NodeId) -> Result<()> {
        if let Err(e) = self.buffer.delegate.insert(txn, node_id).await {
            tracing::warn!(
                txn_id = %txn.txn_id,
                node_id = %node_id,
                error = %e,
                "Buffering transaction after failed reprocessing insert"
            );
            self.buffer.push_back((txn.clone(), node_id));
        }
        Ok(())
    }

    async fn start(
        &self,
        handler: Arc<dyn ReplayHandler>,
        transactions: Arc<dyn TransactionManager>,
    ) -> Result<()> {
        if let Ok(mut slot) = self.buffer.transactions.lock() {
            *slot = Some(transactions.clone());
        }
        self.buffer.delegate.start(handler, transactions).await?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let buffer = self.buffer.clone();
        let interval = self.retry_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        *self.task.lock().await = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        buffer.flush().await;
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        }));
        Ok(())
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Reprocessing retry task ended abnormally");
            }
        }

        let stranded = self.buffer.len();
        if stranded > 0 {
            tracing::error!(stranded, "Shutting down with unflushed reprocessing inserts");
            self.alerter.alert(&format!(
                "{} transactions were never written to the reprocessing queue",
                stranded
            ));
        }
        self.buffer.delegate.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryCluster, MemoryLog};
    use crate::reprocessing::LogReprocessingQueue;
    use crate::transactions::StoreTransactionManager;
    use latch_core::config::ReprocessingConfig;
    use latch_core::testing::{ManualClock, RecordingAlerter};
    use latch_core::transaction::{TxnId, TxnOp};

    struct Fixture {
        log: MemoryLog,
        alerter: Arc<RecordingAlerter>,
        transactions: Arc<StoreTransactionManager>,
        queue: ErrorCatchingReprocessingQueue,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let log = MemoryLog::new(clock.clone());
        let alerter = Arc::new(RecordingAlerter::new());
        let delegate = LogReprocessingQueue::new(
            Arc::new(log.clone()),
            clock.clone(),
            alerter.clone(),
            ReprocessingConfig::default(),
        );
        let queue = ErrorCatchingReprocessingQueue::new(
            Arc::new(delegate),
            alerter.clone(),
            Duration::from_secs(3600),
        );

        let cluster = MemoryCluster::new();
        let transactions = Arc::new(StoreTransactionManager::new(
            Arc::new(cluster.connect()),
            clock,
        ));
        transactions.start(NodeId::new(4).unwrap()).await.unwrap();
        queue
            .start(
                Arc::new(|_: &Transaction| -> Result<()> { Ok(()) }),
                transactions.clone(),
            )
            .await
            .unwrap();

        Fixture {
            log,
            alerter,
            transactions,
            queue,
        }
    }

    async fn open(f: &Fixture, object: &str) -> Transaction {
        let node = NodeId::new(4).unwrap();
        let id = f.transactions.get_and_increment_next_transaction_id().unwrap();
        let txn = Transaction::new(id, 1_000, object, TxnOp::Update);
        f.transactions.open_transaction(id, node, &txn).await.unwrap();
        txn
    }

    #[tokio::test]
    async fn test_insert_passes_through_when_healthy() {
        let f = fixture().await;
        let txn = open(&f, "obj").await;
        f.queue.insert(&txn, NodeId::new(4).unwrap()).await.unwrap();
        assert_eq!(f.log.record_count("LatchReprocessing"), 1);
        assert_eq!(f.queue.buffered(), 0);
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_insert_is_buffered_then_flushed_and_closed() {
        let f = fixture().await;
        let node = NodeId::new(4).unwrap();
        let first = open(&f, "a").await;
        let second = open(&f, "b").await;

        f.log.set_available(false);
        f.queue.insert(&first, node).await.unwrap();
        f.queue.insert(&second, node).await.unwrap();
        assert_eq!(f.queue.buffered(), 2);
        assert_eq!(f.queue.flush().await, 0);
        assert_eq!(f.queue.buffered(), 2);

        f.log.set_available(true);
        assert_eq!(f.queue.flush().await, 2);
        assert_eq!(f.queue.buffered(), 0);
        assert_eq!(f.log.record_count("LatchReprocessing"), 2);
        assert!(f.transactions.iterate_transactions(node).await.unwrap().is_empty());
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_alerts_on_stranded_entries() {
        let f = fixture().await;
        let txn = Transaction::new(TxnId::from_raw(7), 1_000, "x", TxnOp::Delete);
        f.log.set_available(false);
        f.queue.insert(&txn, NodeId::new(4).unwrap()).await.unwrap();

        f.queue.shutdown().await;
        f.queue.shutdown().await;
        assert_eq!(f.alerter.count(), 1);
    }
}
