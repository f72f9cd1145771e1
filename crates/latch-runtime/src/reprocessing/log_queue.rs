use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use latch_core::alert::Alerter;
use latch_core::clock::Clock;
use latch_core::cluster::NodeId;
use latch_core::config::ReprocessingConfig;
use latch_core::coordination::{ReplayHandler, TransactionManager, TransactionReprocessingQueue};
use latch_core::error::{LatchError, Result};
use latch_core::store::{ConsumerOptions, DurableLog, LogConsumer, LogRecord, OffsetReset};
use latch_core::transaction::Transaction;

/// What happened to one partition's slice of a poll.
#[derive(Debug, Default, PartialEq, Eq)]
struct PartitionOutcome {
    replayed: usize,
    /// Offset to commit, past the last record dealt with.
    next: Option<u64>,
    /// Offset to resume from next time; set when the partition stopped early.
    rewind: Option<u64>,
}

struct Inner {
    log: Arc<dyn DurableLog>,
    clock: Arc<dyn Clock>,
    alerter: Arc<dyn Alerter>,
    config: ReprocessingConfig,
    poll_timeout: Duration,
    consumer: Mutex<Option<Box<dyn LogConsumer>>>,
    handler: Mutex<Option<Arc<dyn ReplayHandler>>>,
    running: AtomicBool,
}

impl Inner {
    async fn handle_partition(
        &self,
        handler: &dyn ReplayHandler,
        records: &[LogRecord],
        cutoff: i64,
    ) -> PartitionOutcome {
        let mut outcome = PartitionOutcome::default();
        for record in records {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            // Appended too recently.
            if record.timestamp > cutoff {
                outcome.rewind = Some(record.offset);
                break;
            }
            let txn = match Transaction::from_bytes(&record.payload) {
                Ok(txn) => txn,
                Err(e) => {
                    tracing::error!(
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "Skipping malformed reprocessing record"
                    );
                    self.alerter.alert(&format!(
                        "Skipping malformed reprocessing record at {}:{}: {}",
                        record.partition, record.offset, e
                    ));
                    outcome.next = Some(record.offset + 1);
                    continue;
                }
            };
            // Started too recently, whenever it was appended.
            if txn.timestamp > cutoff {
                outcome.rewind = Some(record.offset);
                break;
            }

            tracing::info!(object_id = %txn.object_id, txn_id = %txn.txn_id, "Reprocessing transaction");
            match handler.replay(&txn).await {
                Ok(()) => {
                    outcome.replayed += 1;
                    outcome.next = Some(record.offset + 1);
                }
                Err(e) => {
                    tracing::error!(txn_id = %txn.txn_id, error = %e, "Failed to reprocess transaction");
                    outcome.rewind = Some(record.offset);
                    break;
                }
            }
        }
        outcome
    }

    async fn poll_once(&self) -> Result<usize> {
        let handler = self
            .handler
            .lock()
            .await
            .clone()
            .ok_or_else(|| LatchError::InvalidState("reprocessing queue not started".to_string()))?;
        let mut consumer = self.consumer.lock().await;
        let consumer = consumer
            .as_mut()
            .ok_or_else(|| LatchError::InvalidState("reprocessing queue not started".to_string()))?;

        let cutoff = self.clock.now_millis() - self.config.grace_period_ms as i64;
        let mut replayed = 0;

        // A poll may not return everything; keep going while partitions drain cleanly.
        while self.running.load(Ordering::SeqCst) {
            let mut partitions: BTreeMap<u32, Vec<LogRecord>> = BTreeMap::new();
            for record in consumer.poll(self.poll_timeout).await? {
                partitions.entry(record.partition).or_default().push(record);
            }

            let mut progressed = false;
            for (partition, records) in partitions {
                let outcome = self
                    .handle_partition(handler.as_ref(), &records, cutoff)
                    .await;
                replayed += outcome.replayed;
                if let Some(next) = outcome.next {
                    consumer.commit(partition, next).await?;
                }
                match outcome.rewind {
                    Some(offset) => consumer.seek(partition, offset).await?,
                    None if outcome.next.is_some() => progressed = true,
                    None => {}
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(replayed)
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let interval = self.config.poll_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.poll_once().await {
                        Ok(0) => {}
                        Ok(n) => tracing::info!(replayed = n, "Reprocessing poll finished"),
                        Err(e) => tracing::error!(error = %e, "Failed polling reprocessing queue"),
                    }
                }
                _ = shutdown_rx.changed() => break,
            }
        }
    }
}

/// [`TransactionReprocessingQueue`] on a durable log topic. Records are
/// replayed once both their append time and the transaction's own start
/// are older than the grace period.
pub struct LogReprocessingQueue {
    inner: Arc<Inner>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LogReprocessingQueue {
    pub fn new(
        log: Arc<dyn DurableLog>,
        clock: Arc<dyn Clock>,
        alerter: Arc<dyn Alerter>,
        config: ReprocessingConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                log,
                clock,
                alerter,
                config,
                poll_timeout: Duration::from_secs(1),
                consumer: Mutex::new(None),
                handler: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
            closed: AtomicBool::new(false),
            shutdown_tx,
            task: Mutex::new(None),
        }
    }

    /// How long one log poll waits for records.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.poll_timeout = timeout;
        }
        self
    }

    /// Run one consumption pass now, returning how many transactions were
    /// replayed.
    pub async fn poll_once(&self) -> Result<usize> {
        self.inner.poll_once().await
    }
}

#[async_trait]
impl TransactionReprocessingQueue for LogReprocessingQueue {
    async fn insert(&self, txn: &Transaction, node_id: NodeId) -> Result<()> {
        let payload = txn.to_bytes()?;
        let position = self
            .inner
            .log
            .append(&self.inner.config.topic, &txn.object_id, &payload)
            .await?;
        tracing::debug!(
            txn_id = %txn.txn_id,
            node_id = %node_id,
            partition = position.partition,
            offset = position.offset,
            "Queued transaction for reprocessing"
        );
        Ok(())
    }

    async fn start(
        &self,
        handler: Arc<dyn ReplayHandler>,
        _transactions: Arc<dyn TransactionManager>,
    ) -> Result<()> {
        *self.inner.handler.lock().await = Some(handler);
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let options = ConsumerOptions::new(OffsetReset::Earliest)
            .with_properties(&self.inner.config.consumer_config);
        let consumer = match self
            .inner
            .log
            .subscribe(&self.inner.config.topic, &self.inner.config.consumer_group, options)
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.inner.consumer.lock().await = Some(consumer);

        let inner = self.inner.clone();
        *self.task.lock().await = Some(tokio::spawn(inner.run(self.shutdown_tx.subscribe())));
        tracing::info!(
            topic = %self.inner.config.topic,
            group = %self.inner.config.consumer_group,
            "Reprocessing queue started"
        );
        Ok(())
    }

    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.running.store(false, Ordering::SeqCst);
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Reprocessing task ended abnormally");
            }
        }
        if let Some(mut consumer) = self.inner.consumer.lock().await.take() {
            if let Err(e) = consumer.close().await {
                tracing::warn!(error = %e, "Failed to close reprocessing consumer");
            }
        }
        tracing::info!("Reprocessing queue shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryCluster, MemoryLog};
    use crate::transactions::StoreTransactionManager;
    use latch_core::testing::{ManualClock, RecordingAlerter};
    use latch_core::transaction::{TxnId, TxnOp};
    use std::sync::Mutex as StdMutex;

    const GROUP: &str = "latch-reprocessing-consumer";

    struct Fixture {
        log: MemoryLog,
        clock: Arc<ManualClock>,
        alerter: Arc<RecordingAlerter>,
        queue: LogReprocessingQueue,
        replayed: Arc<StdMutex<Vec<String>>>,
        fail: Arc<AtomicBool>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(0));
        let log = MemoryLog::with_partitions(clock.clone(), 1);
        let alerter = Arc::new(RecordingAlerter::new());
        let config = ReprocessingConfig {
            poll_interval_secs: 3600,
            ..Default::default()
        };
        let queue = LogReprocessingQueue::new(
            Arc::new(log.clone()),
            clock.clone(),
            alerter.clone(),
            config,
        )
        .with_poll_timeout(Duration::from_millis(10));

        let replayed = Arc::new(StdMutex::new(Vec::new()));
        let fail = Arc::new(AtomicBool::new(false));
        let (r, f) = (replayed.clone(), fail.clone());
        let handler = Arc::new(move |txn: &Transaction| {
            if f.load(Ordering::SeqCst) {
                return Err(LatchError::Internal("storage down".to_string()));
            }
            r.lock().unwrap().push(txn.object_id.clone());
            Ok(())
        });
        let cluster = MemoryCluster::new();
        let transactions = Arc::new(StoreTransactionManager::new(
            Arc::new(cluster.connect()),
            clock.clone(),
        ));
        queue.start(handler, transactions).await.unwrap();

        Fixture {
            log,
            clock,
            alerter,
            queue,
            replayed,
            fail,
        }
    }

    fn txn(id: i64, at: i64, object: &str) -> Transaction {
        Transaction::new(TxnId::from_raw(id), at, object, TxnOp::Update)
    }

    #[tokio::test]
    async fn test_grace_period_gates_replay() {
        let f = fixture().await;
        let node = NodeId::new(0).unwrap();
        f.queue.insert(&txn(1, 0, "obj-1"), node).await.unwrap();

        f.clock.set(60_000);
        assert_eq!(f.queue.poll_once().await.unwrap(), 0);
        assert!(f.replayed.lock().unwrap().is_empty());
        assert_eq!(f.log.committed_offset("LatchReprocessing", GROUP, 0), None);

        f.clock.set(130_000);
        assert_eq!(f.queue.poll_once().await.unwrap(), 1);
        assert_eq!(*f.replayed.lock().unwrap(), vec!["obj-1"]);
        assert_eq!(f.log.committed_offset("LatchReprocessing", GROUP, 0), Some(1));

        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_recent_transaction_blocks_partition_even_if_appended_early() {
        let f = fixture().await;
        let node = NodeId::new(0).unwrap();
        // Appended at t=0, but the transaction claims to start at t=100000.
        f.queue.insert(&txn(1, 100_000, "late"), node).await.unwrap();

        f.clock.set(130_000);
        assert_eq!(f.queue.poll_once().await.unwrap(), 0);

        f.clock.set(230_000);
        assert_eq!(f.queue.poll_once().await.unwrap(), 1);
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_replay_is_retried_in_order() {
        let f = fixture().await;
        let node = NodeId::new(0).unwrap();
        f.queue.insert(&txn(1, 0, "a"), node).await.unwrap();
        f.queue.insert(&txn(2, 0, "b"), node).await.unwrap();
        f.clock.set(200_000);

        f.fail.store(true, Ordering::SeqCst);
        assert_eq!(f.queue.poll_once().await.unwrap(), 0);
        assert_eq!(f.log.committed_offset("LatchReprocessing", GROUP, 0), None);

        f.fail.store(false, Ordering::SeqCst);
        assert_eq!(f.queue.poll_once().await.unwrap(), 2);
        assert_eq!(*f.replayed.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(f.log.committed_offset("LatchReprocessing", GROUP, 0), Some(2));
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_record_is_alerted_and_skipped() {
        let f = fixture().await;
        f.log.append("LatchReprocessing", "junk", b"not json").await.unwrap();
        f.queue
            .insert(&txn(1, 0, "good"), NodeId::new(0).unwrap())
            .await
            .unwrap();
        f.clock.set(200_000);

        assert_eq!(f.queue.poll_once().await.unwrap(), 1);
        assert_eq!(f.alerter.count(), 1);
        assert_eq!(f.log.committed_offset("LatchReprocessing", GROUP, 0), Some(2));
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let f = fixture().await;
        f.queue.shutdown().await;
        f.queue.shutdown().await;
        assert!(matches!(
            f.queue.poll_once().await,
            Err(LatchError::InvalidState(_))
        ));
    }
}
