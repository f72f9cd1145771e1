use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use latch_core::cluster::NodeId;
use latch_core::coordination::{SignalListener, SignalWatcher};
use latch_core::error::{LatchError, Result};
use latch_core::signal::{Signal, SignalMessage};
use latch_core::store::{ConsumerOptions, DurableLog, LogConsumer, OffsetReset};

use super::dispatch::SignalDispatcher;

const POLL_TIMEOUT: Duration = Duration::from_millis(500);

/// [`SignalWatcher`] broadcasting over a log topic. Each node reads the
/// topic in its own consumer group `signals-<node>`, starting from the
/// newest record.
pub struct LogSignalWatcher {
    log: Arc<dyn DurableLog>,
    topic: String,
    node_id: OnceLock<NodeId>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LogSignalWatcher {
    pub fn new(log: Arc<dyn DurableLog>, topic: impl Into<String>) -> Self {
        Self {
            log,
            topic: topic.into(),
            node_id: OnceLock::new(),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }
}

async fn consume(
    mut consumer: Box<dyn LogConsumer>,
    node_id: NodeId,
    dispatcher: SignalDispatcher,
    cancel: CancellationToken,
) {
    loop {
        let records = tokio::select! {
            polled = consumer.poll(POLL_TIMEOUT) => polled,
            _ = cancel.cancelled() => break,
        };
        let records = match records {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll signals");
                tokio::select! {
                    _ = tokio::time::sleep(POLL_TIMEOUT) => continue,
                    _ = cancel.cancelled() => break,
                }
            }
        };

        let mut next_offsets = BTreeMap::new();
        for record in records {
            next_offsets.insert(record.partition, record.offset + 1);
            match serde_json::from_slice::<SignalMessage>(&record.payload) {
                Ok(message) if message.node_id == node_id => {}
                Ok(message) => dispatcher.dispatch(message.signal),
                Err(e) => {
                    tracing::warn!(offset = record.offset, error = %e, "Skipping malformed signal")
                }
            }
        }
        for (partition, next) in next_offsets {
            if let Err(e) = consumer.commit(partition, next).await {
                tracing::warn!(partition, error = %e, "Failed to commit signal offset");
            }
        }
    }

    if let Err(e) = consumer.close().await {
        tracing::debug!(error = %e, "Signal consumer close failed");
    }
    dispatcher.shutdown().await;
}

#[async_trait]
impl SignalWatcher for LogSignalWatcher {
    async fn start(&self, node_id: NodeId, listener: Arc<dyn SignalListener>) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.is_some() || self.cancel.is_cancelled() {
            return Err(LatchError::InvalidState(
                "signal watcher already started".to_string(),
            ));
        }

        let group = format!("signals-{}", node_id);
        let consumer = self
            .log
            .subscribe(&self.topic, &group, ConsumerOptions::new(OffsetReset::Latest))
            .await?;
        let _ = self.node_id.set(node_id);
        tracing::info!(topic = %self.topic, group = %group, "Subscribed to signals");

        *task = Some(tokio::spawn(consume(
            consumer,
            node_id,
            SignalDispatcher::start(listener),
            self.cancel.clone(),
        )));
        Ok(())
    }

    async fn send_signal(&self, signal: Signal) -> Result<()> {
        let Some(node_id) = self.node_id.get().copied() else {
            return Err(LatchError::InvalidState(
                "signal watcher not started".to_string(),
            ));
        };
        let payload = serde_json::to_vec(&SignalMessage { signal, node_id })?;
        self.log.append(&self.topic, signal.as_str(), &payload).await?;
        tracing::debug!(signal = %signal, "Sent signal");
        Ok(())
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Signal consumer ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryLog;
    use latch_core::clock::SystemClock;
    use std::sync::Mutex as StdMutex;

    type Received = Arc<StdMutex<Vec<Signal>>>;

    async fn started(log: &MemoryLog, node: u16) -> (LogSignalWatcher, Received) {
        let watcher = LogSignalWatcher::new(Arc::new(log.clone()), "LatchSignals");
        let received: Received = Arc::new(StdMutex::new(Vec::new()));
        let r = received.clone();
        watcher
            .start(
                NodeId::new(node).unwrap(),
                Arc::new(move |signal: Signal| r.lock().unwrap().push(signal)),
            )
            .await
            .unwrap();
        (watcher, received)
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let log = MemoryLog::new(Arc::new(SystemClock));
        let (a, a_got) = started(&log, 3).await;
        let (b, b_got) = started(&log, 1).await;
        let (c, c_got) = started(&log, 2).await;

        a.send_signal(Signal::AuthChange).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(a_got.lock().unwrap().is_empty());
        assert_eq!(*b_got.lock().unwrap(), vec![Signal::AuthChange]);
        assert_eq!(*c_got.lock().unwrap(), vec![Signal::AuthChange]);

        for w in [a, b, c] {
            w.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_history_before_start_is_not_replayed() {
        let log = MemoryLog::new(Arc::new(SystemClock));
        let (a, _) = started(&log, 0).await;
        a.send_signal(Signal::Design).await.unwrap();

        let (b, b_got) = started(&log, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(b_got.lock().unwrap().is_empty());

        a.shutdown().await;
        b.shutdown().await;
    }
}
