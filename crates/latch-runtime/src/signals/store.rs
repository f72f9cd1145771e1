use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use latch_core::alert::Alerter;
use latch_core::cluster::NodeId;
use latch_core::coordination::{SignalListener, SignalWatcher};
use latch_core::error::{LatchError, Result};
use latch_core::signal::{Signal, SignalMessage};
use latch_core::store::{key_join, ConnectionState, CoordinationStore};

use super::dispatch::SignalDispatcher;

pub const SIGNALS_KEY: &str = "signals";

fn signal_key(signal: Signal) -> String {
    key_join(&[SIGNALS_KEY, signal.as_str()])
}

struct Shared {
    store: Arc<dyn CoordinationStore>,
    alerter: Arc<dyn Alerter>,
    retry_delay: Duration,
    /// Last version acted on, per signal. Held across a send so the
    /// sender's own write is recorded before any refresh compares it.
    latest: HashMap<Signal, Mutex<u64>>,
    wake_tx: mpsc::Sender<()>,
    retry_pending: AtomicBool,
    cancel: CancellationToken,
}

impl Shared {
    fn wake(&self) {
        // A pending refresh reads the latest versions anyway.
        let _ = self.wake_tx.try_send(());
    }

    async fn current_versions(&self) -> Result<HashMap<Signal, u64>> {
        let mut versions = HashMap::new();
        for signal in Signal::ALL {
            let version = self
                .store
                .get(&signal_key(signal))
                .await?
                .map(|v| v.version)
                .unwrap_or(0);
            versions.insert(signal, version);
        }
        Ok(versions)
    }

    async fn refresh(self: &Arc<Self>, dispatcher: &SignalDispatcher) {
        let versions = match self.current_versions().await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "Failed to refresh signal versions");
                self.alerter
                    .alert(&format!("Failed to refresh signal versions: {}", e));
                self.schedule_retry();
                return;
            }
        };

        for signal in Signal::ALL {
            let Some(latest) = self.latest.get(&signal) else {
                continue;
            };
            let new_version = versions.get(&signal).copied().unwrap_or(0);
            let mut seen = latest.lock().await;
            if new_version != *seen {
                tracing::debug!(signal = %signal, from = *seen, to = new_version, "Saw new signal");
                *seen = new_version;
                dispatcher.dispatch(signal);
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>) {
        if self.retry_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(shared.retry_delay) => {
                    shared.retry_pending.store(false, Ordering::SeqCst);
                    shared.wake();
                }
                _ = shared.cancel.cancelled() => {}
            }
        });
    }
}

struct Running {
    node_id: NodeId,
    tasks: Vec<JoinHandle<()>>,
}

/// [`SignalWatcher`] over one versioned record per signal at
/// `signals/<NAME>`. A change to any record wakes a single refresh that
/// compares every version against the last one acted on.
pub struct StoreSignalWatcher {
    shared: Arc<Shared>,
    wake_rx: std::sync::Mutex<Option<mpsc::Receiver<()>>>,
    node_id: OnceLock<NodeId>,
    running: Mutex<Option<Running>>,
}

impl StoreSignalWatcher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        alerter: Arc<dyn Alerter>,
        retry_delay: Duration,
    ) -> Self {
        let (wake_tx, wake_rx) = mpsc::channel(1);
        let latest = Signal::ALL.iter().map(|s| (*s, Mutex::new(0))).collect();
        Self {
            shared: Arc::new(Shared {
                store,
                alerter,
                retry_delay,
                latest,
                wake_tx,
                retry_pending: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
            wake_rx: std::sync::Mutex::new(Some(wake_rx)),
            node_id: OnceLock::new(),
            running: Mutex::new(None),
        }
    }

    async fn ensure_records(&self) -> Result<()> {
        for signal in Signal::ALL {
            match self.shared.store.create(&signal_key(signal), b"").await {
                Ok(_) | Err(LatchError::AlreadyExists(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Subscribe to every signal record. Done before the version snapshot so
    /// a write landing in between still wakes a refresh.
    async fn subscribe(&self) -> Result<Vec<(Signal, watch::Receiver<Option<u64>>)>> {
        let mut receivers = Vec::with_capacity(Signal::ALL.len());
        for signal in Signal::ALL {
            receivers.push((signal, self.shared.store.watch(&signal_key(signal)).await?));
        }
        Ok(receivers)
    }

    fn spawn_forwarders(
        &self,
        receivers: Vec<(Signal, watch::Receiver<Option<u64>>)>,
    ) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();
        for (signal, mut rx) in receivers {
            let shared = self.shared.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = rx.changed() => {
                            if changed.is_err() {
                                tracing::debug!(signal = %signal, "Signal watch closed");
                                break;
                            }
                            rx.borrow_and_update();
                            shared.wake();
                        }
                        _ = shared.cancel.cancelled() => break,
                    }
                }
            }));
        }

        // Changes may have been missed while disconnected.
        let shared = self.shared.clone();
        let mut state_rx = shared.store.connection_state();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *state_rx.borrow_and_update() == ConnectionState::Reconnected {
                            shared.wake();
                        }
                    }
                    _ = shared.cancel.cancelled() => break,
                }
            }
        }));
        tasks
    }
}

#[async_trait]
impl SignalWatcher for StoreSignalWatcher {
    async fn start(&self, node_id: NodeId, listener: Arc<dyn SignalListener>) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(LatchError::InvalidState(
                "signal watcher already started".to_string(),
            ));
        }
        let Some(mut wake_rx) = self.wake_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            return Err(LatchError::InvalidState(
                "signal watcher cannot be restarted".to_string(),
            ));
        };

        self.ensure_records().await?;
        let receivers = self.subscribe().await?;
        for (signal, version) in self.shared.current_versions().await? {
            if let Some(latest) = self.shared.latest.get(&signal) {
                *latest.lock().await = version;
            }
        }
        let _ = self.node_id.set(node_id);

        let dispatcher = SignalDispatcher::start(listener);
        let mut tasks = self.spawn_forwarders(receivers);

        let shared = self.shared.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    woke = wake_rx.recv() => {
                        if woke.is_none() {
                            break;
                        }
                        shared.refresh(&dispatcher).await;
                    }
                    _ = shared.cancel.cancelled() => break,
                }
            }
            dispatcher.shutdown().await;
        }));

        tracing::info!(node_id = %node_id, "Signal watcher started");
        *running = Some(Running { node_id, tasks });
        Ok(())
    }

    async fn send_signal(&self, signal: Signal) -> Result<()> {
        let Some(node_id) = self.node_id.get().copied() else {
            return Err(LatchError::InvalidState(
                "signal watcher not started".to_string(),
            ));
        };
        let payload = serde_json::to_vec(&SignalMessage { signal, node_id })?;
        let Some(latest) = self.shared.latest.get(&signal) else {
            return Ok(());
        };

        let mut seen = latest.lock().await;
        let version = self.shared.store.set(&signal_key(signal), &payload).await?;
        tracing::debug!(signal = %signal, version, "Sending signal");
        if version > 0 && *seen == version - 1 {
            *seen = version;
        } else {
            tracing::debug!(signal = %signal, "Still waiting for earlier signals");
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            for task in running.tasks {
                if let Err(e) = task.await {
                    tracing::warn!(error = %e, "Signal task ended abnormally");
                }
            }
            tracing::info!(node_id = %running.node_id, "Signal watcher shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryCluster, MemoryCoordinationStore};
    use latch_core::testing::RecordingAlerter;
    use std::sync::Mutex as StdMutex;

    type Received = Arc<StdMutex<Vec<Signal>>>;

    async fn started(store: Arc<MemoryCoordinationStore>, node: u16) -> (StoreSignalWatcher, Received) {
        let watcher = StoreSignalWatcher::new(
            store,
            Arc::new(RecordingAlerter::new()),
            Duration::from_millis(50),
        );
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

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_sender_does_not_receive_own_signal() {
        let cluster = MemoryCluster::new();
        let (sender, sender_got) = started(Arc::new(cluster.connect()), 3).await;
        let (other, other_got) = started(Arc::new(cluster.connect()), 1).await;

        sender.send_signal(Signal::AuthChange).await.unwrap();
        settle().await;

        assert!(sender_got.lock().unwrap().is_empty());
        assert_eq!(*other_got.lock().unwrap(), vec![Signal::AuthChange]);

        sender.shutdown().await;
        other.shutdown().await;
    }

    #[tokio::test]
    async fn test_send_before_start_is_rejected() {
        let cluster = MemoryCluster::new();
        let watcher = StoreSignalWatcher::new(
            Arc::new(cluster.connect()),
            Arc::new(RecordingAlerter::new()),
            Duration::from_secs(1),
        );
        assert!(matches!(
            watcher.send_signal(Signal::Design).await,
            Err(LatchError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_missed_versions_collapse() {
        let cluster = MemoryCluster::new();
        let (watcher, got) = started(Arc::new(cluster.connect()), 1).await;
        let writer = cluster.connect();

        for _ in 0..3 {
            writer.set("signals/DESIGN", b"{}").await.unwrap();
        }
        settle().await;

        let design = got.lock().unwrap().iter().filter(|s| **s == Signal::Design).count();
        assert_eq!(design, 1);
        assert!(!got.lock().unwrap().contains(&Signal::AuthChange));
        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_failure_alerts_and_retries() {
        let cluster = MemoryCluster::new();
        let store = Arc::new(cluster.connect());
        let alerter = Arc::new(RecordingAlerter::new());
        let watcher = StoreSignalWatcher::new(store.clone(), alerter.clone(), Duration::from_millis(30));
        let got: Received = Arc::new(StdMutex::new(Vec::new()));
        let g = got.clone();
        watcher
            .start(
                NodeId::new(2).unwrap(),
                Arc::new(move |signal: Signal| g.lock().unwrap().push(signal)),
            )
            .await
            .unwrap();

        store.suspend();
        cluster.connect().set("signals/AUTH_CHANGE", b"{}").await.unwrap();
        settle().await;
        assert!(alerter.count() >= 1);
        assert!(got.lock().unwrap().is_empty());

        store.resume();
        settle().await;
        assert_eq!(*got.lock().unwrap(), vec![Signal::AuthChange]);
        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let cluster = MemoryCluster::new();
        let (watcher, _) = started(Arc::new(cluster.connect()), 0).await;
        watcher.shutdown().await;
        watcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_signal_sent_right_after_start_is_seen() {
        let cluster = MemoryCluster::new();
        let (watcher, got) = started(Arc::new(cluster.connect()), 1).await;
        cluster
            .connect()
            .set("signals/JAVASCRIPT_CLEAR_CACHE", b"{}")
            .await
            .unwrap();
        settle().await;

        assert_eq!(*got.lock().unwrap(), vec![Signal::JavascriptClearCache]);
        watcher.shutdown().await;
    }
}
