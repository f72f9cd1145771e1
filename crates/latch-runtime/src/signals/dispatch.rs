use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use latch_core::coordination::SignalListener;
use latch_core::signal::Signal;

/// One sequential worker per signal kind. Each worker queues at most one
/// pending run; further deliveries while one is pending are dropped.
pub(crate) struct SignalDispatcher {
    senders: HashMap<Signal, mpsc::Sender<()>>,
    workers: Vec<JoinHandle<()>>,
}

impl SignalDispatcher {
    pub(crate) fn start(listener: Arc<dyn SignalListener>) -> Self {
        let mut senders = HashMap::new();
        let mut workers = Vec::new();
        for signal in Signal::ALL {
            let (tx, mut rx) = mpsc::channel::<()>(1);
            let listener = listener.clone();
            workers.push(tokio::spawn(async move {
                while rx.recv().await.is_some() {
                    tracing::debug!(signal = %signal, "Handling signal");
                    listener.on_signal(signal).await;
                }
            }));
            senders.insert(signal, tx);
        }
        Self { senders, workers }
    }

    pub(crate) fn dispatch(&self, signal: Signal) {
        if let Some(tx) = self.senders.get(&signal) {
            if tx.try_send(()).is_err() {
                tracing::debug!(signal = %signal, "Signal already pending");
            }
        }
    }

    /// Stop accepting signals and wait for in-flight handlers.
    pub(crate) async fn shutdown(self) {
        drop(self.senders);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Signal worker ended abnormally");
            }
        }
    }
}
