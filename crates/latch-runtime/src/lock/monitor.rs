use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use latch_core::store::CoordinationStore;

/// Latches an error flag when the store connection is suspended or lost.
/// The flag stays set until [`clear`](Self::clear) is called.
pub struct ConnectionMonitor {
    error: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl ConnectionMonitor {
    pub fn spawn(store: &dyn CoordinationStore) -> Self {
        let mut state_rx = store.connection_state();
        let error = Arc::new(AtomicBool::new(state_rx.borrow_and_update().is_error()));
        let flag = error.clone();
        let session = store.session_id().to_string();

        let task = tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow_and_update();
                if state.is_error() {
                    tracing::debug!(session = %session, state = %state, "Connection error observed");
                    flag.store(true, Ordering::SeqCst);
                }
            }
        });

        Self { error, task }
    }

    pub fn has_error(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was set.
    pub fn clear(&self) -> bool {
        self.error.swap(false, Ordering::SeqCst)
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
