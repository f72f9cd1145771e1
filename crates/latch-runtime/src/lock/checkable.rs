use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use latch_core::alert::Alerter;
use latch_core::coordination::CheckableLocker;
use latch_core::error::{LatchError, Result};
use latch_core::store::CoordinationStore;

use super::monitor::ConnectionMonitor;
use super::mutex::StoreMutex;

/// Local half of a checkable lock: a gate admitting one task of this
/// process, plus the connection monitor armed while the lock is held.
pub(crate) struct LocalHold {
    gate: Arc<Mutex<()>>,
    guard: StdMutex<Option<OwnedMutexGuard<()>>>,
    monitor: StdMutex<Option<ConnectionMonitor>>,
}

impl LocalHold {
    pub(crate) fn new(gate: Arc<Mutex<()>>) -> Self {
        Self {
            gate,
            guard: StdMutex::new(None),
            monitor: StdMutex::new(None),
        }
    }

    pub(crate) async fn enter(&self, cancel: &CancellationToken) -> Result<OwnedMutexGuard<()>> {
        tokio::select! {
            guard = self.gate.clone().lock_owned() => Ok(guard),
            _ = cancel.cancelled() => {
                Err(LatchError::Interrupted("lock wait cancelled".to_string()))
            }
        }
    }

    pub(crate) fn hold(&self, guard: OwnedMutexGuard<()>, store: &dyn CoordinationStore) {
        if let Ok(mut slot) = self.monitor.lock() {
            *slot = Some(ConnectionMonitor::spawn(store));
        }
        if let Ok(mut slot) = self.guard.lock() {
            *slot = Some(guard);
        }
    }

    /// Drop the monitor and the local guard. Returns whether anything was held.
    pub(crate) fn leave(&self) -> bool {
        if let Ok(mut slot) = self.monitor.lock() {
            slot.take();
        }
        match self.guard.lock() {
            Ok(mut slot) => slot.take().is_some(),
            Err(_) => false,
        }
    }

    pub(crate) fn is_healthy(&self) -> bool {
        match self.monitor.lock() {
            Ok(slot) => slot.as_ref().map(|m| !m.has_error()).unwrap_or(true),
            Err(_) => false,
        }
    }
}

/// One named distributed lock, held by at most one task of this process.
pub struct StoreCheckableLocker {
    store: Arc<dyn CoordinationStore>,
    mutex: StoreMutex,
    hold: LocalHold,
    alerter: Arc<dyn Alerter>,
    cancel: CancellationToken,
}

impl StoreCheckableLocker {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        path: impl Into<String>,
        alerter: Arc<dyn Alerter>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            mutex: StoreMutex::new(store.clone(), path, cancel.clone()),
            store,
            hold: LocalHold::new(Arc::new(Mutex::new(()))),
            alerter,
            cancel,
        }
    }

    pub fn path(&self) -> &str {
        self.mutex.key()
    }
}

#[async_trait]
impl CheckableLocker for StoreCheckableLocker {
    async fn acquire(&self) -> Result<()> {
        let guard = self.hold.enter(&self.cancel).await?;
        if let Err(e) = self.mutex.acquire().await {
            tracing::warn!(path = %self.path(), error = %e, "Failed to acquire lock");
            return Err(e);
        }
        self.hold.hold(guard, self.store.as_ref());
        Ok(())
    }

    async fn release(&self) {
        if let Err(e) = self.mutex.release().await {
            tracing::error!(path = %self.path(), error = %e, "Failed to release lock");
            self.alerter
                .alert(&format!("Failed to release lock {}: {}", self.path(), e));
        }
        self.hold.leave();
    }

    fn is_locked(&self) -> bool {
        self.hold.is_healthy()
    }
}
