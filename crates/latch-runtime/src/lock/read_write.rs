use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use latch_core::alert::Alerter;
use latch_core::coordination::{CheckableLocker, ReadWriteLocker};
use latch_core::error::{LatchError, Result};
use latch_core::store::{key_join, CoordinationStore};

use super::checkable::LocalHold;
use super::mutex::{wait_until_absent, StoreMutex};

/// Distributed read/write lock under one path. Readers register
/// `<path>/readers/<id>` markers; the writer holds `<path>/write` and waits
/// for the markers to drain. Within this process only one task holds either
/// side at a time.
pub struct StoreReadWriteLocker {
    read: Arc<ReadSide>,
    write: Arc<WriteSide>,
}

impl StoreReadWriteLocker {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        path: &str,
        alerter: Arc<dyn Alerter>,
        cancel: CancellationToken,
    ) -> Self {
        let local = Arc::new(Mutex::new(()));
        let write_key = key_join(&[path, "write"]);
        let readers_key = key_join(&[path, "readers"]);

        let read = ReadSide {
            store: store.clone(),
            write_key: write_key.clone(),
            readers_key: readers_key.clone(),
            marker: StdMutex::new(None),
            hold: LocalHold::new(local.clone()),
            alerter: alerter.clone(),
            cancel: cancel.clone(),
        };
        let write = WriteSide {
            mutex: StoreMutex::new(store.clone(), write_key, cancel.clone()),
            store,
            readers_key,
            hold: LocalHold::new(local),
            alerter,
            cancel,
        };

        Self {
            read: Arc::new(read),
            write: Arc::new(write),
        }
    }
}

impl ReadWriteLocker for StoreReadWriteLocker {
    fn read_lock(&self) -> Arc<dyn CheckableLocker> {
        self.read.clone()
    }

    fn write_lock(&self) -> Arc<dyn CheckableLocker> {
        self.write.clone()
    }
}

struct ReadSide {
    store: Arc<dyn CoordinationStore>,
    write_key: String,
    readers_key: String,
    /// Key and version of this process's reader marker.
    marker: StdMutex<Option<(String, u64)>>,
    hold: LocalHold,
    alerter: Arc<dyn Alerter>,
    cancel: CancellationToken,
}

impl ReadSide {
    async fn register(&self) -> Result<()> {
        loop {
            let mut writer = self.store.watch(&self.write_key).await?;
            wait_until_absent(&mut writer, &self.cancel).await?;

            let marker = key_join(&[&self.readers_key, &uuid::Uuid::new_v4().to_string()]);
            let version = self.store.create_ephemeral(&marker, b"").await?;

            if self.store.get(&self.write_key).await?.is_none() {
                if let Ok(mut slot) = self.marker.lock() {
                    *slot = Some((marker, version));
                }
                return Ok(());
            }

            // A writer arrived between the check and the marker; yield to it.
            tracing::debug!(path = %self.readers_key, "Reader backing off for writer");
            if let Err(e) = self.store.delete(&marker, Some(version)).await {
                if !matches!(e, LatchError::NotFound(_)) {
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl CheckableLocker for ReadSide {
    async fn acquire(&self) -> Result<()> {
        let guard = self.hold.enter(&self.cancel).await?;
        if let Err(e) = self.register().await {
            tracing::warn!(path = %self.readers_key, error = %e, "Failed to acquire read lock");
            return Err(e);
        }
        self.hold.hold(guard, self.store.as_ref());
        Ok(())
    }

    async fn release(&self) {
        let marker = self.marker.lock().ok().and_then(|mut slot| slot.take());
        if let Some((key, version)) = marker {
            match self.store.delete(&key, Some(version)).await {
                Ok(()) | Err(LatchError::NotFound(_)) => {}
                Err(e) => {
                    tracing::error!(path = %key, error = %e, "Failed to release read lock");
                    self.alerter
                        .alert(&format!("Failed to release read lock {}: {}", key, e));
                }
            }
        }
        self.hold.leave();
    }

    fn is_locked(&self) -> bool {
        self.hold.is_healthy()
    }
}

struct WriteSide {
    store: Arc<dyn CoordinationStore>,
    mutex: StoreMutex,
    readers_key: String,
    hold: LocalHold,
    alerter: Arc<dyn Alerter>,
    cancel: CancellationToken,
}

impl WriteSide {
    async fn wait_for_readers(&self) -> Result<()> {
        let mut changes = self.store.watch_children(&self.readers_key).await?;
        loop {
            changes.borrow_and_update();
            if self.store.children(&self.readers_key).await?.is_empty() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(LatchError::Interrupted("write lock wait cancelled".to_string()));
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        return Err(LatchError::Connectivity("reader watch closed".to_string()));
                    }
                }
            }
        }
    }

    async fn release_mutex(&self) {
        if let Err(e) = self.mutex.release().await {
            tracing::error!(path = %self.mutex.key(), error = %e, "Failed to release write lock");
            self.alerter.alert(&format!(
                "Failed to release write lock {}: {}",
                self.mutex.key(),
                e
            ));
        }
    }
}

#[async_trait]
impl CheckableLocker for WriteSide {
    async fn acquire(&self) -> Result<()> {
        let guard = self.hold.enter(&self.cancel).await?;
        self.mutex.acquire().await?;
        if let Err(e) = self.wait_for_readers().await {
            tracing::warn!(path = %self.mutex.key(), error = %e, "Failed waiting for readers");
            self.release_mutex().await;
            return Err(e);
        }
        self.hold.hold(guard, self.store.as_ref());
        Ok(())
    }

    async fn release(&self) {
        self.release_mutex().await;
        self.hold.leave();
    }

    fn is_locked(&self) -> bool {
        self.hold.is_healthy()
    }
}
