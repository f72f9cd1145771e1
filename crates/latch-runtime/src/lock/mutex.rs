use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use latch_core::error::{LatchError, Result};
use latch_core::store::CoordinationStore;

/// Wait until the watched key is absent.
pub(crate) async fn wait_until_absent(
    rx: &mut watch::Receiver<Option<u64>>,
    cancel: &CancellationToken,
) -> Result<()> {
    loop {
        if rx.borrow_and_update().is_none() {
            return Ok(());
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(LatchError::Interrupted("lock wait cancelled".to_string()));
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    return Err(LatchError::Connectivity("key watch closed".to_string()));
                }
            }
        }
    }
}

/// Exclusive lock held as an ephemeral record at `key`.
///
/// Not reentrant: a second `acquire` through the same handle waits for the
/// first to be released.
pub struct StoreMutex {
    store: Arc<dyn CoordinationStore>,
    key: String,
    held: Mutex<Option<Held>>,
    cancel: CancellationToken,
}

/// The per-acquire token this handle stored as the record value.
#[derive(Debug, Clone)]
struct Held {
    token: String,
    /// A release reached the store and failed; the record may remain.
    release_failed: bool,
}

impl StoreMutex {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        key: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            held: Mutex::new(None),
            cancel,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_held(&self) -> bool {
        self.held_record().is_some()
    }

    pub async fn acquire(&self) -> Result<()> {
        // A record left behind by a failed release still blocks the key.
        if self.held_record().is_some_and(|h| h.release_failed) {
            self.release().await?;
        }

        let token = uuid::Uuid::new_v4().to_string();
        loop {
            if self.cancel.is_cancelled() {
                return Err(LatchError::Interrupted(format!(
                    "lock {} shut down",
                    self.key
                )));
            }

            let mut rx = self.store.watch(&self.key).await?;
            match self.store.create_ephemeral(&self.key, token.as_bytes()).await {
                Ok(version) => {
                    tracing::debug!(key = %self.key, version, "Lock acquired");
                    if let Ok(mut held) = self.held.lock() {
                        *held = Some(Held {
                            token,
                            release_failed: false,
                        });
                    }
                    return Ok(());
                }
                Err(LatchError::AlreadyExists(_)) => {
                    wait_until_absent(&mut rx, &self.cancel).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn held_record(&self) -> Option<Held> {
        self.held.lock().ok().and_then(|h| h.clone())
    }

    fn forget(&self) {
        if let Ok(mut held) = self.held.lock() {
            held.take();
        }
    }

    fn mark_release_failed(&self) {
        if let Ok(mut held) = self.held.lock() {
            if let Some(h) = held.as_mut() {
                h.release_failed = true;
            }
        }
    }

    /// Delete the lock record if this handle holds it. Returns whether a
    /// record was held.
    ///
    /// Only the record carrying this handle's token is deleted; a record
    /// recreated by another session after ours expired is left alone. On a
    /// store error the hold is kept so a later release can retry.
    pub async fn release(&self) -> Result<bool> {
        let Some(held) = self.held_record() else {
            return Ok(false);
        };

        match self.delete_owned(&held).await {
            Ok(()) => {}
            Err(LatchError::AlreadyGone(reason)) => {
                tracing::debug!(key = %self.key, %reason, "Lock record already gone at release");
            }
            Err(e) => {
                self.mark_release_failed();
                return Err(e);
            }
        }
        self.forget();
        Ok(true)
    }

    async fn delete_owned(&self, held: &Held) -> Result<()> {
        let current = self.store.get(&self.key).await?;
        match current {
            Some(record) if record.value == held.token.as_bytes() => {
                match self.store.delete(&self.key, Some(record.version)).await {
                    Ok(()) => Ok(()),
                    Err(LatchError::NotFound(_)) | Err(LatchError::VersionMismatch(_)) => Err(
                        LatchError::AlreadyGone(format!("{} changed during release", self.key)),
                    ),
                    Err(e) => Err(e),
                }
            }
            Some(_) => Err(LatchError::AlreadyGone(format!(
                "{} now belongs to another session",
                self.key
            ))),
            None => Err(LatchError::AlreadyGone(format!("{} expired", self.key))),
        }
    }
}
