use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use latch_core::alert::Alerter;
use latch_core::coordination::NameLocker;
use latch_core::error::{LatchError, Result};
use latch_core::store::{key_join, CoordinationStore};

use super::monitor::ConnectionMonitor;
use super::mutex::StoreMutex;

/// Number of stripes names are hashed onto.
pub const STRIPE_COUNT: usize = 2048;

/// Stripe for `name`. Every node must agree on this function.
pub fn stripe_index(name: &str) -> usize {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    (smear(hash) as usize) % STRIPE_COUNT
}

fn smear(mut h: u32) -> u32 {
    h ^= (h >> 20) ^ (h >> 12);
    h ^ (h >> 7) ^ (h >> 4)
}

/// Admits lockers freely until a connection error is seen; the next
/// locker then waits for every held stripe to drain before clearing it.
struct ConnectionGate {
    monitor: ConnectionMonitor,
    holders: StdMutex<usize>,
    drained: Notify,
}

impl ConnectionGate {
    async fn enter(&self, stripes: usize, cancel: &CancellationToken) -> Result<()> {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            {
                let mut holders = self
                    .holders
                    .lock()
                    .map_err(|_| LatchError::Internal("stripe gate poisoned".to_string()))?;
                if !self.monitor.has_error() || *holders == 0 {
                    if self.monitor.clear() {
                        tracing::info!("Cleared connection error on name locker");
                    }
                    *holders += stripes;
                    return Ok(());
                }
            }

            tokio::select! {
                _ = &mut drained => {}
                _ = cancel.cancelled() => {
                    return Err(LatchError::Interrupted("name locker shut down".to_string()));
                }
            }
        }
    }

    fn leave(&self, stripes: usize) {
        if stripes == 0 {
            return;
        }
        if let Ok(mut holders) = self.holders.lock() {
            *holders = holders.saturating_sub(stripes);
            if *holders == 0 {
                self.drained.notify_waiters();
            }
        }
    }
}

/// Identity of the caller holding a stripe: the current tokio task, or
/// `None` when called outside any task.
type Holder = Option<tokio::task::Id>;

fn current_holder() -> Holder {
    tokio::task::try_id()
}

/// [`NameLocker`] over a fixed array of distributed mutexes at
/// `<path>/<stripe>`.
///
/// A stripe is released only by the task that locked it; a release from any
/// other caller is a no-op.
pub struct StripedNameLocker {
    path: String,
    stripes: Vec<StoreMutex>,
    holders: StdMutex<HashMap<usize, Holder>>,
    gate: ConnectionGate,
    alerter: Arc<dyn Alerter>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl StripedNameLocker {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        path: &str,
        alerter: Arc<dyn Alerter>,
        cancel: CancellationToken,
    ) -> Self {
        let stripes = (0..STRIPE_COUNT)
            .map(|i| StoreMutex::new(store.clone(), key_join(&[path, &i.to_string()]), cancel.clone()))
            .collect();
        Self {
            path: path.to_string(),
            stripes,
            holders: StdMutex::new(HashMap::new()),
            gate: ConnectionGate {
                monitor: ConnectionMonitor::spawn(store.as_ref()),
                holders: StdMutex::new(0),
                drained: Notify::new(),
            },
            alerter,
            cancel,
            shut_down: AtomicBool::new(false),
        }
    }

    /// Interrupt pending lock calls.
    pub fn shutdown(&self) {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            self.cancel.cancel();
        }
    }

    fn record_holder(&self, index: usize, holder: Holder) {
        if let Ok(mut holders) = self.holders.lock() {
            holders.insert(index, holder);
        }
    }

    /// Forget `holder`'s claim on a stripe, returning whether it had one.
    fn take_holder(&self, index: usize, holder: Holder) -> bool {
        match self.holders.lock() {
            Ok(mut holders) if holders.get(&index) == Some(&holder) => {
                holders.remove(&index);
                true
            }
            _ => false,
        }
    }

    /// Release one stripe held by `holder`, returning whether it was.
    async fn release_stripe(&self, index: usize, name: &str, holder: Holder) -> bool {
        if !self.take_holder(index, holder) {
            return false;
        }
        match self.stripes[index].release().await {
            Ok(held) => held,
            Err(e) => {
                tracing::error!(name = %name, stripe = index, error = %e, "Failed to release name lock");
                self.alerter.alert(&format!(
                    "Failed to release lock for {} stripe {} under {}: {}",
                    name, index, self.path, e
                ));
                true
            }
        }
    }
}

#[async_trait]
impl NameLocker for StripedNameLocker {
    async fn lock(&self, name: &str) -> Result<()> {
        self.gate.enter(1, &self.cancel).await?;
        let index = stripe_index(name);
        if let Err(e) = self.stripes[index].acquire().await {
            self.gate.leave(1);
            tracing::warn!(name = %name, stripe = index, error = %e, "Failed to acquire name lock");
            return Err(e);
        }
        self.record_holder(index, current_holder());
        Ok(())
    }

    async fn release(&self, name: &str) {
        let index = stripe_index(name);
        if self.release_stripe(index, name, current_holder()).await {
            self.gate.leave(1);
        } else {
            tracing::debug!(name = %name, stripe = index, "Release of unheld name lock");
        }
    }

    fn is_locked(&self, _name: &str) -> bool {
        !self.gate.monitor.has_error()
    }

    async fn lock_in_order(&self, names: &[String]) -> Result<()> {
        let indices: BTreeSet<usize> = names.iter().map(|n| stripe_index(n)).collect();
        self.gate.enter(indices.len(), &self.cancel).await?;

        let holder = current_holder();
        let mut acquired = Vec::with_capacity(indices.len());
        for &index in &indices {
            if let Err(e) = self.stripes[index].acquire().await {
                tracing::warn!(stripe = index, error = %e, "Failed to acquire name locks in order");
                for &held in acquired.iter().rev() {
                    self.release_stripe(held, "<batch>", holder).await;
                }
                self.gate.leave(indices.len());
                return Err(e);
            }
            self.record_holder(index, holder);
            acquired.push(index);
        }
        Ok(())
    }

    async fn release_all(&self, names: &[String]) {
        let holder = current_holder();
        let mut seen = BTreeSet::new();
        let mut released = 0;
        for name in names {
            let index = stripe_index(name);
            if seen.insert(index) && self.release_stripe(index, name, holder).await {
                released += 1;
            }
        }
        self.gate.leave(released);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryCluster;
    use latch_core::testing::RecordingAlerter;
    use std::time::Duration;

    fn locker(cluster: &MemoryCluster) -> Arc<StripedNameLocker> {
        Arc::new(StripedNameLocker::new(
            Arc::new(cluster.connect()),
            "locks/objects",
            Arc::new(RecordingAlerter::new()),
            CancellationToken::new(),
        ))
    }

    #[test]
    fn test_stripe_index_is_stable_and_bounded() {
        let a = stripe_index("test/obj-1");
        assert_eq!(a, stripe_index("test/obj-1"));
        assert!(a < STRIPE_COUNT);

        let spread: BTreeSet<usize> = (0..1000).map(|i| stripe_index(&format!("obj-{}", i))).collect();
        assert!(spread.len() > 700);
    }

    #[tokio::test]
    async fn test_release_of_unlocked_name_is_safe() {
        let cluster = MemoryCluster::new();
        let locker = locker(&cluster);
        locker.release("never-locked").await;
        locker.release_all(&["a".to_string(), "b".to_string()]).await;
        assert!(locker.is_locked("never-locked"));
    }

    #[tokio::test]
    async fn test_lock_excludes_other_node() {
        let cluster = MemoryCluster::new();
        let a = locker(&cluster);
        let b = locker(&cluster);

        a.lock("obj-1").await.unwrap();
        let handle = {
            let b = b.clone();
            tokio::spawn(async move {
                b.lock("obj-1").await?;
                b.release("obj-1").await;
                Result::Ok(())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        a.release("obj-1").await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_release_from_other_task_keeps_lock() {
        let cluster = MemoryCluster::new();
        let locker = locker(&cluster);
        locker.lock("obj-1").await.unwrap();

        let stranger = locker.clone();
        tokio::spawn(async move { stranger.release("obj-1").await })
            .await
            .unwrap();

        let second = {
            let locker = locker.clone();
            tokio::spawn(async move {
                locker.lock("obj-1").await?;
                locker.release("obj-1").await;
                Result::Ok(())
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!second.is_finished());

        locker.release("obj-1").await;
        tokio::time::timeout(Duration::from_secs(1), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_lock_in_order_overlapping_sets_complete() {
        let cluster = MemoryCluster::new();
        let a = locker(&cluster);
        let b = locker(&cluster);
        let forward: Vec<String> = (0..20).map(|i| format!("obj-{}", i)).collect();
        let backward: Vec<String> = forward.iter().rev().cloned().collect();

        let run = |locker: Arc<StripedNameLocker>, names: Vec<String>| {
            tokio::spawn(async move {
                for _ in 0..5 {
                    locker.lock_in_order(&names).await.unwrap();
                    tokio::task::yield_now().await;
                    locker.release_all(&names).await;
                }
            })
        };
        let first = run(a, forward);
        let second = run(b, backward);

        tokio::time::timeout(Duration::from_secs(10), async {
            first.await.unwrap();
            second.await.unwrap();
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_connection_error_waits_for_holders_then_clears() {
        let cluster = MemoryCluster::new();
        let store = Arc::new(cluster.connect());
        let locker = Arc::new(StripedNameLocker::new(
            store.clone(),
            "locks/objects",
            Arc::new(RecordingAlerter::new()),
            CancellationToken::new(),
        ));

        locker.lock("held").await.unwrap();
        store.suspend();
        for _ in 0..100 {
            if !locker.is_locked("held") {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!locker.is_locked("held"));
        store.resume();

        let next = {
            let locker = locker.clone();
            tokio::spawn(async move {
                locker.lock("other").await?;
                let healthy = locker.is_locked("other");
                locker.release("other").await;
                Result::Ok(healthy)
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!next.is_finished());

        locker.release("held").await;
        assert!(next.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_waiters() {
        let cluster = MemoryCluster::new();
        let a = locker(&cluster);
        let b = locker(&cluster);

        a.lock("obj-1").await.unwrap();
        let handle = {
            let b = b.clone();
            tokio::spawn(async move { b.lock("obj-1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        b.shutdown();
        assert!(matches!(
            handle.await.unwrap(),
            Err(LatchError::Interrupted(_))
        ));
    }
}
