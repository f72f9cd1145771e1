use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use latch_core::coordination::MembershipListener;

/// Collapses bursts of membership events into one delayed callback.
/// Callbacks never overlap.
pub struct Debouncer {
    delay: Duration,
    scheduled: Arc<AtomicBool>,
    listener: StdMutex<Option<Arc<dyn MembershipListener>>>,
    run_lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            scheduled: Arc::new(AtomicBool::new(false)),
            listener: StdMutex::new(None),
            run_lock: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn set_listener(&self, listener: Arc<dyn MembershipListener>) {
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(listener);
        }
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().map(|l| l.is_some()).unwrap_or(false)
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::SeqCst)
    }

    /// Schedule the listener unless a run is already pending. Returns
    /// whether a run was scheduled by this call.
    pub fn schedule(&self) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        let Some(listener) = self.listener.lock().ok().and_then(|l| l.clone()) else {
            return false;
        };
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return false;
        }

        let delay = self.delay;
        let scheduled = self.scheduled.clone();
        let run_lock = self.run_lock.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
            let _running = run_lock.lock().await;
            scheduled.store(false, Ordering::SeqCst);
            tracing::debug!("Running membership change callback");
            listener.on_membership_change().await;
        });
        true
    }

    /// Drop pending runs; later calls to [`schedule`](Self::schedule) do nothing.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting() -> (Arc<AtomicUsize>, Arc<dyn MembershipListener>) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let listener: Arc<dyn MembershipListener> = Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, listener)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_run() {
        let debouncer = Debouncer::new(Duration::from_secs(10));
        let (count, listener) = counting();
        debouncer.set_listener(listener);

        assert!(debouncer.schedule());
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(!debouncer.schedule());
        }

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!debouncer.is_scheduled());

        assert!(debouncer.schedule());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_listener_no_schedule() {
        let debouncer = Debouncer::new(Duration::from_secs(10));
        assert!(!debouncer.schedule());
        assert!(!debouncer.is_scheduled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_pending_run() {
        let debouncer = Debouncer::new(Duration::from_secs(10));
        let (count, listener) = counting();
        debouncer.set_listener(listener);

        debouncer.schedule();
        debouncer.shutdown();
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
