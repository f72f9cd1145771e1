use std::sync::Arc;

use async_trait::async_trait;

use latch_core::clock::Clock;
use latch_core::coordination::{AllHandlesUpdaterSync, UpdateStatus};
use latch_core::error::Result;
use latch_core::store::{key_join, CoordinationStore};

use crate::counter::DistributedCounter;

pub const UPDATE_ALL_HANDLES_KEY: &str = "updateAllHandles";

/// [`AllHandlesUpdaterSync`] over five shared counters under
/// `updateAllHandles/`. `inProgress` holds 0 or 1.
pub struct StoreAllHandlesUpdaterSync {
    clock: Arc<dyn Clock>,
    in_progress: DistributedCounter,
    progress_count: DistributedCounter,
    exception_count: DistributedCounter,
    total_count: DistributedCounter,
    start_time: DistributedCounter,
}

impl StoreAllHandlesUpdaterSync {
    pub fn new(store: Arc<dyn CoordinationStore>, clock: Arc<dyn Clock>) -> Self {
        let counter = |name: &str| {
            DistributedCounter::new(store.clone(), key_join(&[UPDATE_ALL_HANDLES_KEY, name]))
        };
        Self {
            clock,
            in_progress: counter("inProgress"),
            progress_count: counter("progressCount"),
            exception_count: counter("exceptionCount"),
            total_count: counter("totalCount"),
            start_time: counter("startTime"),
        }
    }

    async fn try_claim(&self) -> Result<bool> {
        loop {
            let current = self.in_progress.get().await?;
            if current == 1 {
                return Ok(true);
            }
            if self.in_progress.compare_and_set(current, 1).await? {
                return Ok(false);
            }
        }
    }
}

#[async_trait]
impl AllHandlesUpdaterSync for StoreAllHandlesUpdaterSync {
    async fn get_and_set_in_progress(&self) -> bool {
        match self.try_claim().await {
            Ok(was_running) => was_running,
            Err(e) => {
                tracing::error!(error = %e, "Failed to claim all handles update");
                true
            }
        }
    }

    async fn init_update(&self) -> Result<()> {
        self.start_time.force_set(self.clock.now_millis()).await?;
        self.exception_count.force_set(0).await?;
        self.progress_count.force_set(0).await?;
        self.total_count.force_set(0).await?;
        self.in_progress.force_set(1).await
    }

    async fn set_total_count(&self, count: i64) -> Result<()> {
        self.total_count.force_set(count).await
    }

    async fn clear_in_progress(&self) -> Result<()> {
        self.in_progress.force_set(0).await
    }

    async fn increment_progress_count(&self) -> Result<()> {
        self.progress_count.increment().await.map(|_| ())
    }

    async fn increment_exception_count(&self) -> Result<()> {
        self.exception_count.increment().await.map(|_| ())
    }

    async fn get_status(&self) -> Result<UpdateStatus> {
        Ok(UpdateStatus {
            in_progress: self.in_progress.get().await? == 1,
            total: self.total_count.get().await?,
            start_time: self.start_time.get().await?,
            progress: self.progress_count.get().await?,
            exception_count: self.exception_count.get().await?,
        })
    }
}
