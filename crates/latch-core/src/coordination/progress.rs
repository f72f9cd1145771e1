use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Snapshot of the cluster-wide batch job counters. May be stale.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub in_progress: bool,
    pub total: i64,
    pub start_time: i64,
    pub progress: i64,
    pub exception_count: i64,
}

/// Single-flight gate and progress counters for one long batch job.
#[async_trait]
pub trait AllHandlesUpdaterSync: Send + Sync {
    /// Whether the job was already running. Only one caller across the
    /// cluster observes `false` until `clear_in_progress`.
    async fn get_and_set_in_progress(&self) -> bool;

    async fn init_update(&self) -> Result<()>;

    async fn set_total_count(&self, count: i64) -> Result<()>;

    async fn clear_in_progress(&self) -> Result<()>;

    async fn increment_progress_count(&self) -> Result<()>;

    async fn increment_exception_count(&self) -> Result<()>;

    async fn get_status(&self) -> Result<UpdateStatus>;
}
