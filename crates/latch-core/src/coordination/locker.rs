use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;

/// A single distributed lock whose holder can check it is still enforced.
#[async_trait]
pub trait CheckableLocker: Send + Sync {
    /// Block until the lock is held.
    async fn acquire(&self) -> Result<()>;

    /// Release the lock. Failures are logged and alerted, never returned.
    async fn release(&self);

    /// False once the connection to the store was disturbed while held.
    fn is_locked(&self) -> bool;
}

/// Read/write lock pair where at most one local task reads at a time.
pub trait ReadWriteLocker: Send + Sync {
    fn read_lock(&self) -> Arc<dyn CheckableLocker>;
    fn write_lock(&self) -> Arc<dyn CheckableLocker>;
}

/// Mutual exclusion keyed by name, approximated by a fixed set of stripes.
#[async_trait]
pub trait NameLocker: Send + Sync {
    /// Block until the stripe for `name` is held.
    async fn lock(&self, name: &str) -> Result<()>;

    /// Release the stripe for `name` if the calling task holds it. Safe on
    /// names never locked.
    async fn release(&self, name: &str);

    /// Reports connection health, not ownership.
    fn is_locked(&self, name: &str) -> bool;

    /// Acquire every stripe for `names` in ascending stripe order.
    async fn lock_in_order(&self, names: &[String]) -> Result<()>;

    /// Release every stripe for `names`, continuing past failures.
    async fn release_all(&self, names: &[String]);
}
