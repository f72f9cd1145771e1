use std::sync::Arc;

use latch_core::error::{LatchError, Result};
use latch_core::store::CoordinationStore;

/// Integer stored as decimal text, updated by compare-and-set retry loops.
#[derive(Clone)]
pub struct DistributedCounter {
    store: Arc<dyn CoordinationStore>,
    key: String,
}

impl DistributedCounter {
    pub fn new(store: Arc<dyn CoordinationStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current value with its version; absent reads as `(0, None)`.
    async fn read(&self) -> Result<(i64, Option<u64>)> {
        match self.store.get(&self.key).await? {
            Some(v) => Ok((parse(&self.key, &v.value)?, Some(v.version))),
            None => Ok((0, None)),
        }
    }

    pub async fn get(&self) -> Result<i64> {
        Ok(self.read().await?.0)
    }

    /// Add `delta`, returning the value before the change.
    pub async fn add(&self, delta: i64) -> Result<i64> {
        loop {
            let (current, version) = self.read().await?;
            let next = (current + delta).to_string();
            if self
                .store
                .compare_and_set(&self.key, version, next.as_bytes())
                .await?
                .is_some()
            {
                return Ok(current);
            }
        }
    }

    pub async fn increment(&self) -> Result<i64> {
        self.add(1).await
    }

    /// Set to `value` only if currently `expected`. Returns whether it was set.
    pub async fn compare_and_set(&self, expected: i64, value: i64) -> Result<bool> {
        let (current, version) = self.read().await?;
        if current != expected {
            return Ok(false);
        }
        Ok(self
            .store
            .compare_and_set(&self.key, version, value.to_string().as_bytes())
            .await?
            .is_some())
    }

    pub async fn force_set(&self, value: i64) -> Result<()> {
        self.store
            .set(&self.key, value.to_string().as_bytes())
            .await?;
        Ok(())
    }
}

fn parse(key: &str, bytes: &[u8]) -> Result<i64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<i64>().ok())
        .ok_or_else(|| LatchError::Serialization(format!("counter {} is not an integer", key)))
}
