use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use latch_core::clock::{Clock, SystemClock};
use latch_core::error::{LatchError, Result};
use latch_core::store::{
    partition_for, ConsumerOptions, DurableLog, LogConsumer, LogPosition, LogRecord, OffsetReset,
};

/// Default partition count per topic.
pub const DEFAULT_PARTITIONS: u32 = 3;

#[derive(Default)]
struct LogData {
    topics: HashMap<String, Vec<Vec<LogRecord>>>,
    /// Committed offsets keyed by `(topic, group, partition)`.
    offsets: HashMap<(String, String, u32), u64>,
}

impl LogData {
    fn topic_mut(&mut self, topic: &str, partitions: u32) -> &mut Vec<Vec<LogRecord>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions as usize])
    }
}

struct Shared {
    data: Mutex<LogData>,
    appended: Notify,
    available: AtomicBool,
    partitions: u32,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LogData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LatchError::Connectivity("log broker unavailable".to_string()))
        }
    }
}

/// Partitioned in-process log with consumer-group offsets.
#[derive(Clone)]
pub struct MemoryLog {
    shared: Arc<Shared>,
}

impl MemoryLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_partitions(clock, DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(clock: Arc<dyn Clock>, partitions: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                data: Mutex::new(LogData::default()),
                appended: Notify::new(),
                available: AtomicBool::new(true),
                partitions: partitions.max(1),
                clock,
            }),
        }
    }

    /// Toggle broker availability; appends and polls fail while unavailable.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    pub fn committed_offset(&self, topic: &str, group: &str, partition: u32) -> Option<u64> {
        self.shared
            .lock()
            .offsets
            .get(&(topic.to_string(), group.to_string(), partition))
            .copied()
    }

    /// Total records appended to `topic`.
    pub fn record_count(&self, topic: &str) -> usize {
        self.shared
            .lock()
            .topics
            .get(topic)
            .map(|parts| parts.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn append(&self, topic: &str, key: &str, payload: &[u8]) -> Result<LogPosition> {
        self.shared.check_available()?;
        let partition = partition_for(key, self.shared.partitions);
        let timestamp = self.shared.clock.now_millis();
        let position = {
            let mut data = self.shared.lock();
            let records = &mut data.topic_mut(topic, self.shared.partitions)[partition as usize];
            let offset = records.len() as u64;
            records.push(LogRecord {
                partition,
                offset,
                timestamp,
                key: key.to_string(),
                payload: payload.to_vec(),
            });
            LogPosition { partition, offset }
        };
        self.shared.appended.notify_waiters();
        Ok(position)
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn LogConsumer>> {
        self.shared.check_available()?;
        let positions = {
            let mut data = self.shared.lock();
            let lengths: Vec<u64> = data
                .topic_mut(topic, self.shared.partitions)
                .iter()
                .map(|records| records.len() as u64)
                .collect();
            lengths
                .iter()
                .enumerate()
                .map(|(partition, len)| {
                    let key = (topic.to_string(), group.to_string(), partition as u32);
                    match (data.offsets.get(&key), options.reset) {
                        (Some(committed), _) => *committed,
                        (None, OffsetReset::Earliest) => 0,
                        (None, OffsetReset::Latest) => *len,
                    }
                })
                .collect()
        };
        Ok(Box::new(MemoryLogConsumer {
            shared: self.shared.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            positions,
            max_poll_records: options.max_poll_records.max(1),
        }))
    }

    async fn close(&self) -> Result<()> {
        self.shared.appended.notify_waiters();
        Ok(())
    }
}

struct MemoryLogConsumer {
    shared: Arc<Shared>,
    topic: String,
    group: String,
    positions: Vec<u64>,
    max_poll_records: usize,
}

impl MemoryLogConsumer {
    fn drain(&mut self) -> Vec<LogRecord> {
        let data = self.shared.lock();
        let Some(partitions) = data.topics.get(&self.topic) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (partition, records) in partitions.iter().enumerate() {
            let position = self.positions[partition] as usize;
            for record in records.iter().skip(position) {
                if out.len() >= self.max_poll_records {
                    break;
                }
                out.push(record.clone());
            }
        }
        for record in &out {
            self.positions[record.partition as usize] = record.offset + 1;
        }
        out
    }

    fn check_partition(&self, partition: u32) -> Result<()> {
        if (partition as usize) < self.positions.len() {
            Ok(())
        } else {
            Err(LatchError::InvalidArgument(format!(
                "partition {} out of range for {}",
                partition, self.topic
            )))
        }
    }
}

#[async_trait]
impl LogConsumer for MemoryLogConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<LogRecord>> {
        self.shared.check_available()?;
        let deadline = tokio::time::Instant::now() + timeout;
        let shared = self.shared.clone();
        loop {
            let notified = shared.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let records = self.drain();
            if !records.is_empty() {
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&mut self, partition: u32, next_offset: u64) -> Result<()> {
        self.shared.check_available()?;
        self.check_partition(partition)?;
        self.shared.lock().offsets.insert(
            (self.topic.clone(), self.group.clone(), partition),
            next_offset,
        );
        Ok(())
    }

    async fn seek(&mut self, partition: u32, offset: u64) -> Result<()> {
        self.check_partition(partition)?;
        self.positions[partition as usize] = offset;
        Ok(())
    }

    async fn committed(&self, partition: u32) -> Result<Option<u64>> {
        Ok(self
            .shared
            .lock()
            .offsets
            .get(&(self.topic.clone(), self.group.clone(), partition))
            .copied())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
