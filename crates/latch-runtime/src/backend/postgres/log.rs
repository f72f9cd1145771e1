use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;

use latch_core::clock::Clock;
use latch_core::error::{LatchError, Result};
use latch_core::store::{
    partition_for, ConsumerOptions, DurableLog, LogConsumer, LogPosition, LogRecord, OffsetReset,
};

use super::pool::db_err;

/// Channel appends notify on, with the qualified topic as payload.
pub const LOG_CHANNEL: &str = "latch_log";

pub const DEFAULT_PARTITIONS: u32 = 3;

/// Upper bound on one wait when no notification arrives.
const WAKE_INTERVAL: Duration = Duration::from_millis(250);

/// Topics are stored as `<namespace>.<topic>`.
fn qualify(namespace: &str, topic: &str) -> String {
    format!("{}.{}", namespace, topic)
}

/// [`DurableLog`] on PostgreSQL tables. Offsets are allocated per
/// partition from `latch_log_heads` inside the append transaction.
pub struct PgDurableLog {
    pool: PgPool,
    namespace: String,
    clock: Arc<dyn Clock>,
    partitions: u32,
}

impl PgDurableLog {
    pub fn new(pool: PgPool, namespace: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            clock,
            partitions: DEFAULT_PARTITIONS,
        }
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions.max(1);
        self
    }

    async fn head(&self, topic: &str, partition: u32) -> Result<u64> {
        let head: Option<i64> = sqlx::query_scalar(
            "SELECT next_offset FROM latch_log_heads WHERE topic = $1 AND partition = $2",
        )
        .bind(topic)
        .bind(partition as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(head.unwrap_or(0) as u64)
    }
}

async fn committed_offset(
    pool: &PgPool,
    topic: &str,
    group: &str,
    partition: u32,
) -> Result<Option<u64>> {
    let offset: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT next_offset FROM latch_log_offsets
        WHERE topic = $1 AND group_name = $2 AND partition = $3
        "#,
    )
    .bind(topic)
    .bind(group)
    .bind(partition as i32)
    .fetch_optional(pool)
    .await
    .map_err(db_err)?;
    Ok(offset.map(|o| o as u64))
}

#[async_trait]
impl DurableLog for PgDurableLog {
    async fn append(&self, topic: &str, key: &str, payload: &[u8]) -> Result<LogPosition> {
        let topic = qualify(&self.namespace, topic);
        let partition = partition_for(key, self.partitions);
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let next: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO latch_log_heads (topic, partition, next_offset)
            VALUES ($1, $2, 1)
            ON CONFLICT (topic, partition) DO UPDATE
            SET next_offset = latch_log_heads.next_offset + 1
            RETURNING next_offset
            "#,
        )
        .bind(&topic)
        .bind(partition as i32)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let offset = next - 1;

        sqlx::query(
            r#"
            INSERT INTO latch_log_records (topic, partition, "offset", key, payload, appended_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(&topic)
        .bind(partition as i32)
        .bind(offset)
        .bind(key)
        .bind(payload)
        .bind(self.clock.now_millis())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(LOG_CHANNEL)
            .bind(&topic)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(LogPosition {
            partition,
            offset: offset as u64,
        })
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        options: ConsumerOptions,
    ) -> Result<Box<dyn LogConsumer>> {
        let topic = qualify(&self.namespace, topic);
        let mut positions = Vec::with_capacity(self.partitions as usize);
        for partition in 0..self.partitions {
            let position = match committed_offset(&self.pool, &topic, group, partition).await? {
                Some(offset) => offset,
                None => match options.reset {
                    OffsetReset::Earliest => 0,
                    OffsetReset::Latest => self.head(&topic, partition).await?,
                },
            };
            positions.push(position);
        }

        let listener = async {
            let mut listener = PgListener::connect_with(&self.pool).await?;
            listener.listen(LOG_CHANNEL).await?;
            Ok::<_, sqlx::Error>(listener)
        };
        let listener = match listener.await {
            Ok(listener) => Some(listener),
            Err(e) => {
                tracing::warn!(error = %e, "Log consumer falling back to polling");
                None
            }
        };

        tracing::debug!(topic = %topic, group, ?positions, "Log consumer subscribed");
        Ok(Box::new(PgLogConsumer {
            pool: self.pool.clone(),
            topic,
            group: group.to_string(),
            positions,
            max_poll_records: options.max_poll_records.max(1),
            listener,
        }))
    }

    async fn close(&self) -> Result<()> {
        tracing::debug!(namespace = %self.namespace, "Durable log closed");
        Ok(())
    }
}

pub struct PgLogConsumer {
    pool: PgPool,
    topic: String,
    group: String,
    positions: Vec<u64>,
    max_poll_records: usize,
    listener: Option<PgListener>,
}

impl PgLogConsumer {
    async fn fetch(&mut self) -> Result<Vec<LogRecord>> {
        let mut records = Vec::new();
        for partition in 0..self.positions.len() {
            let remaining = self.max_poll_records - records.len();
            if remaining == 0 {
                break;
            }
            let rows: Vec<(i64, i64, String, Vec<u8>)> = sqlx::query_as(
                r#"
                SELECT "offset", appended_at, key, payload
                FROM latch_log_records
                WHERE topic = $1 AND partition = $2 AND "offset" >= $3
                ORDER BY "offset"
                LIMIT $4
                "#,
            )
            .bind(&self.topic)
            .bind(partition as i32)
            .bind(self.positions[partition] as i64)
            .bind(remaining as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            if let Some((last, ..)) = rows.last() {
                self.positions[partition] = *last as u64 + 1;
            }
            records.extend(rows.into_iter().map(|(offset, timestamp, key, payload)| LogRecord {
                partition: partition as u32,
                offset: offset as u64,
                timestamp,
                key,
                payload,
            }));
        }
        Ok(records)
    }

    fn check_partition(&self, partition: u32) -> Result<usize> {
        let index = partition as usize;
        if index >= self.positions.len() {
            return Err(LatchError::InvalidArgument(format!(
                "partition {} out of range for {}",
                partition, self.topic
            )));
        }
        Ok(index)
    }
}

#[async_trait]
impl LogConsumer for PgLogConsumer {
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<LogRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let records = self.fetch().await?;
            if !records.is_empty() {
                return Ok(records);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(records);
            }
            let wait = (deadline - now).min(WAKE_INTERVAL);
            match self.listener.as_mut() {
                Some(listener) => {
                    if let Ok(Err(e)) = tokio::time::timeout(wait, listener.recv()).await {
                        tracing::debug!(error = %e, "Log notification error");
                        tokio::time::sleep(wait).await;
                    }
                }
                None => tokio::time::sleep(wait).await,
            }
        }
    }

    async fn commit(&mut self, partition: u32, next_offset: u64) -> Result<()> {
        self.check_partition(partition)?;
        sqlx::query(
            r#"
            INSERT INTO latch_log_offsets (topic, group_name, partition, next_offset)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (topic, group_name, partition) DO UPDATE
            SET next_offset = EXCLUDED.next_offset, updated_at = NOW()
            "#,
        )
        .bind(&self.topic)
        .bind(&self.group)
        .bind(partition as i32)
        .bind(next_offset as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn seek(&mut self, partition: u32, offset: u64) -> Result<()> {
        let index = self.check_partition(partition)?;
        self.positions[index] = offset;
        Ok(())
    }

    async fn committed(&self, partition: u32) -> Result<Option<u64>> {
        self.check_partition(partition)?;
        committed_offset(&self.pool, &self.topic, &self.group, partition).await
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut listener) = self.listener.take() {
            if let Err(e) = listener.unlisten_all().await {
                tracing::debug!(error = %e, "Failed to unlisten log channel");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latch_core::clock::SystemClock;

    #[test]
    fn test_qualify_topic() {
        assert_eq!(qualify("latch", "LatchSignals"), "latch.LatchSignals");
    }

    #[tokio::test]
    async fn test_live_append_and_resume_from_commit() {
        let Ok(url) = std::env::var("LATCH_TEST_DATABASE_URL") else {
            return;
        };
        let pool = PgPool::connect(&url).await.unwrap();
        crate::backend::postgres::MigrationRunner::new(pool.clone())
            .run()
            .await
            .unwrap();
        let namespace = format!("test{}", uuid::Uuid::new_v4().simple());
        let log = PgDurableLog::new(pool, namespace, Arc::new(SystemClock)).with_partitions(1);

        log.append("t", "a", b"1").await.unwrap();
        log.append("t", "b", b"2").await.unwrap();

        let mut consumer = log
            .subscribe("t", "g", ConsumerOptions::new(OffsetReset::Earliest))
            .await
            .unwrap();
        let records = consumer.poll(Duration::from_millis(100)).await.unwrap();
        assert_eq!(records.len(), 2);
        consumer.commit(0, 1).await.unwrap();
        consumer.close().await.unwrap();

        let mut consumer = log
            .subscribe("t", "g", ConsumerOptions::new(OffsetReset::Earliest))
            .await
            .unwrap();
        let records = consumer.poll(Duration::from_millis(100)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, b"2");
    }
}
