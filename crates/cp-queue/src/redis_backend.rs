use std::time::Duration;

use async_trait::async_trait;
use cp_base::RunId;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::job::{JobRecord, QueueName, QueueStats, is_transient_error};
use crate::{JobQueue, QueueError, Result};

/// Redis-backed [`JobQueue`], the production broker. Holds a single
/// multiplexed [`ConnectionManager`]
/// (reconnects transparently on drop) rather than a pool, matching the
/// single-shared-client shape of the enrichment crate's warm client.
pub struct RedisQueue {
    conn: ConnectionManager,
}

impl RedisQueue {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(QueueError::from)?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(QueueError::from)?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(&self, job: JobRecord) -> Result<()> {
        let queue = if job.priority > 0 {
            QueueName::HighPriority
        } else {
            QueueName::Pending
        };
        let payload = serde_json::to_string(&job)?;
        let mut conn = self.conn();
        let _: () = conn.lpush(queue.key(), payload).await.map_err(QueueError::from)?;
        tracing::info!(run_id = %job.run_id, queue = queue.key(), "enqueued job");
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobRecord>> {
        let mut conn = self.conn();
        let timeout_secs = timeout.as_secs_f64().max(0.0);
        let result: Option<(String, String)> = conn
            .brpop(
                [
                    QueueName::HighPriority.key(),
                    QueueName::Retry.key(),
                    QueueName::Pending.key(),
                ]
                .as_slice(),
                timeout_secs,
            )
            .await
            .map_err(QueueError::from)?;

        let Some((source_queue, payload)) = result else {
            return Ok(None);
        };
        let job: JobRecord = serde_json::from_str(&payload)?;
        let _: () = conn
            .lpush(QueueName::Processing.key(), &payload)
            .await
            .map_err(QueueError::from)?;
        tracing::info!(run_id = %job.run_id, from = %source_queue, "dequeued job");
        Ok(Some(job))
    }

    async fn mark_complete(&self, run_id: RunId) -> Result<()> {
        let mut conn = self.conn();
        if let Some(payload) = find_in_processing(&mut conn, run_id).await? {
            let _: () = conn
                .lrem(QueueName::Processing.key(), 1, payload)
                .await
                .map_err(QueueError::from)?;
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        run_id: RunId,
        error: &str,
        retry_count: u32,
        max_retries: u32,
    ) -> Result<()> {
        let mut conn = self.conn();
        let Some(payload) = find_in_processing(&mut conn, run_id).await? else {
            return Ok(());
        };
        let _: () = conn
            .lrem(QueueName::Processing.key(), 1, &payload)
            .await
            .map_err(QueueError::from)?;

        let mut job: JobRecord = serde_json::from_str(&payload)?;
        let destination = if retry_count < max_retries && is_transient_error(error) {
            job.retry_count = retry_count + 1;
            job.last_error = Some(error.to_string());
            job.retry_at = Some(chrono::Utc::now());
            QueueName::Retry
        } else {
            job.failed_at = Some(chrono::Utc::now());
            job.error = Some(error.to_string());
            job.retry_count = retry_count;
            QueueName::Failed
        };
        let updated = serde_json::to_string(&job)?;
        let _: () = conn
            .lpush(destination.key(), updated)
            .await
            .map_err(QueueError::from)?;
        tracing::warn!(%run_id, destination = destination.key(), error, "job failed");
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn();
        Ok(QueueStats {
            pending: conn.llen(QueueName::Pending.key()).await.map_err(QueueError::from)?,
            high_priority: conn
                .llen(QueueName::HighPriority.key())
                .await
                .map_err(QueueError::from)?,
            processing: conn
                .llen(QueueName::Processing.key())
                .await
                .map_err(QueueError::from)?,
            retry: conn.llen(QueueName::Retry.key()).await.map_err(QueueError::from)?,
            failed: conn.llen(QueueName::Failed.key()).await.map_err(QueueError::from)?,
        })
    }

    async fn processing_jobs(&self) -> Result<Vec<JobRecord>> {
        let mut conn = self.conn();
        let raw: Vec<String> = conn
            .lrange(QueueName::Processing.key(), 0, -1)
            .await
            .map_err(QueueError::from)?;
        raw.iter()
            .map(|p| serde_json::from_str(p).map_err(QueueError::from))
            .collect()
    }
}

async fn find_in_processing(conn: &mut ConnectionManager, run_id: RunId) -> Result<Option<String>> {
    let raw: Vec<String> = conn
        .lrange(QueueName::Processing.key(), 0, -1)
        .await
        .map_err(QueueError::from)?;
    for payload in raw {
        if let Ok(job) = serde_json::from_str::<JobRecord>(&payload) {
            if job.run_id == run_id {
                return Ok(Some(payload));
            }
        }
    }
    Ok(None)
}
