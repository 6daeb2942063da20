use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use cp_base::RunId;
use tokio::sync::{Mutex, Notify};

use crate::job::{JobRecord, QueueName, QueueStats, is_transient_error};
use crate::{JobQueue, Result};

#[derive(Default)]
struct Lists {
    pending: VecDeque<JobRecord>,
    high_priority: VecDeque<JobRecord>,
    processing: VecDeque<JobRecord>,
    retry: VecDeque<JobRecord>,
    failed: VecDeque<JobRecord>,
}

/// In-memory reference implementation of [`JobQueue`], used by
/// `cp-orchestrator`'s tests and by anything exercising the end-to-end
/// scenarios without a live broker.
pub struct InMemoryQueue {
    lists: Mutex<Lists>,
    notify: Notify,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(Lists::default()),
            notify: Notify::new(),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryQueue {
    async fn enqueue(&self, job: JobRecord) -> Result<()> {
        let mut lists = self.lists.lock().await;
        if job.priority > 0 {
            lists.high_priority.push_back(job);
        } else {
            lists.pending.push_back(job);
        }
        drop(lists);
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<JobRecord>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut lists = self.lists.lock().await;
                let popped = lists
                    .high_priority
                    .pop_front()
                    .or_else(|| lists.retry.pop_front())
                    .or_else(|| lists.pending.pop_front());
                if let Some(job) = popped {
                    lists.processing.push_back(job.clone());
                    return Ok(Some(job));
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => return Ok(None),
            }
        }
    }

    async fn mark_complete(&self, run_id: RunId) -> Result<()> {
        let mut lists = self.lists.lock().await;
        if let Some(pos) = lists.processing.iter().position(|j| j.run_id == run_id) {
            lists.processing.remove(pos);
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
        let mut lists = self.lists.lock().await;
        let Some(pos) = lists.processing.iter().position(|j| j.run_id == run_id) else {
            return Ok(());
        };
        let mut job = lists.processing.remove(pos).expect("position just found");

        if retry_count < max_retries && is_transient_error(error) {
            job.retry_count = retry_count + 1;
            job.last_error = Some(error.to_string());
            job.retry_at = Some(chrono::Utc::now());
            lists.retry.push_back(job);
        } else {
            job.failed_at = Some(chrono::Utc::now());
            job.error = Some(error.to_string());
            job.retry_count = retry_count;
            lists.failed.push_back(job);
        }
        drop(lists);
        self.notify.notify_one();
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let lists = self.lists.lock().await;
        Ok(QueueStats {
            pending: lists.pending.len() as u64,
            high_priority: lists.high_priority.len() as u64,
            processing: lists.processing.len() as u64,
            retry: lists.retry.len() as u64,
            failed: lists.failed.len() as u64,
        })
    }

    async fn processing_jobs(&self) -> Result<Vec<JobRecord>> {
        Ok(self.lists.lock().await.processing.iter().cloned().collect())
    }
}

/// A single entry's logical queue, for assertions in tests that trace a
/// job through pending/retry/processing/failed.
pub fn queue_of(stats: &QueueStats, name: QueueName) -> u64 {
    match name {
        QueueName::Pending => stats.pending,
        QueueName::HighPriority => stats.high_priority,
        QueueName::Processing => stats.processing,
        QueueName::Retry => stats.retry,
        QueueName::Failed => stats.failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_base::RunId;

    #[tokio::test]
    async fn dequeue_prefers_high_priority_then_retry_then_pending() {
        let q = InMemoryQueue::new();
        let pending_job = JobRecord::new(RunId::new(), None, 0);
        let high_job = JobRecord::new(RunId::new(), None, 5);
        q.enqueue(pending_job.clone()).await.unwrap();
        q.enqueue(high_job.clone()).await.unwrap();

        let popped = q.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(popped.run_id, high_job.run_id);
    }

    #[tokio::test]
    async fn mark_complete_removes_from_processing() {
        let q = InMemoryQueue::new();
        let job = JobRecord::new(RunId::new(), None, 1);
        q.enqueue(job.clone()).await.unwrap();
        q.dequeue(Duration::from_millis(50)).await.unwrap();
        assert_eq!(q.stats().await.unwrap().processing, 1);

        q.mark_complete(job.run_id).await.unwrap();
        assert_eq!(q.stats().await.unwrap().processing, 0);
    }

    #[tokio::test]
    async fn transient_failure_goes_to_retry_then_succeeds() {
        let q = InMemoryQueue::new();
        let job = JobRecord::new(RunId::new(), None, 0);
        q.enqueue(job.clone()).await.unwrap();
        q.dequeue(Duration::from_millis(50)).await.unwrap();

        q.mark_failed(job.run_id, "ConnectionReset", 0, 3)
            .await
            .unwrap();
        let stats = q.stats().await.unwrap();
        assert_eq!(stats.retry, 1);
        assert_eq!(stats.processing, 0);

        let retried = q.dequeue(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(retried.retry_count, 1);
        q.mark_complete(retried.run_id).await.unwrap();
        assert_eq!(q.stats().await.unwrap().processing, 0);
    }

    #[tokio::test]
    async fn permanent_failure_goes_to_dead_letter() {
        let q = InMemoryQueue::new();
        let job = JobRecord::new(RunId::new(), None, 0);
        q.enqueue(job.clone()).await.unwrap();
        q.dequeue(Duration::from_millis(50)).await.unwrap();

        q.mark_failed(job.run_id, "invalid plan: missing phase", 0, 3)
            .await
            .unwrap();
        let stats = q.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retry, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_go_to_dead_letter_even_if_transient() {
        let q = InMemoryQueue::new();
        let job = JobRecord::new(RunId::new(), None, 0);
        q.enqueue(job.clone()).await.unwrap();
        q.dequeue(Duration::from_millis(50)).await.unwrap();

        q.mark_failed(job.run_id, "connection reset", 3, 3)
            .await
            .unwrap();
        assert_eq!(q.stats().await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let q = InMemoryQueue::new();
        let result = q.dequeue(Duration::from_millis(20)).await.unwrap();
        assert!(result.is_none());
    }
}
