//! The Queue port: five logical lists (`pending`, `high_priority`,
//! `processing`, `retry`, `failed`) on a shared KV broker.
//!
//! `enqueue`/`dequeue`/`mark_complete`/`mark_failed` are the only four
//! operations any caller needs; everything about retry classification and
//! dead-lettering happens inside `mark_failed` so callers never have to
//! reimplement the transient-keyword check themselves.

pub mod error;
pub mod job;
mod memory;
mod redis_backend;

use async_trait::async_trait;
use cp_base::RunId;

pub use error::QueueError;
pub use job::{JobRecord, QueueName, QueueStats, is_transient_error};
pub use memory::InMemoryQueue;
pub use redis_backend::RedisQueue;

pub type Result<T> = std::result::Result<T, QueueError>;

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Appends `job` to `jobs:high_priority` if `priority > 0`, else to
    /// `jobs:pending`.
    async fn enqueue(&self, job: JobRecord) -> Result<()>;

    /// Blocking multi-list pop in the order high_priority → retry →
    /// pending; the popped job is atomically moved into `processing`.
    async fn dequeue(&self, timeout: std::time::Duration) -> Result<Option<JobRecord>>;

    /// Removes the matching job from `processing`.
    async fn mark_complete(&self, run_id: RunId) -> Result<()>;

    /// Removes the job from `processing`, then re-enqueues to `retry`
    /// (transient error, under the retry cap) or to `failed` otherwise.
    async fn mark_failed(
        &self,
        run_id: RunId,
        error: &str,
        retry_count: u32,
        max_retries: u32,
    ) -> Result<()>;

    async fn stats(&self) -> Result<QueueStats>;

    /// All jobs currently parked in `processing`, for the reconciler loop
    /// to recover from a crashed worker.
    async fn processing_jobs(&self) -> Result<Vec<JobRecord>>;
}
