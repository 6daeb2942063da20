use chrono::{DateTime, Utc};
use cp_base::{RunId, SubtaskId};
use serde::{Deserialize, Serialize};

/// The five logical lists a job moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Pending,
    HighPriority,
    Processing,
    Retry,
    Failed,
}

impl QueueName {
    /// The broker key under which this list lives (`jobs:pending`, ...).
    pub fn key(&self) -> &'static str {
        match self {
            QueueName::Pending => "jobs:pending",
            QueueName::HighPriority => "jobs:high_priority",
            QueueName::Processing => "jobs:processing",
            QueueName::Retry => "jobs:retry",
            QueueName::Failed => "jobs:failed",
        }
    }
}

/// A queued unit of work. The reconciler actually recovers `Subtask` rows
/// (the only entity with a `queued` state), so this record carries both
/// the owning run and the subtask, with `run_id` kept as its own field so
/// a reconciler can filter by run without deserializing the subtask.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub run_id: RunId,
    pub subtask_id: Option<SubtaskId>,
    pub enqueued_at: DateTime<Utc>,
    pub priority: i32,
    pub retry_count: u32,
    pub retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl JobRecord {
    pub fn new(run_id: RunId, subtask_id: Option<SubtaskId>, priority: i32) -> Self {
        Self {
            run_id,
            subtask_id,
            enqueued_at: Utc::now(),
            priority,
            retry_count: 0,
            retry_at: None,
            last_error: None,
            failed_at: None,
            error: None,
        }
    }
}

/// Depth of each list, for monitoring and for detecting a stuck queue.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub high_priority: u64,
    pub processing: u64,
    pub retry: u64,
    pub failed: u64,
}

/// The closed keyword set deciding whether a failure is
/// retried or sent straight to the dead-letter queue.
pub const TRANSIENT_ERROR_KEYWORDS: &[&str] = &[
    "timeout",
    "connection",
    "unavailable",
    "rate limit",
    "temporarily",
    "502",
    "503",
    "504",
];

pub fn is_transient_error(error: &str) -> bool {
    let lower = error.to_lowercase();
    TRANSIENT_ERROR_KEYWORDS
        .iter()
        .any(|keyword| lower.contains(keyword))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_keywords_match() {
        assert!(is_transient_error("Connection reset by peer"));
        assert!(is_transient_error("upstream returned 503"));
        assert!(!is_transient_error("invalid plan: missing phase"));
    }
}
