use std::time::Duration;

use cp_base::{Provider, SubtaskId};
use serde_json::Value;

/// A subtask as handed to [`crate::driver::RunDriver::ingest_subtasks`] by
/// whatever produced the plan breakdown (the Model Client integration,
/// out of scope here). Mirrors [`cp_store::Subtask`]'s fields that the
/// planner actually chooses; the driver fills in state/attempt bookkeeping.
#[derive(Debug, Clone)]
pub struct NewSubtask {
    pub subtask_index: u32,
    pub task_type: String,
    pub dependencies: Vec<SubtaskId>,
    pub input: Value,
}

/// Token usage reported by whatever executed a subtask's model calls, fed
/// into the Billing Ledger by [`crate::driver::RunDriver::complete_subtask`].
#[derive(Debug, Clone)]
pub struct TokenUsage {
    pub model: String,
    pub provider: Provider,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub idempotency_key: String,
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// TTL of a fencing-token lease acquired for one driver pass over a run.
    pub lease_ttl: Duration,
    /// How long `dequeue` blocks waiting for a job before returning `None`.
    pub dequeue_timeout: Duration,
    /// Maximum subtask retry attempts before a subtask fails permanently.
    pub max_subtask_retries: u32,
    /// A run with no state change in this long is a candidate for the
    /// stalled-run sweep (`get_stalled_runs`).
    pub stall_threshold: Duration,
    /// Sandbox template used when a subtask's `task_type` names no
    /// dedicated one.
    pub default_template: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(60),
            dequeue_timeout: Duration::from_secs(5),
            max_subtask_retries: 3,
            stall_threshold: Duration::from_secs(300),
            default_template: "base".to_string(),
        }
    }
}
