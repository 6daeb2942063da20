//! Maps a subtask and its run to a [`SchedulingDecision`]: which queue it
//! goes to, at what priority, after what delay, and with what worker
//! affinity.
//!
//! This crate is a pure function over `(Subtask, Run)` plus a small
//! config struct; it never touches the queue or the store directly —
//! callers (the orchestrator) pass the decision on to `cp-queue`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use cp_base::RunId;
use cp_store::{Run, Subtask};

/// Static queue map keyed by `task_type`.
fn queue_for_task_type(task_type: &str) -> &'static str {
    match task_type {
        "entity_research" | "dimension_analysis" | "source_research" | "research" => {
            "workers.research"
        }
        "synthesis" => "workers.synthesis",
        "web_search" => "workers.search",
        "code_execution" | "shell" => "workers.code",
        "browser" => "workers.browser",
        _ => "workers.subtask",
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub default_priority: i32,
    pub max_priority: i32,
    pub base_retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            default_priority: 5,
            max_priority: 10,
            base_retry_delay: Duration::from_secs(30),
            max_retry_delay: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulingDecision {
    pub run_id: RunId,
    pub queue_name: &'static str,
    pub priority: i32,
    pub delay: Duration,
    pub worker_affinity: Option<String>,
}

pub struct Scheduler {
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn schedule(&self, subtask: &Subtask, run: &Run, now: DateTime<Utc>) -> SchedulingDecision {
        SchedulingDecision {
            run_id: run.id,
            queue_name: queue_for_task_type(&subtask.task_type),
            priority: self.priority(subtask, run, now),
            delay: self.delay(subtask),
            worker_affinity: worker_affinity(subtask),
        }
    }

    /// Base priority from run config, bumped for an approaching deadline
    /// and for synthesis subtasks, penalized for retries, clamped to
    /// `[1, max_priority]`.
    fn priority(&self, subtask: &Subtask, run: &Run, now: DateTime<Utc>) -> i32 {
        let mut priority = if run.priority > 0 {
            run.priority as i32
        } else {
            self.config.default_priority
        };

        if let Some(deadline) = run.deadline_at {
            if deadline > now {
                let remaining = deadline - now;
                if remaining < chrono::Duration::minutes(10) {
                    priority = (priority + 3).min(self.config.max_priority);
                } else if remaining < chrono::Duration::minutes(30) {
                    priority = (priority + 1).min(self.config.max_priority);
                }
            }
        }

        if subtask.attempt_count > 0 {
            priority = (priority - 1).max(1);
        }

        if subtask.task_type == "synthesis" {
            priority = (priority + 2).min(self.config.max_priority);
        }

        priority.clamp(1, self.config.max_priority)
    }

    /// Exponential backoff `base * 2^(attempt-1)`, capped at
    /// `max_retry_delay`. Zero for a first attempt.
    fn delay(&self, subtask: &Subtask) -> Duration {
        if subtask.attempt_count == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(subtask.attempt_count - 1).unwrap_or(u32::MAX);
        let scaled = self.config.base_retry_delay.saturating_mul(factor);
        scaled.min(self.config.max_retry_delay)
    }
}

/// Affinity equals the previously-assigned worker when a `checkpoint_id`
/// exists, so a resumed subtask lands back on the worker holding its
/// checkpoint state.
fn worker_affinity(subtask: &Subtask) -> Option<String> {
    match (&subtask.checkpoint_id, &subtask.assigned_worker_id) {
        (Some(_), Some(worker_id)) => Some(worker_id.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_base::{OrgId, SubtaskId, UserId};
    use cp_store::{Plan, RunState, SubtaskState};

    fn base_run() -> Run {
        Run {
            id: RunId::new(),
            user_id: UserId::new(),
            org_id: OrgId::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            state: RunState::Executing,
            state_version: 1,
            fencing_token: None,
            token_expires_at: None,
            plan: Plan::default(),
            current_phase_number: 0,
            error: None,
            completed_at: None,
            worker_id: None,
            deadline_at: None,
            priority: 5,
        }
    }

    fn base_subtask(task_type: &str) -> Subtask {
        Subtask {
            id: SubtaskId::new(),
            run_id: RunId::new(),
            subtask_index: 0,
            task_type: task_type.to_string(),
            state: SubtaskState::Pending,
            state_version: 0,
            attempt_count: 0,
            assigned_worker_id: None,
            checkpoint_id: None,
            dependencies: vec![],
            input: serde_json::Value::Null,
            output: None,
        }
    }

    #[test]
    fn unknown_task_type_maps_to_default_queue() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let decision = scheduler.schedule(&base_subtask("shell"), &base_run(), Utc::now());
        assert_eq!(decision.queue_name, "workers.code");

        let decision = scheduler.schedule(&base_subtask("anything_else"), &base_run(), Utc::now());
        assert_eq!(decision.queue_name, "workers.subtask");
    }

    #[test]
    fn deadline_within_ten_minutes_bumps_priority_by_three() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let now = Utc::now();
        let mut run = base_run();
        run.deadline_at = Some(now + chrono::Duration::minutes(5));

        let decision = scheduler.schedule(&base_subtask("research"), &run, now);
        assert_eq!(decision.priority, 8);
    }

    #[test]
    fn deadline_within_thirty_minutes_bumps_priority_by_one() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let now = Utc::now();
        let mut run = base_run();
        run.deadline_at = Some(now + chrono::Duration::minutes(20));

        let decision = scheduler.schedule(&base_subtask("research"), &run, now);
        assert_eq!(decision.priority, 6);
    }

    #[test]
    fn retry_lowers_priority_by_one() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let mut subtask = base_subtask("research");
        subtask.attempt_count = 1;

        let decision = scheduler.schedule(&subtask, &base_run(), Utc::now());
        assert_eq!(decision.priority, 4);
    }

    #[test]
    fn synthesis_subtasks_get_a_boost_clamped_to_max() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let mut run = base_run();
        run.priority = 10;
        let decision = scheduler.schedule(&base_subtask("synthesis"), &run, Utc::now());
        assert_eq!(decision.priority, 10);
    }

    #[test]
    fn retry_delay_is_exponential_and_capped() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let mut subtask = base_subtask("research");

        subtask.attempt_count = 0;
        assert_eq!(scheduler.delay(&subtask), Duration::ZERO);

        subtask.attempt_count = 1;
        assert_eq!(scheduler.delay(&subtask), Duration::from_secs(30));

        subtask.attempt_count = 2;
        assert_eq!(scheduler.delay(&subtask), Duration::from_secs(60));

        subtask.attempt_count = 5;
        assert_eq!(scheduler.delay(&subtask), Duration::from_secs(300));
    }

    #[test]
    fn worker_affinity_requires_both_checkpoint_and_worker_id() {
        let scheduler = Scheduler::new(SchedulerConfig::default());
        let mut subtask = base_subtask("research");
        subtask.checkpoint_id = Some("chk-1".to_string());
        subtask.assigned_worker_id = Some("worker-7".to_string());

        let decision = scheduler.schedule(&subtask, &base_run(), Utc::now());
        assert_eq!(decision.worker_affinity, Some("worker-7".to_string()));

        subtask.checkpoint_id = None;
        let decision = scheduler.schedule(&subtask, &base_run(), Utc::now());
        assert_eq!(decision.worker_affinity, None);
    }
}
