use std::time::{Duration, Instant};

use cp_base::{RunId, SandboxId};

/// Sandbox lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxState {
    Warming,
    Ready,
    Assigned,
    Busy,
    Draining,
    Terminated,
}

/// Running resource metrics, updated on each execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxMetrics {
    pub cpu_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_peak_bytes: u64,
    pub disk_used_bytes: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub execution_count: u64,
    pub last_exit_code: Option<i32>,
    pub consecutive_health_failures: u32,
}

impl SandboxMetrics {
    /// A sandbox goes unhealthy after N consecutive health-check failures.
    pub fn is_healthy(&self, max_consecutive_failures: u32) -> bool {
        self.consecutive_health_failures < max_consecutive_failures
    }
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: SandboxId,
    pub run_id: Option<RunId>,
    pub state: SandboxState,
    pub template: String,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub expires_at: Option<Instant>,
    pub metrics: SandboxMetrics,
}

impl Sandbox {
    pub fn new(template: impl Into<String>, now: Instant) -> Self {
        Self {
            id: SandboxId::new(),
            run_id: None,
            state: SandboxState::Warming,
            template: template.into(),
            created_at: now,
            last_activity: now,
            expires_at: None,
            metrics: SandboxMetrics::default(),
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub pool_size: usize,
    pub warming: usize,
    pub ready: usize,
    pub assigned: usize,
    pub busy: usize,
    pub draining: usize,
    pub total_created: u64,
    pub total_assigned: u64,
    pub total_recycled: u64,
    pub total_terminated: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}
