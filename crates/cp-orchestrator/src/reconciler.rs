//! Background loops around a [`RunDriver`]: the queue reconciler and the
//! deadline sweep. Each is an independent `tokio::spawn` loop; dropping
//! the returned [`DriverLoops`] aborts both, matching
//! `cp_sandbox::BackgroundLoops`'s teardown idiom.

use std::sync::Arc;
use std::time::Duration;

use crate::driver::RunDriver;

/// How often each sweep runs. Kept separate from [`crate::types::DriverConfig`]
/// since these are loop cadences, not per-call bookkeeping.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub queue_reconcile_interval: Duration,
    pub deadline_sweep_interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            queue_reconcile_interval: Duration::from_secs(30),
            deadline_sweep_interval: Duration::from_secs(15),
        }
    }
}

/// Spawns the two sidecar loops for `driver`. Holds no state of its own;
/// a caller keeps the returned handle alive for as long as the driver
/// should keep self-healing.
pub struct DriverLoops {
    pub queue_reconciler: tokio::task::JoinHandle<()>,
    pub deadline_sweep: tokio::task::JoinHandle<()>,
}

impl Drop for DriverLoops {
    fn drop(&mut self) {
        self.queue_reconciler.abort();
        self.deadline_sweep.abort();
    }
}

/// Spawns the queue reconciler and deadline sweep loops against `driver`.
pub fn spawn_driver_loops(driver: Arc<RunDriver>, config: ReconcilerConfig) -> DriverLoops {
    let queue_reconciler = {
        let driver = driver.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.queue_reconcile_interval);
            loop {
                ticker.tick().await;
                match driver.reconcile_queue().await {
                    Ok(0) => {}
                    Ok(recovered) => {
                        tracing::info!(recovered, "queue reconciler recovered lost subtasks");
                    }
                    Err(err) => tracing::warn!(%err, "queue reconciler pass failed"),
                }
            }
        })
    };

    let deadline_sweep = {
        let driver = driver.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(config.deadline_sweep_interval);
            loop {
                ticker.tick().await;
                match driver.sweep_deadlines(chrono::Utc::now()).await {
                    Ok(0) => {}
                    Ok(timed_out) => {
                        tracing::info!(timed_out, "deadline sweep timed out stalled runs");
                    }
                    Err(err) => tracing::warn!(%err, "deadline sweep pass failed"),
                }
            }
        })
    };

    DriverLoops {
        queue_reconciler,
        deadline_sweep,
    }
}
