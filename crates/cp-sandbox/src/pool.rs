use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cp_base::{RunId, SandboxId};
use parking_lot::Mutex;

use crate::backend::{ExecutorBackend, ExecutorHandle};
use crate::error::{Result, SandboxError};
use crate::model::{PoolStats, Sandbox, SandboxState};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub max_sandbox_age: Duration,
    pub max_idle: Duration,
    pub warmup_interval: Duration,
    pub cleanup_interval: Duration,
    pub expiry_interval: Duration,
    pub max_consecutive_health_failures: u32,
    /// Templates the warmup loop proactively tops up, in addition to
    /// whatever templates callers have already requested.
    pub templates: Vec<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 3,
            max_pool_size: 10,
            max_sandbox_age: Duration::from_secs(3600),
            max_idle: Duration::from_secs(300),
            warmup_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(60),
            expiry_interval: Duration::from_secs(300),
            max_consecutive_health_failures: 3,
            templates: vec!["base".to_string()],
        }
    }
}

struct Entry {
    sandbox: Sandbox,
    handle: ExecutorHandle,
}

struct PoolState {
    entries: HashMap<SandboxId, Entry>,
    total_created: u64,
    total_assigned: u64,
    total_recycled: u64,
    total_terminated: u64,
    cache_hits: u64,
    cache_misses: u64,
}

impl Default for PoolState {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            total_created: 0,
            total_assigned: 0,
            total_recycled: 0,
            total_terminated: 0,
            cache_hits: 0,
            cache_misses: 0,
        }
    }
}

/// Warm pool of isolated execution environments: `acquire`/`release`
/// against a minimum standby size, with the executor itself abstracted
/// behind [`ExecutorBackend`] instead of a concrete provider client.
pub struct SandboxPool {
    backend: Arc<dyn ExecutorBackend>,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl SandboxPool {
    pub fn new(backend: Arc<dyn ExecutorBackend>, config: PoolConfig) -> Self {
        Self {
            backend,
            config,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Returns the first `ready` sandbox for `template`, or creates a new
    /// one unless the pool cap is hit.
    pub async fn acquire(&self, run_id: RunId, template: &str) -> Result<Sandbox> {
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.entries.values_mut().find(|e| {
                e.sandbox.state == SandboxState::Ready && e.sandbox.template == template
            }) {
                entry.sandbox.state = SandboxState::Assigned;
                entry.sandbox.run_id = Some(run_id);
                entry.sandbox.last_activity = Instant::now();
                state.total_assigned += 1;
                state.cache_hits += 1;
                let sandbox = entry.sandbox.clone();
                tracing::info!(sandbox_id = %sandbox.id, %run_id, "acquired sandbox (cache hit)");
                return Ok(sandbox);
            }
        }

        self.state.lock().cache_misses += 1;

        let pool_size = self.state.lock().entries.len();
        if pool_size >= self.config.max_pool_size {
            return Err(SandboxError::PoolExhausted {
                max_pool_size: self.config.max_pool_size,
            });
        }

        let mut sandbox = self.create_sandbox(template).await?;
        sandbox.state = SandboxState::Assigned;
        sandbox.run_id = Some(run_id);

        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&sandbox.id) {
            entry.sandbox = sandbox.clone();
        }
        state.total_assigned += 1;
        tracing::info!(sandbox_id = %sandbox.id, %run_id, "acquired sandbox (cache miss)");
        Ok(sandbox)
    }

    /// Returns a healthy, not-over-age sandbox to `ready`; otherwise
    /// terminates it.
    pub async fn release(&self, sandbox_id: SandboxId, recycle: bool) -> Result<()> {
        let now = Instant::now();
        let should_terminate = {
            let mut state = self.state.lock();
            let Some(entry) = state.entries.get_mut(&sandbox_id) else {
                return Err(SandboxError::NotFound {
                    sandbox_id: sandbox_id.to_string(),
                });
            };
            entry.sandbox.run_id = None;
            entry.sandbox.last_activity = now;

            let healthy = entry
                .sandbox
                .metrics
                .is_healthy(self.config.max_consecutive_health_failures);
            let over_age = entry.sandbox.age(now) >= self.config.max_sandbox_age;

            if recycle && healthy && !over_age {
                entry.sandbox.state = SandboxState::Ready;
                state.total_recycled += 1;
                false
            } else {
                true
            }
        };

        if should_terminate {
            self.terminate_sandbox(sandbox_id).await?;
        }
        Ok(())
    }

    pub fn mark_busy(&self, sandbox_id: SandboxId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&sandbox_id) {
            entry.sandbox.state = SandboxState::Busy;
            entry.sandbox.last_activity = Instant::now();
        }
    }

    pub fn mark_idle(&self, sandbox_id: SandboxId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&sandbox_id) {
            if entry.sandbox.state == SandboxState::Busy {
                entry.sandbox.state = SandboxState::Assigned;
                entry.sandbox.last_activity = Instant::now();
            }
        }
    }

    /// Records the outcome of an execution against a sandbox's running
    /// metrics.
    pub fn record_execution(
        &self,
        sandbox_id: SandboxId,
        cpu_percent: f64,
        memory_used_bytes: u64,
        disk_used_bytes: u64,
        bytes_in: u64,
        bytes_out: u64,
        exit_code: i32,
    ) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&sandbox_id) {
            let metrics = &mut entry.sandbox.metrics;
            metrics.cpu_percent = cpu_percent;
            metrics.memory_used_bytes = memory_used_bytes;
            metrics.memory_peak_bytes = metrics.memory_peak_bytes.max(memory_used_bytes);
            metrics.disk_used_bytes = disk_used_bytes;
            metrics.bytes_in += bytes_in;
            metrics.bytes_out += bytes_out;
            metrics.execution_count += 1;
            metrics.last_exit_code = Some(exit_code);
            entry.sandbox.last_activity = Instant::now();
        }
    }

    /// Records a health-check result, feeding the "unhealthy after N
    /// consecutive failures" derived flag.
    pub fn record_health_check(&self, sandbox_id: SandboxId, healthy: bool) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&sandbox_id) {
            if healthy {
                entry.sandbox.metrics.consecutive_health_failures = 0;
            } else {
                entry.sandbox.metrics.consecutive_health_failures += 1;
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let mut stats = PoolStats {
            pool_size: state.entries.len(),
            total_created: state.total_created,
            total_assigned: state.total_assigned,
            total_recycled: state.total_recycled,
            total_terminated: state.total_terminated,
            cache_hits: state.cache_hits,
            cache_misses: state.cache_misses,
            ..Default::default()
        };
        for entry in state.entries.values() {
            match entry.sandbox.state {
                SandboxState::Warming => stats.warming += 1,
                SandboxState::Ready => stats.ready += 1,
                SandboxState::Assigned => stats.assigned += 1,
                SandboxState::Busy => stats.busy += 1,
                SandboxState::Draining => stats.draining += 1,
                SandboxState::Terminated => {}
            }
        }
        stats
    }

    async fn create_sandbox(&self, template: &str) -> Result<Sandbox> {
        let handle = self.backend.start(template).await?;
        let sandbox = Sandbox::new(template, Instant::now());

        let mut state = self.state.lock();
        state.entries.insert(
            sandbox.id,
            Entry {
                sandbox: sandbox.clone(),
                handle,
            },
        );
        state.total_created += 1;
        drop(state);

        // Mark ready once started; a real backend's prewarm script would
        // run here before the transition out of Warming.
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&sandbox.id) {
            entry.sandbox.state = SandboxState::Ready;
        }
        Ok(sandbox)
    }

    async fn terminate_sandbox(&self, sandbox_id: SandboxId) -> Result<()> {
        let handle = {
            let mut state = self.state.lock();
            state.entries.remove(&sandbox_id).map(|e| e.handle)
        };
        if let Some(handle) = handle {
            self.backend.kill(handle).await?;
            self.state.lock().total_terminated += 1;
            tracing::info!(%sandbox_id, "terminated sandbox");
        }
        Ok(())
    }

    /// Ready-sandbox count for `template`, below which the warmup loop
    /// tops the pool up.
    fn ready_count(&self, template: &str) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|e| e.sandbox.state == SandboxState::Ready && e.sandbox.template == template)
            .count()
    }

    async fn ensure_min_pool_size(&self) {
        for template in &self.config.templates {
            let ready = self.ready_count(template);
            let needed = self.config.min_pool_size.saturating_sub(ready);
            for _ in 0..needed {
                if self.state.lock().entries.len() >= self.config.max_pool_size {
                    break;
                }
                if let Err(err) = self.create_sandbox(template).await {
                    tracing::warn!(%template, %err, "warmup failed to create sandbox");
                }
            }
        }
    }

    /// One pass of the cleanup loop: over-age sandboxes (any state except
    /// busy/warming) and idle `ready` sandboxes beyond `min_pool_size`.
    async fn cleanup_pass(&self) {
        let now = Instant::now();
        let candidates: Vec<SandboxId> = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .filter(|e| {
                    !matches!(e.sandbox.state, SandboxState::Busy | SandboxState::Warming)
                })
                .map(|e| e.sandbox.id)
                .collect()
        };

        for sandbox_id in candidates {
            let action = {
                let state = self.state.lock();
                let Some(entry) = state.entries.get(&sandbox_id) else {
                    continue;
                };
                if entry.sandbox.age(now) > self.config.max_sandbox_age {
                    CleanupAction::TerminateOverAge
                } else if entry.sandbox.state == SandboxState::Ready
                    && entry.sandbox.idle(now) > self.config.max_idle
                    && self.ready_count(&entry.sandbox.template) > self.config.min_pool_size
                {
                    CleanupAction::TerminateIdle
                } else {
                    CleanupAction::Keep
                }
            };

            match action {
                CleanupAction::TerminateOverAge => {
                    tracing::info!(%sandbox_id, "terminating over-age sandbox");
                    let _ = self.terminate_sandbox(sandbox_id).await;
                }
                CleanupAction::TerminateIdle => {
                    tracing::info!(%sandbox_id, "terminating idle sandbox beyond min pool size");
                    let _ = self.terminate_sandbox(sandbox_id).await;
                }
                CleanupAction::Keep => {}
            }
        }
    }

    /// One pass of the expiry loop: sandboxes whose per-instance
    /// `expires_at` has passed.
    async fn expiry_pass(&self) {
        let now = Instant::now();
        let expired: Vec<SandboxId> = {
            let state = self.state.lock();
            state
                .entries
                .values()
                .filter(|e| e.sandbox.expires_at.is_some_and(|exp| exp <= now))
                .map(|e| e.sandbox.id)
                .collect()
        };
        for sandbox_id in expired {
            tracing::info!(%sandbox_id, "terminating expired sandbox");
            let _ = self.terminate_sandbox(sandbox_id).await;
        }
    }

    /// Spawns the warmup/cleanup/expiry background loops.
    /// Each loop lives for as long as the returned handles are held;
    /// dropping them aborts the loop (matching `tokio::spawn` + abort
    /// teardown elsewhere in this crate family).
    pub fn spawn_background_loops(self: &Arc<Self>) -> BackgroundLoops {
        let warmup = {
            let pool = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(pool.config.warmup_interval);
                loop {
                    ticker.tick().await;
                    pool.ensure_min_pool_size().await;
                }
            })
        };
        let cleanup = {
            let pool = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(pool.config.cleanup_interval);
                loop {
                    ticker.tick().await;
                    pool.cleanup_pass().await;
                }
            })
        };
        let expiry = {
            let pool = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(pool.config.expiry_interval);
                loop {
                    ticker.tick().await;
                    pool.expiry_pass().await;
                }
            })
        };
        BackgroundLoops {
            warmup,
            cleanup,
            expiry,
        }
    }
}

enum CleanupAction {
    TerminateOverAge,
    TerminateIdle,
    Keep,
}

/// Handles to the three background loops; dropping or aborting these
/// stops the pool's self-maintenance (used by the orchestrator's
/// shutdown path).
pub struct BackgroundLoops {
    pub warmup: tokio::task::JoinHandle<()>,
    pub cleanup: tokio::task::JoinHandle<()>,
    pub expiry: tokio::task::JoinHandle<()>,
}

impl Drop for BackgroundLoops {
    fn drop(&mut self) {
        self.warmup.abort();
        self.cleanup.abort();
        self.expiry.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeBackend {
        started: AtomicUsize,
        killed: AtomicUsize,
    }

    impl FakeBackend {
        fn new() -> Self {
            Self {
                started: AtomicUsize::new(0),
                killed: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl ExecutorBackend for FakeBackend {
        async fn start(&self, template: &str) -> Result<ExecutorHandle> {
            let n = self.started.fetch_add(1, Ordering::SeqCst);
            Ok(ExecutorHandle {
                backend_instance_id: format!("{template}-{n}"),
            })
        }

        async fn exec(
            &self,
            _handle: &ExecutorHandle,
            _command: &str,
        ) -> Result<crate::backend::ExecOutcome> {
            Ok(crate::backend::ExecOutcome {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                bytes_in: 0,
                bytes_out: 0,
            })
        }

        async fn write_file(&self, _handle: &ExecutorHandle, _path: &str, _bytes: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn read_file(&self, _handle: &ExecutorHandle, _path: &str) -> Result<Vec<u8>> {
            Ok(vec![])
        }

        async fn kill(&self, _handle: ExecutorHandle) -> Result<()> {
            self.killed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_config() -> PoolConfig {
        PoolConfig {
            min_pool_size: 1,
            max_pool_size: 2,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn acquire_creates_on_cache_miss_and_reuses_on_release() {
        let backend = Arc::new(FakeBackend::new());
        let pool = SandboxPool::new(backend, test_config());

        let run_a = RunId::new();
        let sandbox = pool.acquire(run_a, "base").await.unwrap();
        assert_eq!(pool.stats().cache_misses, 1);

        pool.release(sandbox.id, true).await.unwrap();
        assert_eq!(pool.stats().ready, 1);

        let run_b = RunId::new();
        let reused = pool.acquire(run_b, "base").await.unwrap();
        assert_eq!(reused.id, sandbox.id);
        assert_eq!(pool.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn acquire_fails_once_pool_cap_is_hit() {
        let backend = Arc::new(FakeBackend::new());
        let pool = SandboxPool::new(backend, test_config());

        pool.acquire(RunId::new(), "base").await.unwrap();
        pool.acquire(RunId::new(), "base").await.unwrap();

        let result = pool.acquire(RunId::new(), "base").await;
        assert!(matches!(result, Err(SandboxError::PoolExhausted { .. })));
    }

    #[tokio::test]
    async fn unhealthy_sandbox_is_terminated_on_release_not_recycled() {
        let backend = Arc::new(FakeBackend::new());
        let pool = SandboxPool::new(
            backend,
            PoolConfig {
                max_consecutive_health_failures: 2,
                ..test_config()
            },
        );

        let sandbox = pool.acquire(RunId::new(), "base").await.unwrap();
        pool.record_health_check(sandbox.id, false);
        pool.record_health_check(sandbox.id, false);

        pool.release(sandbox.id, true).await.unwrap();
        assert_eq!(pool.stats().ready, 0);
        assert_eq!(pool.stats().total_terminated, 1);
    }

    #[tokio::test]
    async fn ensure_min_pool_size_tops_up_ready_sandboxes() {
        let backend = Arc::new(FakeBackend::new());
        let pool = SandboxPool::new(
            backend,
            PoolConfig {
                min_pool_size: 2,
                max_pool_size: 5,
                templates: vec!["base".to_string()],
                ..PoolConfig::default()
            },
        );

        pool.ensure_min_pool_size().await;
        assert_eq!(pool.stats().ready, 2);
    }
}
