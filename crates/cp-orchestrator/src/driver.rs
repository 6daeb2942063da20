//! The run-driver loop: takes a run
//! from the queue, advances it through the state machine, materializes
//! and dispatches subtasks via the scheduler, and reserves sandboxes and
//! reports billing for each executed step.
//!
//! Subtask execution itself (the model call or tool invocation) is out
//! of scope — this crate only does the bookkeeping around it. A worker
//! harness calls [`RunDriver::start_subtask`] (implicitly, via
//! [`RunDriver::tick`]) to learn it has been handed a subtask, runs it,
//! then reports back through [`RunDriver::complete_subtask`] or
//! [`RunDriver::fail_subtask`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use cp_base::{OrgId, RunId, SandboxId, SubtaskId};
use cp_billing::BillingLedger;
use cp_queue::{JobQueue, JobRecord, is_transient_error};
use cp_sandbox::SandboxPool;
use cp_scheduler::Scheduler;
use cp_state::{FencingLease, RunStateMachine};
use cp_store::{DurableStore, Run, RunState, Subtask, SubtaskState};
use dashmap::DashMap;
use serde_json::Value;

use crate::error::{OrchestratorError, Result};
use crate::types::{DriverConfig, NewSubtask, TokenUsage};

/// Maps a subtask's `task_type` to a sandbox template; unrecognized types
/// fall back to the configured default.
fn template_for_task_type(task_type: &str, default_template: &str) -> String {
    match task_type {
        "code_execution" | "shell" => "code".to_string(),
        "browser" => "browser".to_string(),
        _ => default_template.to_string(),
    }
}

pub struct RunDriver {
    store: Arc<dyn DurableStore>,
    queue: Arc<dyn JobQueue>,
    state: RunStateMachine,
    scheduler: Scheduler,
    sandbox: Arc<SandboxPool>,
    billing: Arc<BillingLedger>,
    config: DriverConfig,
    /// Sandbox reserved for a subtask currently executing, keyed by
    /// subtask id. Sandboxes are owned by the pool; this map only
    /// remembers which instance a subtask is borrowing so it can be
    /// released when the subtask finishes or the run is cancelled/timed
    /// out.
    reserved_sandboxes: DashMap<SubtaskId, SandboxId>,
}

impl RunDriver {
    pub fn new(
        store: Arc<dyn DurableStore>,
        queue: Arc<dyn JobQueue>,
        scheduler: Scheduler,
        sandbox: Arc<SandboxPool>,
        billing: Arc<BillingLedger>,
        config: DriverConfig,
    ) -> Self {
        let state = RunStateMachine::new(store.clone());
        Self {
            store,
            queue,
            state,
            scheduler,
            sandbox,
            billing,
            config,
            reserved_sandboxes: DashMap::new(),
        }
    }

    async fn acquire_lease(&self, run_id: RunId) -> Result<FencingLease> {
        self.state
            .acquire(run_id, self.config.lease_ttl)
            .await?
            .ok_or_else(|| OrchestratorError::NotLeaseHolder {
                run_id: run_id.to_string(),
            })
    }

    /// Creates the run row and enqueues the job that drives it through
    /// `created → validating → planning`.
    pub async fn submit_run(&self, run: Run) -> Result<Run> {
        let created = self.store.create_run(run).await?;
        self.queue
            .enqueue(JobRecord::new(created.id, None, created.priority))
            .await?;
        Ok(created)
    }

    /// One pass of the driver loop: pops a job and dispatches it. Returns
    /// `false` when the queue had nothing to offer within the configured
    /// timeout, so a caller's loop can decide whether to keep spinning.
    pub async fn tick(&self) -> Result<bool> {
        let Some(job) = self.queue.dequeue(self.config.dequeue_timeout).await? else {
            return Ok(false);
        };
        if job.subtask_id.is_some() {
            if let Err(err) = self.handle_subtask_job(&job).await {
                tracing::warn!(run_id = %job.run_id, %err, "subtask job handling failed");
            }
        } else if let Err(err) = self.handle_run_job(job).await {
            tracing::warn!(%err, "run job handling failed");
        }
        Ok(true)
    }

    async fn handle_run_job(&self, job: JobRecord) -> Result<()> {
        let run_id = job.run_id;
        let Some(run) = self.store.get_run(run_id).await? else {
            tracing::warn!(%run_id, "run job refers to a run that no longer exists, dropping");
            self.queue.mark_complete(run_id).await?;
            return Ok(());
        };

        if run.state.is_terminal() {
            self.queue.mark_complete(run_id).await?;
            return Ok(());
        }

        if run.state == RunState::Created {
            match self.validate_and_advance(&run).await {
                Ok(()) => self.queue.mark_complete(run_id).await?,
                Err(err) => {
                    self.queue
                        .mark_failed(run_id, &err.to_string(), 0, 0)
                        .await?;
                    return Err(err);
                }
            }
        } else {
            // Re-surfaced for a run already past `created`: the driver has
            // nothing further to do here until `ingest_subtasks` or a
            // subtask completion moves it along.
            self.queue.mark_complete(run_id).await?;
        }
        Ok(())
    }

    /// `created → validating`, then either `validating → failed` (empty
    /// plan) or `validating → planning`.
    async fn validate_and_advance(&self, run: &Run) -> Result<()> {
        let lease = self.acquire_lease(run.id).await?;
        let outcome = self
            .state
            .transition_run(
                &lease,
                RunState::Created,
                RunState::Validating,
                run.state_version,
                "orchestrator",
                None,
            )
            .await?;

        if run.plan.phases.is_empty() {
            self.state
                .transition_run(
                    &lease,
                    RunState::Validating,
                    RunState::Failed,
                    outcome.new_state_version,
                    "orchestrator",
                    Some("submitted with an empty plan".to_string()),
                )
                .await?;
            self.state.release(lease).await?;
            return Err(OrchestratorError::EmptyPlan {
                run_id: run.id.to_string(),
            });
        }

        self.state
            .transition_run(
                &lease,
                RunState::Validating,
                RunState::Planning,
                outcome.new_state_version,
                "orchestrator",
                None,
            )
            .await?;
        self.state.release(lease).await?;
        Ok(())
    }

    /// Materializes the subtask breakdown the planner produced, moves the
    /// run `planning → executing`, and dispatches whatever subtasks have
    /// no unmet dependencies.
    pub async fn ingest_subtasks(&self, run_id: RunId, subtasks: Vec<NewSubtask>) -> Result<usize> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::RunNotFound {
                run_id: run_id.to_string(),
            })?;

        for new_subtask in subtasks {
            self.store
                .create_subtask(Subtask {
                    id: SubtaskId::new(),
                    run_id,
                    subtask_index: new_subtask.subtask_index,
                    task_type: new_subtask.task_type,
                    state: SubtaskState::Pending,
                    state_version: 0,
                    attempt_count: 0,
                    assigned_worker_id: None,
                    checkpoint_id: None,
                    dependencies: new_subtask.dependencies,
                    input: new_subtask.input,
                    output: None,
                })
                .await?;
        }

        let lease = self.acquire_lease(run_id).await?;
        self.state
            .transition_run(
                &lease,
                RunState::Planning,
                RunState::Executing,
                run.state_version,
                "orchestrator",
                None,
            )
            .await?;
        self.state.release(lease).await?;

        self.dispatch_ready_subtasks(&run).await
    }

    /// Transitions every dependency-satisfied `pending` subtask to
    /// `queued` and enqueues it via the scheduler.
    async fn dispatch_ready_subtasks(&self, run: &Run) -> Result<usize> {
        let pending = self
            .store
            .get_subtasks_by_run(run.id, Some(&[SubtaskState::Pending]))
            .await?;

        let mut dispatched = 0usize;
        for subtask in pending {
            if !self.store.check_subtask_ready(subtask.id).await? {
                continue;
            }
            self.state
                .transition_subtask(
                    subtask.id,
                    SubtaskState::Pending,
                    SubtaskState::Queued,
                    subtask.state_version,
                    "orchestrator",
                    None,
                    None,
                    None,
                )
                .await?;

            let decision = self.scheduler.schedule(&subtask, run, Utc::now());
            // `SchedulingDecision::worker_affinity` has no home on the wire
            // job record (the job schema carries only run_id/priority/retry
            // bookkeeping); traced so it is still visible to an operator
            // even though it is not yet a routing input.
            if let Some(affinity) = &decision.worker_affinity {
                tracing::debug!(subtask_id = %subtask.id, worker_affinity = %affinity, "computed affinity, not yet routable");
            }
            self.queue
                .enqueue(JobRecord::new(run.id, Some(subtask.id), decision.priority))
                .await?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    async fn handle_subtask_job(&self, job: &JobRecord) -> Result<()> {
        let subtask_id = job
            .subtask_id
            .expect("a subtask-kind job record always carries a subtask id");
        self.start_subtask(subtask_id).await
    }

    /// `queued → running`, reserving a sandbox for the duration of
    /// execution.
    async fn start_subtask(&self, subtask_id: SubtaskId) -> Result<()> {
        let subtask = self.get_subtask(subtask_id).await?;
        let run = self.get_run(subtask.run_id).await?;

        self.state
            .transition_subtask(
                subtask_id,
                SubtaskState::Queued,
                SubtaskState::Running,
                subtask.state_version,
                "orchestrator",
                None,
                None,
                None,
            )
            .await?;

        let template = template_for_task_type(&subtask.task_type, &self.config.default_template);
        let sandbox = self.sandbox.acquire(run.id, &template).await?;
        self.sandbox.mark_busy(sandbox.id);
        self.reserved_sandboxes.insert(subtask_id, sandbox.id);
        Ok(())
    }

    /// Reports a subtask's successful completion: bills any token usage,
    /// releases its sandbox back to the pool, transitions it to
    /// `completed`, and checks whether the owning run can advance.
    pub async fn complete_subtask(
        &self,
        subtask_id: SubtaskId,
        output: Value,
        usage: Option<TokenUsage>,
    ) -> Result<()> {
        let subtask = self.get_subtask(subtask_id).await?;
        let run = self.get_run(subtask.run_id).await?;

        if let Some(usage) = usage {
            self.billing
                .bill_token_call(
                    run.id,
                    run.org_id,
                    &usage.model,
                    usage.provider,
                    usage.input_tokens,
                    usage.output_tokens,
                    usage.idempotency_key,
                )
                .await?;
        }

        self.release_reserved_sandbox(subtask_id, true).await;

        self.state
            .transition_subtask(
                subtask_id,
                SubtaskState::Running,
                SubtaskState::Completed,
                subtask.state_version,
                "orchestrator",
                None,
                Some(output),
                None,
            )
            .await?;
        self.queue.mark_complete(run.id).await?;
        self.advance_run_after_subtask(&run).await
    }

    /// Reports a subtask's failure. Retries (below the configured
    /// `attempt_count` ceiling, and for transient errors per the queue's
    /// classification) are resubmitted; exhausted or permanent failures
    /// fail the owning run.
    pub async fn fail_subtask(&self, subtask_id: SubtaskId, error: String) -> Result<()> {
        let subtask = self.get_subtask(subtask_id).await?;
        let run = self.get_run(subtask.run_id).await?;

        self.release_reserved_sandbox(subtask_id, false).await;

        let outcome = self
            .state
            .transition_subtask(
                subtask_id,
                SubtaskState::Running,
                SubtaskState::Failed,
                subtask.state_version,
                "orchestrator",
                Some(error.clone()),
                None,
                Some(error.clone()),
            )
            .await?;

        let retryable = is_transient_error(&error) && subtask.attempt_count < self.config.max_subtask_retries;
        self.queue
            .mark_failed(run.id, &error, subtask.attempt_count, self.config.max_subtask_retries)
            .await?;

        if retryable {
            self.state
                .transition_subtask(
                    subtask_id,
                    SubtaskState::Failed,
                    SubtaskState::Pending,
                    outcome.new_state_version,
                    "orchestrator",
                    Some("retrying".to_string()),
                    None,
                    None,
                )
                .await?;
            self.dispatch_ready_subtasks(&run).await?;
            Ok(())
        } else {
            self.advance_run_after_subtask(&run).await
        }
    }

    /// Checks whether every non-synthesis subtask is done, then either
    /// enters `synthesizing`, completes the run, or (if any subtask is
    /// terminally failed) fails it.
    async fn advance_run_after_subtask(&self, run: &Run) -> Result<()> {
        let all = self.store.get_subtasks_by_run(run.id, None).await?;

        if all.iter().any(|s| s.state == SubtaskState::Failed) {
            return self.fail_run(run, "a subtask exhausted its retries").await;
        }

        let (synthesis, rest): (Vec<&Subtask>, Vec<&Subtask>) =
            all.iter().partition(|s| s.task_type == "synthesis");
        if !rest.iter().all(|s| s.state == SubtaskState::Completed) {
            return Ok(());
        }

        match run.state {
            // `Executing -> Completed` has no direct edge in the transition
            // table: every run passes through `synthesizing`, even one
            // with no synthesis subtask of its own.
            RunState::Executing => {
                if synthesis.is_empty() {
                    self.enter_synthesizing(run.id).await?;
                    self.complete_run(run.id, RunState::Synthesizing).await?;
                } else if synthesis.iter().all(|s| s.state == SubtaskState::Pending) {
                    self.enter_synthesizing(run.id).await?;
                }
            }
            RunState::Synthesizing => {
                if synthesis.iter().all(|s| s.state == SubtaskState::Completed) {
                    self.complete_run(run.id, RunState::Synthesizing).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn enter_synthesizing(&self, run_id: RunId) -> Result<()> {
        let run = self.get_run(run_id).await?;
        let lease = self.acquire_lease(run_id).await?;
        self.state
            .transition_run(
                &lease,
                RunState::Executing,
                RunState::Synthesizing,
                run.state_version,
                "orchestrator",
                None,
            )
            .await?;
        self.state.release(lease).await?;
        let refreshed = self.get_run(run_id).await?;
        self.dispatch_ready_subtasks(&refreshed).await?;
        Ok(())
    }

    async fn complete_run(&self, run_id: RunId, from_state: RunState) -> Result<()> {
        let run = self.get_run(run_id).await?;
        let lease = self.acquire_lease(run_id).await?;
        self.state
            .transition_run(
                &lease,
                from_state,
                RunState::Completed,
                run.state_version,
                "orchestrator",
                None,
            )
            .await?;
        self.state.release(lease).await?;
        if let Err(err) = self.billing.reconcile(run_id).await {
            tracing::warn!(%run_id, %err, "post-completion reconciliation failed");
        }
        Ok(())
    }

    async fn fail_run(&self, run: &Run, reason: &str) -> Result<()> {
        let lease = self.acquire_lease(run.id).await?;
        self.state
            .transition_run(
                &lease,
                run.state,
                RunState::Failed,
                run.state_version,
                "orchestrator",
                Some(reason.to_string()),
            )
            .await?;
        self.state.release(lease).await?;
        self.cancel_open_subtasks(run.id, reason, "orchestrator").await
    }

    /// Cancels a run by operator request (e.g. an HTTP `DELETE /runs/{id}`).
    pub async fn cancel_run(&self, run_id: RunId) -> Result<()> {
        let run = self.get_run(run_id).await?;
        if run.state.is_terminal() {
            return Ok(());
        }
        let lease = self.acquire_lease(run_id).await?;
        self.state
            .transition_run(
                &lease,
                run.state,
                RunState::Cancelled,
                run.state_version,
                "operator",
                Some("cancelled by request".to_string()),
            )
            .await?;
        self.state.release(lease).await?;
        self.cancel_open_subtasks(run_id, "run cancelled", "operator").await
    }

    /// Cooperative cancellation of every non-terminal subtask of a run
    /// whose own state just went terminal: in-flight sandboxes are
    /// released rather than forcibly killed mid-instruction.
    async fn cancel_open_subtasks(&self, run_id: RunId, reason: &str, actor: &str) -> Result<()> {
        let open = self
            .store
            .get_subtasks_by_run(
                run_id,
                Some(&[SubtaskState::Pending, SubtaskState::Queued, SubtaskState::Running]),
            )
            .await?;
        for subtask in open {
            self.release_reserved_sandbox(subtask.id, false).await;
            if let Err(err) = self
                .state
                .transition_subtask(
                    subtask.id,
                    subtask.state,
                    SubtaskState::Cancelled,
                    subtask.state_version,
                    actor,
                    Some(reason.to_string()),
                    None,
                    None,
                )
                .await
            {
                tracing::warn!(subtask_id = %subtask.id, %err, "failed to cancel subtask");
            }
        }
        Ok(())
    }

    /// One pass of the timeout sweep: runs whose `deadline_at` has passed
    /// are moved to `timeout` and their open subtasks are cancelled.
    pub async fn sweep_deadlines(&self, now: DateTime<Utc>) -> Result<usize> {
        let stalled = self.store.get_stalled_runs(self.config.stall_threshold).await?;
        let mut timed_out = 0;
        for run in stalled {
            if run.state.is_terminal() {
                continue;
            }
            if run.deadline_at.is_some_and(|deadline| deadline <= now) {
                if let Err(err) = self.timeout_run(&run).await {
                    tracing::warn!(run_id = %run.id, %err, "failed to time out run");
                } else {
                    timed_out += 1;
                }
            }
        }
        Ok(timed_out)
    }

    async fn timeout_run(&self, run: &Run) -> Result<()> {
        let lease = self.acquire_lease(run.id).await?;
        self.state
            .transition_run(
                &lease,
                run.state,
                RunState::Timeout,
                run.state_version,
                "orchestrator",
                Some("deadline exceeded".to_string()),
            )
            .await?;
        self.state.release(lease).await?;
        self.cancel_open_subtasks(run.id, "run timed out", "orchestrator").await
    }

    /// One pass of the queue reconciler sidecar loop: subtasks the
    /// Durable Store still has as `queued` but with no matching job in
    /// the broker's `processing` list are re-enqueued.
    pub async fn reconcile_queue(&self) -> Result<usize> {
        let queued = self
            .store
            .get_subtasks_in_state(&[SubtaskState::Queued])
            .await?;
        let processing = self.queue.processing_jobs().await?;
        let in_flight: std::collections::HashSet<SubtaskId> =
            processing.iter().filter_map(|job| job.subtask_id).collect();

        let mut recovered = 0;
        for subtask in queued {
            if in_flight.contains(&subtask.id) {
                continue;
            }
            let Some(run) = self.store.get_run(subtask.run_id).await? else {
                continue;
            };
            let decision = self.scheduler.schedule(&subtask, &run, Utc::now());
            self.queue
                .enqueue(JobRecord::new(run.id, Some(subtask.id), decision.priority))
                .await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn release_reserved_sandbox(&self, subtask_id: SubtaskId, recycle: bool) {
        if let Some((_, sandbox_id)) = self.reserved_sandboxes.remove(&subtask_id) {
            if let Err(err) = self.sandbox.release(sandbox_id, recycle).await {
                tracing::warn!(%sandbox_id, %err, "failed to release sandbox");
            }
        }
    }

    async fn get_subtask(&self, subtask_id: SubtaskId) -> Result<Subtask> {
        self.store
            .get_subtask(subtask_id)
            .await?
            .ok_or_else(|| OrchestratorError::SubtaskNotFound {
                subtask_id: subtask_id.to_string(),
            })
    }

    async fn get_run(&self, run_id: RunId) -> Result<Run> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::RunNotFound {
                run_id: run_id.to_string(),
            })
    }

    /// Convenience accessor for a caller (e.g. the HTTP layer) needing a
    /// quick read of an org's current balance without going through
    /// billing directly.
    pub async fn credit_balance(&self, org_id: OrgId) -> Result<cp_store::CreditBalance> {
        Ok(self.store.get_credit_balance(org_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_base::{OrgId, UserId};
    use cp_billing::LedgerConfig;
    use cp_queue::InMemoryQueue;
    use cp_sandbox::PoolConfig;
    use cp_scheduler::SchedulerConfig;
    use cp_store::{InMemoryStore, Plan, PlanPhase};
    use std::time::Duration;

    struct NoopBackend;

    #[async_trait::async_trait]
    impl cp_sandbox::ExecutorBackend for NoopBackend {
        async fn start(&self, _template: &str) -> cp_sandbox::Result<cp_sandbox::ExecutorHandle> {
            Ok(cp_sandbox::ExecutorHandle {
                backend_instance_id: "noop".to_string(),
            })
        }
        async fn exec(
            &self,
            _handle: &cp_sandbox::ExecutorHandle,
            _command: &str,
        ) -> cp_sandbox::Result<cp_sandbox::ExecOutcome> {
            Ok(cp_sandbox::ExecOutcome {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                bytes_in: 0,
                bytes_out: 0,
            })
        }
        async fn write_file(
            &self,
            _handle: &cp_sandbox::ExecutorHandle,
            _path: &str,
            _bytes: &[u8],
        ) -> cp_sandbox::Result<()> {
            Ok(())
        }
        async fn read_file(
            &self,
            _handle: &cp_sandbox::ExecutorHandle,
            _path: &str,
        ) -> cp_sandbox::Result<Vec<u8>> {
            Ok(vec![])
        }
        async fn kill(&self, _handle: cp_sandbox::ExecutorHandle) -> cp_sandbox::Result<()> {
            Ok(())
        }
    }

    fn test_driver() -> RunDriver {
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryQueue::new());
        let sandbox = Arc::new(SandboxPool::new(
            Arc::new(NoopBackend),
            PoolConfig {
                min_pool_size: 0,
                ..PoolConfig::default()
            },
        ));
        let billing = Arc::new(BillingLedger::new(store.clone(), LedgerConfig::default()));
        RunDriver::new(
            store,
            queue,
            Scheduler::new(SchedulerConfig::default()),
            sandbox,
            billing,
            DriverConfig {
                lease_ttl: Duration::from_secs(60),
                dequeue_timeout: Duration::from_millis(50),
                ..DriverConfig::default()
            },
        )
    }

    fn sample_run() -> Run {
        Run {
            id: RunId::new(),
            user_id: UserId::new(),
            org_id: OrgId::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            state: RunState::Created,
            state_version: 0,
            fencing_token: None,
            token_expires_at: None,
            plan: Plan {
                phases: vec![PlanPhase {
                    phase_number: 0,
                    description: "do the thing".to_string(),
                }],
            },
            current_phase_number: 0,
            error: None,
            completed_at: None,
            worker_id: None,
            deadline_at: None,
            priority: 5,
        }
    }

    #[tokio::test]
    async fn single_subtask_run_reaches_completed() {
        let driver = test_driver();
        let run = driver.submit_run(sample_run()).await.unwrap();

        assert!(driver.tick().await.unwrap());

        let after_validation = driver.get_run(run.id).await.unwrap();
        assert_eq!(after_validation.state, RunState::Planning);

        let dispatched = driver
            .ingest_subtasks(
                run.id,
                vec![NewSubtask {
                    subtask_index: 0,
                    task_type: "research".to_string(),
                    dependencies: vec![],
                    input: serde_json::json!({}),
                }],
            )
            .await
            .unwrap();
        assert_eq!(dispatched, 1);

        assert!(driver.tick().await.unwrap());

        let subtasks = driver
            .store
            .get_subtasks_by_run(run.id, None)
            .await
            .unwrap();
        assert_eq!(subtasks.len(), 1);
        assert_eq!(subtasks[0].state, SubtaskState::Running);

        driver
            .complete_subtask(subtasks[0].id, serde_json::json!({"ok": true}), None)
            .await
            .unwrap();

        let finished = driver.get_run(run.id).await.unwrap();
        assert_eq!(finished.state, RunState::Completed);
    }

    #[tokio::test]
    async fn empty_plan_fails_the_run() {
        let driver = test_driver();
        let mut run = sample_run();
        run.plan = Plan::default();
        let run = driver.submit_run(run).await.unwrap();

        assert!(driver.tick().await.unwrap());

        let failed = driver.get_run(run.id).await.unwrap();
        assert_eq!(failed.state, RunState::Failed);
    }

    #[tokio::test]
    async fn permanently_failed_subtask_fails_the_run() {
        let driver = test_driver();
        let run = driver.submit_run(sample_run()).await.unwrap();
        driver.tick().await.unwrap();
        driver
            .ingest_subtasks(
                run.id,
                vec![NewSubtask {
                    subtask_index: 0,
                    task_type: "research".to_string(),
                    dependencies: vec![],
                    input: serde_json::json!({}),
                }],
            )
            .await
            .unwrap();
        driver.tick().await.unwrap();

        let subtasks = driver.store.get_subtasks_by_run(run.id, None).await.unwrap();
        driver
            .fail_subtask(subtasks[0].id, "invalid plan: missing phase".to_string())
            .await
            .unwrap();

        let failed = driver.get_run(run.id).await.unwrap();
        assert_eq!(failed.state, RunState::Failed);
    }

    #[tokio::test]
    async fn transient_subtask_failure_is_retried() {
        let driver = test_driver();
        let run = driver.submit_run(sample_run()).await.unwrap();
        driver.tick().await.unwrap();
        driver
            .ingest_subtasks(
                run.id,
                vec![NewSubtask {
                    subtask_index: 0,
                    task_type: "research".to_string(),
                    dependencies: vec![],
                    input: serde_json::json!({}),
                }],
            )
            .await
            .unwrap();
        driver.tick().await.unwrap();

        let subtasks = driver.store.get_subtasks_by_run(run.id, None).await.unwrap();
        driver
            .fail_subtask(subtasks[0].id, "connection reset".to_string())
            .await
            .unwrap();

        let retried = driver.get_subtask(subtasks[0].id).await.unwrap();
        assert_eq!(retried.state, SubtaskState::Queued);
        assert_eq!(retried.attempt_count, 1);

        let run_still_executing = driver.get_run(run.id).await.unwrap();
        assert_eq!(run_still_executing.state, RunState::Executing);
    }

    #[tokio::test]
    async fn cancel_run_cancels_open_subtasks() {
        let driver = test_driver();
        let run = driver.submit_run(sample_run()).await.unwrap();
        driver.tick().await.unwrap();
        driver
            .ingest_subtasks(
                run.id,
                vec![NewSubtask {
                    subtask_index: 0,
                    task_type: "research".to_string(),
                    dependencies: vec![],
                    input: serde_json::json!({}),
                }],
            )
            .await
            .unwrap();

        driver.cancel_run(run.id).await.unwrap();

        let cancelled = driver.get_run(run.id).await.unwrap();
        assert_eq!(cancelled.state, RunState::Cancelled);
        let subtasks = driver.store.get_subtasks_by_run(run.id, None).await.unwrap();
        assert_eq!(subtasks[0].state, SubtaskState::Cancelled);
    }

    #[tokio::test]
    async fn queue_reconciler_recovers_queued_subtasks_with_no_processing_job() {
        let driver = test_driver();
        let run = driver.submit_run(sample_run()).await.unwrap();
        driver.tick().await.unwrap();
        driver
            .ingest_subtasks(
                run.id,
                vec![NewSubtask {
                    subtask_index: 0,
                    task_type: "research".to_string(),
                    dependencies: vec![],
                    input: serde_json::json!({}),
                }],
            )
            .await
            .unwrap();

        // Drain the dispatched job out of the queue entirely, simulating
        // broker loss: the subtask row is `queued` but no job references it.
        driver.queue.dequeue(Duration::from_millis(10)).await.unwrap();
        driver.queue.mark_complete(run.id).await.unwrap();

        let recovered = driver.reconcile_queue().await.unwrap();
        assert_eq!(recovered, 1);
    }
}
