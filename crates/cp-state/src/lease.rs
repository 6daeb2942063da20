use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cp_base::RunId;
use cp_store::DurableStore;
use uuid::Uuid;

use crate::error::{Result, StateError};

/// A held fencing token plus the generation counter that lets a
/// background expiry check notice it has since been superseded.
///
/// Mirrors the broker crate's own `lease_gen: u64` idiom: every
/// acquire/release bumps the generation, and a scheduled expiry task
/// compares its captured generation against the live one before acting,
/// so a stale task from a previous lease never clobbers a newer one.
pub struct FencingLease {
    run_id: RunId,
    token: Uuid,
    generation: Arc<AtomicU64>,
    my_generation: u64,
}

impl FencingLease {
    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// True if no newer lease has been acquired since this one.
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.my_generation
    }
}

/// Acquires a fencing token for `run_id` and arranges for
/// [`DurableStore::release_run_fencing_token`] to run automatically at
/// `ttl`, unless the lease has already been renewed (same generation
/// counter pattern as the broker crate's idle-lease scheduling).
pub async fn acquire_lease(
    store: Arc<dyn DurableStore>,
    run_id: RunId,
    ttl: Duration,
    generation: Arc<AtomicU64>,
) -> Result<Option<FencingLease>> {
    let acquisition = store.acquire_run_fencing_token(run_id, ttl).await?;
    if !acquisition.acquired {
        return Ok(None);
    }
    let token = acquisition.token.expect("acquired implies a token");
    let my_generation = generation.fetch_add(1, Ordering::SeqCst) + 1;

    let expiry_store = store.clone();
    let expiry_generation = generation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(ttl).await;
        if expiry_generation.load(Ordering::SeqCst) != my_generation {
            return;
        }
        if let Err(err) = expiry_store.release_run_fencing_token(run_id, token).await {
            tracing::warn!(%run_id, %err, "fencing lease expiry release failed");
        }
    });

    Ok(Some(FencingLease {
        run_id,
        token,
        generation,
        my_generation,
    }))
}

pub async fn release_lease(
    store: &dyn DurableStore,
    lease: FencingLease,
) -> Result<()> {
    if !lease.is_current() {
        return Err(StateError::FencingTokenStale {
            run_id: lease.run_id.to_string(),
        });
    }
    let released = store
        .release_run_fencing_token(lease.run_id, lease.token)
        .await?;
    if !released {
        return Err(StateError::NoFencingToken {
            run_id: lease.run_id.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cp_store::{InMemoryStore, Plan, Run, RunState};
    use cp_base::{OrgId, UserId};

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
    async fn second_acquire_fails_while_first_holds_the_lease() {
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
        let run = store.create_run(sample_run()).await.unwrap();
        let generation = Arc::new(AtomicU64::new(0));

        let first = acquire_lease(
            store.clone(),
            run.id,
            Duration::from_secs(60),
            generation.clone(),
        )
        .await
        .unwrap();
        assert!(first.is_some());

        let second = acquire_lease(store, run.id, Duration::from_secs(60), generation)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn release_then_reacquire_succeeds() {
        let store: Arc<dyn DurableStore> = Arc::new(InMemoryStore::new());
        let run = store.create_run(sample_run()).await.unwrap();
        let generation = Arc::new(AtomicU64::new(0));

        let lease = acquire_lease(
            store.clone(),
            run.id,
            Duration::from_secs(60),
            generation.clone(),
        )
        .await
        .unwrap()
        .unwrap();

        release_lease(store.as_ref(), lease).await.unwrap();

        let reacquired = acquire_lease(store, run.id, Duration::from_secs(60), generation)
            .await
            .unwrap();
        assert!(reacquired.is_some());
    }
}
