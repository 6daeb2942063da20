//! The Durable Store port: stored-procedure contracts
//! (`transition_run_state`, `acquire_run_fencing_token`,
//! `record_token_call`, ...) expressed as an async trait, plus an
//! in-memory reference implementation used by every other crate's tests.
//!
//! Implementers should place state-transition, fencing, and billing
//! logic behind atomic, named operations — never compose them as
//! multiple client round-trips — exactly as a real stored procedure
//! would. The in-memory implementation in this crate enforces that by
//! construction: each trait method takes its own lock and does not let
//! a caller observe an intermediate state.

pub mod entities;
pub mod error;
mod memory;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use cp_base::{OrgId, RunId, SubtaskId};
use uuid::Uuid;

pub use entities::*;
pub use error::StoreError;
pub use memory::InMemoryStore;

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn create_run(&self, run: Run) -> Result<Run>;
    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>>;
    async fn get_stalled_runs(&self, threshold: Duration) -> Result<Vec<Run>>;

    async fn create_subtask(&self, subtask: Subtask) -> Result<Subtask>;
    async fn get_subtask(&self, subtask_id: SubtaskId) -> Result<Option<Subtask>>;
    async fn get_subtasks_by_run(
        &self,
        run_id: RunId,
        states: Option<&[SubtaskState]>,
    ) -> Result<Vec<Subtask>>;
    async fn get_subtask_counts_by_state(
        &self,
        run_id: RunId,
    ) -> Result<HashMap<SubtaskState, u64>>;
    async fn check_subtask_ready(&self, subtask_id: SubtaskId) -> Result<bool>;
    /// All subtasks currently in any of `states`, across every run. Used
    /// by the queue's reconciler loop to recover jobs the broker lost.
    async fn get_subtasks_in_state(&self, states: &[SubtaskState]) -> Result<Vec<Subtask>>;

    async fn acquire_run_fencing_token(
        &self,
        run_id: RunId,
        ttl: Duration,
    ) -> Result<FencingAcquisition>;
    async fn release_run_fencing_token(&self, run_id: RunId, token: Uuid) -> Result<bool>;

    async fn transition_run_state(
        &self,
        req: RunTransitionRequest,
    ) -> Result<TransitionOutcome>;
    async fn transition_subtask_state(
        &self,
        req: SubtaskTransitionRequest,
    ) -> Result<TransitionOutcome>;

    async fn record_token_call(&self, req: TokenCallRequest) -> Result<TokenRecord>;
    async fn get_credit_balance(&self, org_id: OrgId) -> Result<CreditBalance>;
    async fn add_credits(&self, org_id: OrgId, amount: cp_base::Money, reason: &str)
        -> Result<CreditBalance>;
    async fn reconcile_run(&self, run_id: RunId) -> Result<ReconciliationRow>;

    async fn get_model_pricing(
        &self,
        model: &str,
        provider: cp_base::Provider,
    ) -> Result<Option<ModelPricing>>;
    async fn set_model_pricing(&self, pricing: ModelPricing) -> Result<()>;

    async fn record_audit_event(&self, event: AuditEvent) -> Result<()>;

    /// Every audit event touching `run_id` or one of its subtasks,
    /// ordered by `created_at`, optionally filtered to events recorded
    /// after `since`. Backs the HTTP `logs` and `events`/`stream`
    /// surfaces
    async fn list_audit_events_for_run(
        &self,
        run_id: RunId,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<AuditEvent>>;
}
