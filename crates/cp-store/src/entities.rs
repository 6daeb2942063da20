use chrono::{DateTime, Utc};
use cp_base::{Money, OrgId, Provider, RunId, SubtaskId, UserId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Run lifecycle states. Terminal states have no outgoing
/// transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Validating,
    Planning,
    Executing,
    WaitingUser,
    Paused,
    Synthesizing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed | RunState::Failed | RunState::Cancelled | RunState::Timeout
        )
    }

    /// The transition table, as a predicate.
    pub fn can_transition_to(&self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (Created, Validating | Cancelled)
                | (Validating, Planning | Failed | Cancelled)
                | (Planning, Executing | Failed | Cancelled)
                | (
                    Executing,
                    Synthesizing | WaitingUser | Paused | Failed | Cancelled | Timeout
                )
                | (WaitingUser, Executing | Cancelled)
                | (Paused, Executing | Cancelled)
                | (Synthesizing, Completed | Failed | Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskState {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SubtaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubtaskState::Completed | SubtaskState::Cancelled
        )
    }

    /// The `Failed -> Pending` retry edge is unconditional here; the
    /// caller is responsible for the `attempt_count < max` guard that
    /// gates whether a retry is actually attempted.
    pub fn can_transition_to(&self, to: SubtaskState) -> bool {
        use SubtaskState::*;
        matches!(
            (self, to),
            (Pending, Queued | Cancelled)
                | (Queued, Running | Cancelled)
                | (Running, Completed | Failed | Cancelled)
                | (Failed, Pending)
        )
    }
}

/// One phase of an approved execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPhase {
    pub phase_number: u32,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Plan {
    pub phases: Vec<PlanPhase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub user_id: UserId,
    pub org_id: OrgId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: RunState,
    pub state_version: u64,
    pub fencing_token: Option<Uuid>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub plan: Plan,
    pub current_phase_number: u32,
    pub error: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub priority: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub run_id: RunId,
    pub subtask_index: u32,
    pub task_type: String,
    pub state: SubtaskState,
    pub state_version: u64,
    pub attempt_count: u32,
    pub assigned_worker_id: Option<String>,
    pub checkpoint_id: Option<String>,
    pub dependencies: Vec<SubtaskId>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct RunTransitionRequest {
    pub run_id: RunId,
    pub from_state: RunState,
    pub to_state: RunState,
    pub expected_state_version: u64,
    pub transitioned_by: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubtaskTransitionRequest {
    pub subtask_id: SubtaskId,
    pub from_state: SubtaskState,
    pub to_state: SubtaskState,
    pub expected_state_version: u64,
    pub transitioned_by: String,
    pub reason: Option<String>,
    pub result_data: Option<serde_json::Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub succeeded: bool,
    pub new_state_version: u64,
}

#[derive(Debug, Clone)]
pub struct FencingAcquisition {
    pub acquired: bool,
    pub run: Option<Run>,
    pub token: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: Uuid,
    pub run_id: RunId,
    pub org_id: OrgId,
    pub model: String,
    pub provider: Provider,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: Money,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct TokenCallRequest {
    pub run_id: RunId,
    pub org_id: OrgId,
    pub model: String,
    pub provider: Provider,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: Money,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CreditBalance {
    pub org_id: OrgId,
    pub balance_usd: Money,
    pub reserved_usd: Money,
    pub low_balance_threshold: Money,
    pub auto_recharge: bool,
}

impl CreditBalance {
    pub fn available(&self) -> Money {
        self.balance_usd
            .checked_sub(self.reserved_usd)
            .unwrap_or(Money::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerTransactionType {
    Charge,
    Refund,
    CreditPurchase,
    Adjustment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub org_id: OrgId,
    pub transaction_type: LedgerTransactionType,
    pub amount_usd: Money,
    pub reason: String,
    pub token_record_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    pub provider: Provider,
    pub input_per_million: Money,
    pub output_per_million: Money,
    pub effective_from: DateTime<Utc>,
    pub effective_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Ok,
    Drifting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRow {
    pub run_id: RunId,
    pub estimated_total: Money,
    pub actual_total: Money,
    pub variance_pct: f64,
    pub status: ReconciliationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub entity: String,
    pub entity_id: String,
    pub event: String,
    pub actor: String,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}
