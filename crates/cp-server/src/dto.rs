//! Wire-shape request bodies. Kept distinct from `cp_store::entities` so
//! a malformed body is always a `400 VALIDATION`, never a serde error
//! leaking field names the store types don't even expose (e.g. a run's
//! server-assigned `id`/`state`/`fencing_token`).

use chrono::{DateTime, Utc};
use cp_base::{Provider, SubtaskId};
use cp_store::{Plan, PlanPhase};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct PlanPhaseRequest {
    pub phase_number: u32,
    pub description: String,
}

/// A run is submitted with its plan already approved (the core treats
/// planning as an external, model-client-driven step it doesn't perform
/// itself); an empty or omitted plan is valid input but will fail the
/// `validating -> planning` transition, which requires at least one phase.
#[derive(Debug, Deserialize)]
pub struct CreateRunRequest {
    pub priority: Option<u32>,
    pub deadline_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub plan: Vec<PlanPhaseRequest>,
}

impl CreateRunRequest {
    pub fn plan(&self) -> Plan {
        Plan {
            phases: self
                .plan
                .iter()
                .map(|p| PlanPhase { phase_number: p.phase_number, description: p.description.clone() })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NewSubtaskRequest {
    pub subtask_index: u32,
    pub task_type: String,
    #[serde(default)]
    pub dependencies: Vec<SubtaskId>,
    pub input: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct IngestSubtasksRequest {
    pub subtasks: Vec<NewSubtaskRequest>,
}

#[derive(Debug, Deserialize)]
pub struct TokenUsageRequest {
    pub model: String,
    pub provider: Provider,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub idempotency_key: String,
}

#[derive(Debug, Deserialize)]
pub struct CompleteSubtaskRequest {
    pub output: serde_json::Value,
    pub usage: Option<TokenUsageRequest>,
}

#[derive(Debug, Deserialize)]
pub struct FailSubtaskRequest {
    pub error: String,
}

#[derive(Debug, Deserialize)]
pub struct SinceQuery {
    pub since: Option<DateTime<Utc>>,
}
