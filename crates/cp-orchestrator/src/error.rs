use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] cp_store::StoreError),

    #[error(transparent)]
    State(#[from] cp_state::StateError),

    #[error(transparent)]
    Queue(#[from] cp_queue::QueueError),

    #[error(transparent)]
    Sandbox(#[from] cp_sandbox::SandboxError),

    #[error(transparent)]
    Billing(#[from] cp_billing::BillingError),

    #[error("run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("subtask {subtask_id} not found")]
    SubtaskNotFound { subtask_id: String },

    #[error("run {run_id} has no fencing token held by this driver")]
    NotLeaseHolder { run_id: String },

    #[error("run {run_id} was submitted with an empty plan")]
    EmptyPlan { run_id: String },

    #[error("subtask {subtask_id} has no reserved sandbox to release")]
    NoSandboxReserved { subtask_id: String },
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
