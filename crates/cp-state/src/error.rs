use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Store(#[from] cp_store::StoreError),

    #[error("run {run_id} has no fencing token held")]
    NoFencingToken { run_id: String },

    #[error("fencing token for run {run_id} has expired or was superseded")]
    FencingTokenStale { run_id: String },

    #[error("subtask {subtask_id} is not ready: unmet dependency {dependency}")]
    DependencyNotReady { subtask_id: String, dependency: String },
}

pub type Result<T> = std::result::Result<T, StateError>;
