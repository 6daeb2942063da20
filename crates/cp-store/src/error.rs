use thiserror::Error;

/// Errors a Durable Store implementation can return.
///
/// `ConcurrencyConflict` and `InvalidTransition` are not failures of the
/// store itself — they are the expected outcome of a caller racing
/// another writer or requesting an illegal state change — but they are
/// still typed errors rather than booleans so callers cannot accidentally
/// ignore them.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("subtask {subtask_id} not found")]
    SubtaskNotFound { subtask_id: String },

    #[error(
        "invalid transition from {from} to {to}: not in the allowed transition table"
    )]
    InvalidTransition { from: String, to: String },

    #[error(
        "concurrency conflict: expected state_version {expected}, store has {actual}"
    )]
    ConcurrencyConflict { expected: u64, actual: u64 },

    #[error("fencing token conflict: token does not match the current holder")]
    FencingTokenMismatch,

    #[error("idempotency key {key} already recorded a different payload")]
    IdempotencyKeyReused { key: String },

    #[error("backing store unavailable: {reason}")]
    Unavailable { reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
