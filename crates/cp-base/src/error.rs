use thiserror::Error;

/// Errors common to every layer of the control plane.
///
/// Subsystem crates (`cp-state`, `cp-billing`, `cp-ot`, ...) define their
/// own richer error enums and wrap a [`CoreError`] via `#[from]` where a
/// shared-vocabulary failure (a bad id, a store outage) bubbles up through
/// them.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid id: {reason}")]
    InvalidId { reason: String },

    #[error("durable store unavailable: {reason}")]
    StoreUnavailable { reason: String },

    #[error("operation timed out after {elapsed_ms} ms")]
    Timeout { elapsed_ms: u64 },
}
