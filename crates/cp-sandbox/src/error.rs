use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox pool at max capacity ({max_pool_size})")]
    PoolExhausted { max_pool_size: usize },

    #[error("sandbox {sandbox_id} not found")]
    NotFound { sandbox_id: String },

    #[error("executor backend failed to start a sandbox: {reason}")]
    StartFailed { reason: String },

    #[error("executor backend failed: {reason}")]
    ExecFailed { reason: String },
}

pub type Result<T> = std::result::Result<T, SandboxError>;
