use thiserror::Error;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error(transparent)]
    Store(#[from] cp_store::StoreError),

    #[error("insufficient credits: available {available}, requested {requested}")]
    InsufficientCredits {
        available: cp_base::Money,
        requested: cp_base::Money,
    },

    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
}

pub type Result<T> = std::result::Result<T, BillingError>;
