use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("no connection for client {client_id}")]
    ConnectionNotFound { client_id: String },

    #[error("client {client_id} is not a member of document {document_id}")]
    NotInDocument { client_id: String, document_id: String },

    #[error("circuit breaker is open, rejecting request")]
    CircuitOpen,

    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("malformed gateway message: {reason}")]
    MalformedMessage { reason: String },

    #[error(transparent)]
    Ot(#[from] cp_ot::OtError),

    #[error("redis sync error: {0}")]
    Redis(String),
}

pub type Result<T> = std::result::Result<T, CollabError>;
