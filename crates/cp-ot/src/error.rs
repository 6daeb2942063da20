use thiserror::Error;

#[derive(Debug, Error)]
pub enum OtError {
    #[error("invalid operation: {reason}")]
    InvalidOperation { reason: String },

    #[error("operations in a batch must not overlap")]
    OverlappingOperations,

    #[error("batch version {batch_version} does not match document version {document_version}")]
    VersionMismatch {
        batch_version: u64,
        document_version: u64,
    },

    #[error("a batch version {batch_version} is ahead of document version {document_version}")]
    VersionAhead {
        batch_version: u64,
        document_version: u64,
    },

    #[error("no checkpoint or history available for version {version}")]
    VersionNotFound { version: u64 },
}

pub type Result<T> = std::result::Result<T, OtError>;
