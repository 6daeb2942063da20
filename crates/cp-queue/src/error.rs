use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("broker unavailable: {reason}")]
    BrokerUnavailable { reason: String },

    #[error("failed to serialize job record: {reason}")]
    Serialization { reason: String },
}

pub type Result<T> = std::result::Result<T, QueueError>;

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        QueueError::Serialization {
            reason: e.to_string(),
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        QueueError::BrokerUnavailable {
            reason: e.to_string(),
        }
    }
}
