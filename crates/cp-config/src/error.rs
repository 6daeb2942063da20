use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(String),

    #[error("environment variable {name} has invalid value {value:?}: {reason}")]
    InvalidVar {
        name: String,
        value: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;
