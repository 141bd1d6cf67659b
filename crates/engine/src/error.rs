use thiserror::Error;
use uuid::Uuid;

use relay_common::error::AppError;

/// Infrastructure and lookup errors raised by the engine.
///
/// Collaborator failures never show up here: they are classified into a
/// `StageOutcome` inside the executor.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Notification {0} not found")]
    NotFound(Uuid),

    #[error("No notification matches provider reference '{0}'")]
    UnknownReference(String),

    #[error("Provider reference '{0}' matches more than one notification")]
    AmbiguousReference(String),

    #[error("Status update for notification {0} kept losing to concurrent writers")]
    Contention(Uuid),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Database(e) => AppError::Database(e),
            EngineError::Redis(e) => AppError::Redis(e),
            EngineError::Serialization(e) => AppError::Internal(e.to_string()),
            EngineError::NotFound(id) => AppError::NotFound(format!("Notification {} not found", id)),
            e @ EngineError::UnknownReference(_) => AppError::NotFound(e.to_string()),
            e @ EngineError::AmbiguousReference(_) => AppError::Conflict(e.to_string()),
            e @ EngineError::Contention(_) => AppError::Conflict(e.to_string()),
            EngineError::Validation(msg) => AppError::Validation(msg),
            EngineError::Config(msg) => AppError::Config(msg),
        }
    }
}
