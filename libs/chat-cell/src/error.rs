use thiserror::Error;

use shared_models::error::AppError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChatError {
    #[error("Cannot resolve chat identity: {0}")]
    IdentityResolution(String),

    #[error("Chat write failed: {0}")]
    Write(String),

    #[error("Chat subscription lost: {0}")]
    Subscription(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid conversation state: {0}")]
    InvalidState(String),
}

impl ChatError {
    /// Transient store failures; everything else fails the same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::Write(_))
    }
}

impl From<redis::RedisError> for ChatError {
    fn from(e: redis::RedisError) -> Self {
        ChatError::Write(format!("redis: {}", e))
    }
}

impl From<deadpool_redis::PoolError> for ChatError {
    fn from(e: deadpool_redis::PoolError) -> Self {
        ChatError::Write(format!("redis pool: {}", e))
    }
}

impl From<serde_json::Error> for ChatError {
    fn from(e: serde_json::Error) -> Self {
        ChatError::Write(format!("serialization: {}", e))
    }
}

impl From<ChatError> for AppError {
    fn from(e: ChatError) -> Self {
        match e {
            ChatError::Validation(msg) => AppError::ValidationError(msg),
            ChatError::NotFound(msg) => AppError::NotFound(msg),
            ChatError::InvalidState(msg) => AppError::BadRequest(msg),
            ChatError::IdentityResolution(msg) => {
                AppError::ExternalService(format!("Cannot start chat: {}", msg))
            }
            ChatError::Write(msg) => AppError::ExternalService(msg),
            ChatError::Subscription(msg) => AppError::ServiceUnavailable(msg),
        }
    }
}
