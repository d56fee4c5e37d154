use kb_telegram::TelegramError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;
pub type QueueResult<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Operation name outside the supported set.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Call shape the platform would reject (missing target, bad options).
    #[error("invalid call: {0}")]
    InvalidCall(String),

    #[error("malformed envelope: {0}")]
    Envelope(String),

    #[error("enqueue failed: {0}")]
    Enqueue(#[from] QueueError),

    #[error(transparent)]
    Api(#[from] TelegramError),
}

impl From<serde_json::Error> for DispatchError {
    fn from(e: serde_json::Error) -> Self {
        Self::Envelope(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to connect to {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("queue operation failed: {0}")]
    OperationFailed(String),

    #[error("consumer lease for {key} is held by {holder}")]
    LeaseHeld { key: String, holder: String },
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        Self::OperationFailed(e.to_string())
    }
}
