use thiserror::Error;

#[derive(Error, Debug)]
pub enum WrenError {
    #[error("lock timeout: could not acquire '{lock}' for operation '{operation}' within {waited_ms}ms")]
    LockTimeout {
        lock: String,
        operation: String,
        waited_ms: u64,
    },

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("request exhausted retries: {request_id}")]
    QueueExhausted { request_id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WrenError {
    /// Whether a failed outbound request carrying this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WrenError::Network(_) | WrenError::LockTimeout { .. })
    }
}

pub type WrenResult<T> = Result<T, WrenError>;
