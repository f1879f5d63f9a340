use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend cannot be reached. Callers should map this to a
    /// retriable response rather than discarding state.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid cache key: {0}")]
    InvalidKey(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Whether this error means the backend is unreachable (as opposed to a
    /// bad request or corrupt data).
    pub fn is_unavailable(&self) -> bool {
        match self {
            StorageError::Unavailable(_) => true,
            StorageError::Redis(e) => e.is_connection_refusal() || e.is_timeout() || e.is_io_error(),
            StorageError::Io(_) => true,
            _ => false,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
