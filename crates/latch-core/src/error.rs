use thiserror::Error;

/// Core error type for latch operations.
#[derive(Error, Debug)]
pub enum LatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The coordination backend could not be reached. Transient.
    #[error("Coordination backend unavailable: {0}")]
    Connectivity(String),

    #[error("Database error: {0}")]
    Database(String),

    /// An identical record already exists; callers treat this as success.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// The record was already removed; callers log and continue.
    #[error("Already gone: {0}")]
    AlreadyGone(String),

    /// Same key, different payload.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Version mismatch: {0}")]
    VersionMismatch(String),

    #[error("No leader: {0}")]
    NoLeader(String),

    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LatchError {
    /// Whether a retry of the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connectivity(_) | Self::Database(_) | Self::Sql(_) | Self::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for LatchError {
    fn from(e: serde_json::Error) -> Self {
        LatchError::Serialization(e.to_string())
    }
}

/// Result type alias using LatchError.
pub type Result<T> = std::result::Result<T, LatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(LatchError::Connectivity("down".into()).is_retryable());
        assert!(LatchError::Timeout("slow".into()).is_retryable());
        assert!(!LatchError::ProtocolViolation("reuse".into()).is_retryable());
        assert!(!LatchError::AlreadyGone("txn".into()).is_retryable());
    }

    #[test]
    fn test_from_serde_error() {
        let err = serde_json::from_str::<u64>("nope").unwrap_err();
        let err: LatchError = err.into();
        assert!(matches!(err, LatchError::Serialization(_)));
    }
}
