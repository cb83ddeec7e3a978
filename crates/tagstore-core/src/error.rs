//! Error types shared by every store backend.

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while talking to the key-value backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Stored data could not be interpreted. Treated as a backend
    /// data-integrity fault, never as a caller input error.
    #[error("Service unavailable: {message}")]
    ServiceUnavailable {
        /// What was wrong with the stored data.
        message: String,
    },

    /// The backend rejected or failed a command.
    #[error("Store backend error: {0}")]
    Backend(String),

    /// The connection could not be established or was lost.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The key holds a value of another type (string vs hash vs list).
    #[error("Operation against a key holding the wrong kind of value: {key}")]
    WrongType {
        /// The offending key.
        key: String,
    },

    /// The connection was closed with `quit` and no longer accepts commands.
    #[error("Connection is closed")]
    NotConnected,
}

impl StoreError {
    /// Create a service unavailable error.
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        StoreError::ServiceUnavailable {
            message: message.into(),
        }
    }

    /// Create a backend error.
    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend(message.into())
    }

    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        StoreError::Connection(message.into())
    }

    /// Create a wrong type error for the given key.
    pub fn wrong_type(key: impl Into<String>) -> Self {
        StoreError::WrongType { key: key.into() }
    }

    /// Returns true for the data-integrity class of errors.
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, StoreError::ServiceUnavailable { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}
