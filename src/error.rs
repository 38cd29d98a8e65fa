// for error definitions
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResilienceError {
    /// The protected call exceeded the breaker's timeout
    #[error("Call to '{dependency}' timed out after {elapsed_ms}ms")]
    Timeout { dependency: String, elapsed_ms: u64 },

    /// Connection-level failure reaching the dependency
    #[error("Connection error: {0}")]
    Connection(String),

    /// The dependency answered with a server-side (5xx-equivalent) failure
    #[error("Upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    /// The protected call panicked instead of returning
    #[error("Protected call panicked: {0}")]
    Panicked(String),

    /// The request itself was invalid; retrying cannot help
    #[error("Validation error: {0}")]
    Validation(String),

    /// The requested entity does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The caller is not allowed to perform the request
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The breaker rejected the call without attempting it
    #[error("Circuit open for dependency '{dependency}'")]
    CircuitOpen { dependency: String },

    /// Errors related to durable fallback persistence
    #[error("Storage error: {0}")]
    Storage(StorageError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Fallback persistence errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Filesystem errors while writing or reading records
    #[error("I/O error: {0}")]
    Io(String),

    /// Data serialization/deserialization errors
    #[error("Data serialization error: {0}")]
    Serialization(String),

    /// A queue file exists but does not hold a valid record
    #[error("Corrupt record '{0}'")]
    CorruptRecord(String),
}

/// Coarse classification used for logging and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
    Rejected,
    Internal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
            ErrorClass::Rejected => "rejected",
            ErrorClass::Internal => "internal",
        }
    }
}

impl ResilienceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ResilienceError::Timeout { .. }
            | ResilienceError::Connection(_)
            | ResilienceError::Upstream { .. }
            | ResilienceError::Panicked(_) => ErrorClass::Transient,
            ResilienceError::Validation(_)
            | ResilienceError::NotFound(_)
            | ResilienceError::Unauthorized(_) => ErrorClass::Permanent,
            ResilienceError::CircuitOpen { .. } => ErrorClass::Rejected,
            ResilienceError::Storage(_) | ResilienceError::Config(_) => ErrorClass::Internal,
        }
    }

    /// Default retry classification: only transient failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether the breaker turned the call away without running it
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen { .. })
    }
}

impl From<std::io::Error> for ResilienceError {
    fn from(err: std::io::Error) -> Self {
        ResilienceError::Storage(StorageError::Io(err.to_string()))
    }
}

// implement conversions from serde_json::Error to ResilienceError
impl From<serde_json::Error> for ResilienceError {
    fn from(err: serde_json::Error) -> Self {
        ResilienceError::Storage(StorageError::Serialization(err.to_string()))
    }
}

// define a Result type alias for convenience
pub type Result<T> = std::result::Result<T, ResilienceError>;
