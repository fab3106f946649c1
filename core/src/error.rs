use std::time::Duration;

use thiserror::Error;

/// Failure reported by a durable storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The entity's command queue shut down before the operation was handled.
    #[error("Storage queue closed")]
    Closed,
}

/// A value did not conform to the schema declared for its key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected {expected}, received {received}")]
pub struct ValidationError {
    pub expected: &'static str,
    pub received: String,
}

impl ValidationError {
    pub fn new(expected: &'static str, received: impl Into<String>) -> Self {
        Self {
            expected,
            received: received.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum KvError {
    /// Key is not part of the store's declared schema. Always a programming
    /// mistake; never retried.
    #[error("Unknown key '{0}' is not declared in the store schema")]
    UnknownKey(String),
    #[error("Validation failed for key '{key}': {source}")]
    Validation {
        key: String,
        #[source]
        source: ValidationError,
    },
    #[error("Failed to decode key '{key}': {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl KvError {
    pub fn is_configuration_error(&self) -> bool {
        matches!(self, KvError::UnknownKey(_))
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("Timed out after {waited:?} ({attempts} attempts) waiting for readiness")]
    Timeout { waited: Duration, attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetricsError {
    /// `blob1` and `blob2` carry server name and version.
    #[error("Slot '{0}' is reserved for server identity")]
    ReservedSlot(String),
    #[error("Slot '{0}' declared more than once")]
    DuplicateSlot(String),
    #[error("Analytics sink rejected data point: {0}")]
    Sink(String),
}

/// Machine-readable error codes shared with the tool surface.
pub mod codes {
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const STATE_UNAVAILABLE: &str = "state_unavailable";
    pub const STATE_CORRUPTED: &str = "state_corrupted";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const TIMEOUT: &str = "timeout";
}
