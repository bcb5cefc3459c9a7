//! Error types for concord-core

use thiserror::Error;

/// Result type alias using concord-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in concord-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Rejected input: unknown doc type, empty field path, self-referencing rule, ...
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller lacks the role required for the operation
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Rule, document, sync-state row or conflict missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Cloud adapter failure (push/pull error, expired credentials)
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// A store or adapter call exceeded its time budget
    #[error("Timed out after {millis}ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// `SQLite` error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn permission(message: impl Into<String>) -> Self {
        Self::Permission(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn adapter(message: impl Into<String>) -> Self {
        Self::Adapter(message.into())
    }

    /// Whether the failure came from the external side of a sync (adapter or its timeout).
    pub const fn is_adapter_failure(&self) -> bool {
        matches!(self, Self::Adapter(_) | Self::Timeout { .. })
    }
}
