//! Errors returned across the public API.

use crate::storage::EngineError;

/// Errors that can occur in database operations.
#[derive(Debug, Clone, PartialEq)]
pub enum DbError {
    /// Another connection prevented the version bump; not retried.
    SchemaUpgradeBlocked,
    /// A condition references a field with no index.
    IndexNotFound { store: String, index: String },
    /// The named store does not exist.
    StoreNotFound(String),
    /// `reopen` was called before any `open_av`.
    NotOpened,
    /// The index specification is malformed.
    InvalidSpec(String),
    /// A stored record could not be (de)serialized.
    Serialization(String),
    /// An opaque failure from the storage engine.
    Provider(String),
}

impl std::fmt::Display for DbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbError::SchemaUpgradeBlocked => write!(f, "Schema upgrade blocked"),
            DbError::IndexNotFound { store, index } => {
                write!(f, "Index not found: {}/{} (add it to the schema)", store, index)
            }
            DbError::StoreNotFound(name) => write!(f, "Store not found: {}", name),
            DbError::NotOpened => write!(f, "Database not opened, call open_av first"),
            DbError::InvalidSpec(msg) => write!(f, "Invalid index specification: {}", msg),
            DbError::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            DbError::Provider(msg) => write!(f, "Storage error: {}", msg),
        }
    }
}

impl std::error::Error for DbError {}

impl From<EngineError> for DbError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Blocked => DbError::SchemaUpgradeBlocked,
            EngineError::StoreNotFound(name) => DbError::StoreNotFound(name),
            EngineError::IndexNotFound { store, index } => DbError::IndexNotFound { store, index },
            other => DbError::Provider(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::Serialization(err.to_string())
    }
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DbError>;
