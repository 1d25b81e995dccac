//! Transactional object-store engine abstraction.
//!
//! This module defines the platform-agnostic interface the document layer is
//! written against. On WASM targets, `IdbBackend` drives the browser's
//! IndexedDB. On every target, `MemoryBackend` provides an in-process engine
//! with the same versioning, upgrade and index semantics (used by native
//! hosts and by the test suite).
//!
//! Note: These traits do not require `Send` bounds since WASM is
//! single-threaded and JS types cannot be sent between threads.

#[cfg(target_arch = "wasm32")]
mod indexeddb;
pub mod key;
pub mod memory;

#[cfg(target_arch = "wasm32")]
pub use indexeddb::IdbBackend;
pub use key::{Key, KeyPath, KeyRange};
pub use memory::MemoryBackend;

use crate::schema::delta::SchemaDelta;
use crate::schema::live::LiveSchema;
use serde_json::Value;
use std::future::Future;

/// Errors reported by a storage engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// A version change was refused because other connections stayed open.
    Blocked,
    /// The requested version is lower than the stored one.
    Version { requested: u32, current: u32 },
    /// The named object store does not exist (or is outside the transaction).
    StoreNotFound(String),
    /// The named index does not exist on the store.
    IndexNotFound { store: String, index: String },
    /// A unique index or primary key constraint was violated.
    Constraint(String),
    /// A write was issued in a read-only transaction.
    ReadOnly,
    /// A value could not be used as a key.
    InvalidKey(String),
    /// The connection or transaction is no longer usable.
    InvalidState(String),
    /// Any other failure surfaced by the underlying platform.
    Provider(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Blocked => write!(f, "Version change blocked by open connections"),
            EngineError::Version { requested, current } => write!(
                f,
                "Requested version {} is lower than current version {}",
                requested, current
            ),
            EngineError::StoreNotFound(name) => write!(f, "Object store not found: {}", name),
            EngineError::IndexNotFound { store, index } => {
                write!(f, "Index not found: {}/{}", store, index)
            }
            EngineError::Constraint(msg) => write!(f, "Constraint violated: {}", msg),
            EngineError::ReadOnly => write!(f, "Write in read-only transaction"),
            EngineError::InvalidKey(msg) => write!(f, "Invalid key: {}", msg),
            EngineError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            EngineError::Provider(msg) => write!(f, "Storage provider error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {}

/// Transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// A storage engine holding named, versioned databases.
pub trait Backend: Clone + 'static {
    type Connection: Connection;

    /// Opens a database.
    ///
    /// With `version = None` the database opens at its current version, or is
    /// created empty at version 1. When `version` exceeds the stored version,
    /// `upgrade` is applied inside the exclusive upgrade step; the whole delta
    /// is applied or the open fails and nothing changes.
    fn open(
        &self,
        name: &str,
        version: Option<u32>,
        upgrade: Option<SchemaDelta>,
    ) -> impl Future<Output = Result<Self::Connection, EngineError>>;

    /// Deletes a database. Succeeds if it did not exist.
    fn delete_database(&self, name: &str) -> impl Future<Output = Result<(), EngineError>>;
}

/// An open connection bound to one schema version.
pub trait Connection {
    type Transaction: Transaction;

    fn name(&self) -> &str;

    fn version(&self) -> u32;

    /// Reads the live schema from the connection's metadata.
    fn schema(&self) -> impl Future<Output = Result<LiveSchema, EngineError>>;

    /// Starts a transaction over `stores`.
    fn transaction(&self, stores: &[&str], mode: TxMode)
        -> Result<Self::Transaction, EngineError>;

    /// Closes the connection. Closing twice is a no-op.
    fn close(&self);
}

/// A transaction over a fixed set of stores.
///
/// Requests run in issuance order. A failed request reports its error and
/// leaves the rest of the transaction usable.
pub trait Transaction {
    /// Adds a value; fails if the primary key already exists.
    fn add(&self, store: &str, value: &Value) -> impl Future<Output = Result<Key, EngineError>>;

    /// Inserts or replaces a value.
    fn put(&self, store: &str, value: &Value) -> impl Future<Output = Result<Key, EngineError>>;

    fn get(
        &self,
        store: &str,
        key: &Key,
    ) -> impl Future<Output = Result<Option<Value>, EngineError>>;

    /// Values in primary key order.
    fn get_all(
        &self,
        store: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> impl Future<Output = Result<Vec<Value>, EngineError>>;

    fn delete(&self, store: &str, key: &Key) -> impl Future<Output = Result<(), EngineError>>;

    fn clear(&self, store: &str) -> impl Future<Output = Result<(), EngineError>>;

    fn count(
        &self,
        store: &str,
        range: Option<&KeyRange>,
    ) -> impl Future<Output = Result<u64, EngineError>>;

    /// First value whose index key falls in `range`.
    fn index_get(
        &self,
        store: &str,
        index: &str,
        range: &KeyRange,
    ) -> impl Future<Output = Result<Option<Value>, EngineError>>;

    /// Values in index key order, then primary key order.
    fn index_get_all(
        &self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
        limit: Option<u32>,
    ) -> impl Future<Output = Result<Vec<Value>, EngineError>>;

    fn index_count(
        &self,
        store: &str,
        index: &str,
        range: Option<&KeyRange>,
    ) -> impl Future<Output = Result<u64, EngineError>>;

    /// Waits for the transaction to complete.
    fn done(self) -> impl Future<Output = Result<(), EngineError>>;
}
