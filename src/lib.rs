#![warn(clippy::all)]

//! Document storage over a transactional object-store engine.
//!
//! Adds to the raw engine:
//! - automatic schema versioning: a declared index specification is diffed
//!   against the live schema and a version bump happens only on change
//! - a document CRUD API with index-based conditions
//! - an inverted full-text index maintained in the background
//! - an optional per-store operation history
//!
//! ## Engines
//! - `MemoryBackend`: in-process, every target
//! - `IdbBackend`: browser IndexedDB, wasm32 only
//!
//! ### Storage Layout
//! ```text
//! <database>
//! ├── <your stores>  - documents keyed by auto-increment `id`
//! ├── fts_words      - (store, term) -> document ids
//! ├── fts_ids        - (store, document id) -> terms
//! └── op_hist        - per-store operation history
//! ```
//!
//! ```ignore
//! let db = Database::new(IdbBackend::new(), DatabaseConfig::new().with_fts(FtsConfig::enabled()));
//! let spec = IndexSpec::new().with_store("notes", [("title", FieldType::UniqueSingle)]);
//! db.open_av("notes-db", &spec).await?;
//! db.insert_one("notes", &json!({"title": "hello world"})).await?;
//! let hits = db.find_many_by_terms("notes", "world").await?;
//! ```

pub mod background;
pub mod config;
pub mod connection;
pub mod crud;
pub mod error;
pub mod fts;
pub mod history;
pub mod schema;
pub mod storage;

pub use config::{DatabaseConfig, FtsConfig, HistoryConfig};
pub use connection::ConnectionManager;
pub use crud::{Cond, Database};
pub use error::{DbError, Result};
pub use history::OpHistory;
pub use schema::{FieldType, IndexSpec};
#[cfg(target_arch = "wasm32")]
pub use storage::IdbBackend;
pub use storage::{Key, KeyRange, MemoryBackend};
