//! Schema differ.
//!
//! Compares a declared `IndexSpec` against a `LiveSchema` and produces the
//! ordered operations that bring the live schema in line:
//!
//! 1. Declared store missing live: `CreateStore`, then `CreateIndex` per field.
//! 2. Declared store present: per declared field, `CreateIndex` when missing,
//!    or `DeleteIndex` + `CreateIndex` when its definition changed; then
//!    `DeleteIndex` for live indices no longer declared.
//! 3. Live stores absent from the declaration are left alone.
//!
//! There is no alter primitive, so a changed index is always replaced.

use crate::schema::live::{IndexInfo, LiveSchema, StoreInfo};
use crate::schema::IndexSpec;
use crate::storage::{EngineError, KeyPath};

/// Primary key path of every store created by reconciliation.
pub const PRIMARY_KEY: &str = "id";

/// One structural change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaOp {
    CreateStore {
        store: String,
        key_path: Option<KeyPath>,
        auto_increment: bool,
    },
    DeleteStore {
        store: String,
    },
    CreateIndex {
        store: String,
        index: IndexInfo,
    },
    DeleteIndex {
        store: String,
        name: String,
    },
}

impl std::fmt::Display for SchemaOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaOp::CreateStore { store, .. } => write!(f, "CREATE_STORE({})", store),
            SchemaOp::DeleteStore { store } => write!(f, "DELETE_STORE({})", store),
            SchemaOp::CreateIndex { store, index } => write!(
                f,
                "CREATE_INDEX({}, {}, {}, unique={}, multiEntry={})",
                store, index.name, index.key_path, index.unique, index.multi_entry
            ),
            SchemaOp::DeleteIndex { store, name } => write!(f, "DELETE_INDEX({}, {})", store, name),
        }
    }
}

/// Ordered list of schema operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDelta {
    ops: Vec<SchemaOp>,
}

impl SchemaDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: SchemaOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[SchemaOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Delta removing one store, for explicit caller-requested drops.
    pub fn drop_store(store: &str) -> Self {
        Self {
            ops: vec![SchemaOp::DeleteStore {
                store: store.to_string(),
            }],
        }
    }
}

impl From<Vec<SchemaOp>> for SchemaDelta {
    fn from(ops: Vec<SchemaOp>) -> Self {
        Self { ops }
    }
}

/// Computes the operations turning `live` into `spec`.
///
/// Output order is stable for identical inputs, so re-diffing after the
/// delta has been applied yields an empty delta.
pub fn compute_delta(spec: &IndexSpec, live: &LiveSchema) -> SchemaDelta {
    let mut delta = SchemaDelta::new();

    for store in spec.stores() {
        let Some(live_store) = live.store(&store.name) else {
            delta.push(SchemaOp::CreateStore {
                store: store.name.clone(),
                key_path: Some(KeyPath::Single(PRIMARY_KEY.to_string())),
                auto_increment: true,
            });
            for field in &store.fields {
                delta.push(SchemaOp::CreateIndex {
                    store: store.name.clone(),
                    index: IndexInfo::from_decl(field),
                });
            }
            continue;
        };

        for field in &store.fields {
            match live_store.index(&field.path) {
                Some(existing) if existing.matches(field) => {}
                Some(_) => {
                    delta.push(SchemaOp::DeleteIndex {
                        store: store.name.clone(),
                        name: field.path.clone(),
                    });
                    delta.push(SchemaOp::CreateIndex {
                        store: store.name.clone(),
                        index: IndexInfo::from_decl(field),
                    });
                }
                None => delta.push(SchemaOp::CreateIndex {
                    store: store.name.clone(),
                    index: IndexInfo::from_decl(field),
                }),
            }
        }

        for index in &live_store.indices {
            if !store.fields.iter().any(|f| f.path == index.name) {
                delta.push(SchemaOp::DeleteIndex {
                    store: store.name.clone(),
                    name: index.name.clone(),
                });
            }
        }
    }

    delta
}

/// Structural edits available inside an upgrade.
pub trait SchemaEditor {
    fn create_store(
        &mut self,
        name: &str,
        key_path: Option<&KeyPath>,
        auto_increment: bool,
    ) -> Result<(), EngineError>;

    fn delete_store(&mut self, name: &str) -> Result<(), EngineError>;

    fn create_index(&mut self, store: &str, index: &IndexInfo) -> Result<(), EngineError>;

    fn delete_index(&mut self, store: &str, name: &str) -> Result<(), EngineError>;
}

/// Applies `delta` in order, stopping at the first failure.
pub fn apply_delta(delta: &SchemaDelta, editor: &mut impl SchemaEditor) -> Result<(), EngineError> {
    for op in delta.ops() {
        log::debug!("Applying {}", op);
        match op {
            SchemaOp::CreateStore {
                store,
                key_path,
                auto_increment,
            } => editor.create_store(store, key_path.as_ref(), *auto_increment)?,
            SchemaOp::DeleteStore { store } => editor.delete_store(store)?,
            SchemaOp::CreateIndex { store, index } => editor.create_index(store, index)?,
            SchemaOp::DeleteIndex { store, name } => editor.delete_index(store, name)?,
        }
    }
    Ok(())
}

/// A snapshot can be edited directly, which predicts the post-upgrade schema.
impl SchemaEditor for LiveSchema {
    fn create_store(
        &mut self,
        name: &str,
        key_path: Option<&KeyPath>,
        auto_increment: bool,
    ) -> Result<(), EngineError> {
        if self.store(name).is_some() {
            return Err(EngineError::Constraint(format!("store {} exists", name)));
        }
        self.stores.push(StoreInfo {
            name: name.to_string(),
            key_path: key_path.cloned(),
            auto_increment,
            indices: Vec::new(),
        });
        self.stores.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(())
    }

    fn delete_store(&mut self, name: &str) -> Result<(), EngineError> {
        let before = self.stores.len();
        self.stores.retain(|s| s.name != name);
        if self.stores.len() == before {
            return Err(EngineError::StoreNotFound(name.to_string()));
        }
        Ok(())
    }

    fn create_index(&mut self, store: &str, index: &IndexInfo) -> Result<(), EngineError> {
        let info = self
            .stores
            .iter_mut()
            .find(|s| s.name == store)
            .ok_or_else(|| EngineError::StoreNotFound(store.to_string()))?;
        if info.index(&index.name).is_some() {
            return Err(EngineError::Constraint(format!("index {} exists", index.name)));
        }
        info.indices.push(index.clone());
        info.indices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(())
    }

    fn delete_index(&mut self, store: &str, name: &str) -> Result<(), EngineError> {
        let info = self
            .stores
            .iter_mut()
            .find(|s| s.name == store)
            .ok_or_else(|| EngineError::StoreNotFound(store.to_string()))?;
        let before = info.indices.len();
        info.indices.retain(|i| i.name != name);
        if info.indices.len() == before {
            return Err(EngineError::IndexNotFound {
                store: store.to_string(),
                index: name.to_string(),
            });
        }
        Ok(())
    }
}
