//! Declared index specifications.
//!
//! An `IndexSpec` maps store names to the fields indexed on each store:
//!
//! ```text
//! {
//!     "my_store": { "foo": 1, "bar": 2, "baz": 3, "foo,bar": 1, "meta.tag": 2 }
//! }
//! ```
//!
//! Field types are tagged 1..=4 (see `FieldType`). A comma-joined field path
//! declares a compound index; a dot-joined path reads a nested property.
//! Declaration order is preserved and drives the order of schema deltas.

pub mod delta;
pub mod live;

use crate::error::{DbError, Result};
use crate::storage::KeyPath;
use serde_json::Value;

/// Index flavour declared for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    NonUniqueSingle,
    NonUniqueMulti,
    UniqueSingle,
    UniqueMulti,
}

impl FieldType {
    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(FieldType::NonUniqueSingle),
            2 => Some(FieldType::NonUniqueMulti),
            3 => Some(FieldType::UniqueSingle),
            4 => Some(FieldType::UniqueMulti),
            _ => None,
        }
    }

    pub fn tag(&self) -> u64 {
        match self {
            FieldType::NonUniqueSingle => 1,
            FieldType::NonUniqueMulti => 2,
            FieldType::UniqueSingle => 3,
            FieldType::UniqueMulti => 4,
        }
    }

    pub fn unique(&self) -> bool {
        matches!(self, FieldType::UniqueSingle | FieldType::UniqueMulti)
    }

    pub fn multi_entry(&self) -> bool {
        matches!(self, FieldType::NonUniqueMulti | FieldType::UniqueMulti)
    }
}

/// One declared index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    pub path: String,
    pub field_type: FieldType,
}

impl FieldDecl {
    pub fn new(path: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            path: path.into(),
            field_type,
        }
    }

    pub fn key_path(&self) -> KeyPath {
        KeyPath::parse(&self.path)
    }
}

/// Indices declared for one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDecl {
    pub name: String,
    pub fields: Vec<FieldDecl>,
}

/// Declared stores and their indices, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSpec {
    stores: Vec<StoreDecl>,
}

impl IndexSpec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) a store declaration.
    pub fn with_store<P: Into<String>>(
        mut self,
        name: impl Into<String>,
        fields: impl IntoIterator<Item = (P, FieldType)>,
    ) -> Self {
        let decl = StoreDecl {
            name: name.into(),
            fields: fields
                .into_iter()
                .map(|(path, field_type)| FieldDecl::new(path, field_type))
                .collect(),
        };
        self.insert_store(decl);
        self
    }

    /// Parses `{ store: { field_path: tag, ... }, ... }`.
    ///
    /// Requires `serde_json`'s `preserve_order` so declaration order survives.
    pub fn from_json(value: &Value) -> Result<Self> {
        let stores = value
            .as_object()
            .ok_or_else(|| DbError::InvalidSpec("specification must be an object".to_string()))?;

        let mut spec = IndexSpec::new();
        for (store, fields) in stores {
            let fields = fields.as_object().ok_or_else(|| {
                DbError::InvalidSpec(format!("fields of store '{}' must be an object", store))
            })?;

            let mut decls = Vec::with_capacity(fields.len());
            for (path, tag) in fields {
                let field_type = tag.as_u64().and_then(FieldType::from_tag).ok_or_else(|| {
                    DbError::InvalidSpec(format!(
                        "field '{}' of store '{}' has invalid type tag {}",
                        path, store, tag
                    ))
                })?;
                decls.push(FieldDecl::new(path.clone(), field_type));
            }
            spec.insert_store(StoreDecl {
                name: store.clone(),
                fields: decls,
            });
        }
        Ok(spec)
    }

    pub fn stores(&self) -> &[StoreDecl] {
        &self.stores
    }

    pub fn store(&self, name: &str) -> Option<&StoreDecl> {
        self.stores.iter().find(|s| s.name == name)
    }

    pub fn contains_store(&self, name: &str) -> bool {
        self.store(name).is_some()
    }

    pub fn insert_store(&mut self, decl: StoreDecl) {
        match self.stores.iter_mut().find(|s| s.name == decl.name) {
            Some(existing) => *existing = decl,
            None => self.stores.push(decl),
        }
    }

    pub fn remove_store(&mut self, name: &str) -> Option<StoreDecl> {
        let pos = self.stores.iter().position(|s| s.name == name)?;
        Some(self.stores.remove(pos))
    }

    /// Checks the specification before any reconciliation work.
    ///
    /// Multi-entry compound indices are not supported by the engine and are
    /// rejected here rather than at creation time.
    pub fn validate(&self) -> Result<()> {
        for (i, store) in self.stores.iter().enumerate() {
            if store.name.trim().is_empty() {
                return Err(DbError::InvalidSpec("empty store name".to_string()));
            }
            if self.stores[..i].iter().any(|s| s.name == store.name) {
                return Err(DbError::InvalidSpec(format!(
                    "store '{}' declared twice",
                    store.name
                )));
            }

            for (j, field) in store.fields.iter().enumerate() {
                let key_path = field.key_path();
                if key_path.parts().iter().any(|p| p.is_empty()) {
                    return Err(DbError::InvalidSpec(format!(
                        "store '{}' has an empty field path in '{}'",
                        store.name, field.path
                    )));
                }
                if key_path.is_compound() && field.field_type.multi_entry() {
                    return Err(DbError::InvalidSpec(format!(
                        "compound index '{}' on store '{}' cannot be multi-entry (type {})",
                        field.path,
                        store.name,
                        field.field_type.tag()
                    )));
                }
                if store.fields[..j].iter().any(|f| f.path == field.path) {
                    return Err(DbError::InvalidSpec(format!(
                        "field '{}' declared twice on store '{}'",
                        field.path, store.name
                    )));
                }
            }
        }
        Ok(())
    }
}
