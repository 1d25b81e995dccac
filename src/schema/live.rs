//! Live schema snapshots read from an open connection.

use crate::schema::FieldDecl;
use crate::storage::KeyPath;

/// Metadata of one existing index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    pub key_path: KeyPath,
    pub unique: bool,
    pub multi_entry: bool,
}

impl IndexInfo {
    /// Index definition a declared field resolves to.
    pub fn from_decl(field: &FieldDecl) -> Self {
        Self {
            name: field.path.clone(),
            key_path: field.key_path(),
            unique: field.field_type.unique(),
            multi_entry: field.field_type.multi_entry(),
        }
    }

    /// True when the live index already satisfies the declaration.
    pub fn matches(&self, field: &FieldDecl) -> bool {
        *self == Self::from_decl(field)
    }
}

/// Metadata of one existing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    pub name: String,
    pub key_path: Option<KeyPath>,
    pub auto_increment: bool,
    pub indices: Vec<IndexInfo>,
}

impl StoreInfo {
    pub fn index(&self, name: &str) -> Option<&IndexInfo> {
        self.indices.iter().find(|i| i.name == name)
    }

    pub fn index_names(&self) -> Vec<&str> {
        self.indices.iter().map(|i| i.name.as_str()).collect()
    }
}

/// Stores and indices of a database at one version.
///
/// Always read fresh from a connection; never cached across opens.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LiveSchema {
    pub version: u32,
    pub stores: Vec<StoreInfo>,
}

impl LiveSchema {
    pub fn store(&self, name: &str) -> Option<&StoreInfo> {
        self.stores.iter().find(|s| s.name == name)
    }

    pub fn store_names(&self) -> Vec<&str> {
        self.stores.iter().map(|s| s.name.as_str()).collect()
    }
}
