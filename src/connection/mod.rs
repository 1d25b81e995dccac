//! Connection management.
//!
//! There is no pooling: every unit of work opens a fresh connection and
//! closes it when done, so a version change requested elsewhere is never
//! blocked for longer than one operation.

pub mod reconciler;

pub use reconciler::{Phase, Reconciled, Reconciler};

use crate::error::{DbError, Result};
use crate::schema::delta::SchemaDelta;
use crate::schema::IndexSpec;
use crate::storage::{Backend, Connection};
use std::cell::{Cell, RefCell};
use std::ops::Deref;
use std::rc::Rc;

/// A connection owned by one unit of work. Closed on drop.
pub struct Handle<C: Connection> {
    conn: C,
    open: Rc<Cell<usize>>,
}

impl<C: Connection> Handle<C> {
    fn new(conn: C, open: Rc<Cell<usize>>) -> Self {
        open.set(open.get() + 1);
        Self { conn, open }
    }

    /// Closes the connection now.
    pub fn close(self) {}
}

impl<C: Connection> Deref for Handle<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C: Connection> Drop for Handle<C> {
    fn drop(&mut self) {
        self.conn.close();
        self.open.set(self.open.get().saturating_sub(1));
    }
}

/// Name and specification of the last successful `open_av`.
#[derive(Debug, Clone)]
struct Current {
    name: String,
    spec: IndexSpec,
}

/// Remembers which database this handle manages and reopens it on demand.
///
/// State is per instance, so independent databases each get their own
/// manager.
pub struct ConnectionManager<B: Backend> {
    reconciler: Reconciler<B>,
    current: RefCell<Option<Current>>,
}

impl<B: Backend> ConnectionManager<B> {
    pub fn new(backend: B) -> Self {
        Self {
            reconciler: Reconciler::new(backend),
            current: RefCell::new(None),
        }
    }

    pub fn backend(&self) -> &B {
        self.reconciler.backend()
    }

    pub fn phase(&self) -> Phase {
        self.reconciler.phase()
    }

    /// Opens `name`, upgrading its schema when `spec` changed, and remembers
    /// both for `reopen`.
    pub async fn open_av(&self, name: &str, spec: &IndexSpec) -> Result<Reconciled<B::Connection>> {
        let reconciled = self.reconciler.reconcile(name, spec).await?;
        *self.current.borrow_mut() = Some(Current {
            name: name.to_string(),
            spec: spec.clone(),
        });
        Ok(reconciled)
    }

    /// Opens the remembered database at its current version.
    ///
    /// Never upgrades: if another context changed the schema, the connection
    /// simply opens at the newer version.
    pub async fn reopen(&self) -> Result<Handle<B::Connection>> {
        let name = self.name().ok_or(DbError::NotOpened)?;
        self.reconciler.open_current(&name).await
    }

    /// Applies an explicit delta to the remembered database and replaces the
    /// remembered spec with `spec`.
    pub async fn apply(
        &self,
        delta: SchemaDelta,
        spec: IndexSpec,
    ) -> Result<Reconciled<B::Connection>> {
        let name = self.name().ok_or(DbError::NotOpened)?;
        let reconciled = self.reconciler.apply(&name, delta).await?;
        if let Some(current) = self.current.borrow_mut().as_mut() {
            current.spec = spec;
        }
        Ok(reconciled)
    }

    /// Deletes the remembered database and forgets it.
    pub async fn delete_database(&self) -> Result<()> {
        let name = self.name().ok_or(DbError::NotOpened)?;
        self.reconciler.backend().delete_database(&name).await?;
        log::info!("Deleted database {}", name);
        *self.current.borrow_mut() = None;
        Ok(())
    }

    /// Number of handles currently open. Diagnostic only.
    pub fn num_open(&self) -> usize {
        self.reconciler.open_count()
    }

    pub fn name(&self) -> Option<String> {
        self.current.borrow().as_ref().map(|c| c.name.clone())
    }

    pub fn spec(&self) -> Option<IndexSpec> {
        self.current.borrow().as_ref().map(|c| c.spec.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use crate::storage::MemoryBackend;

    fn spec() -> IndexSpec {
        IndexSpec::new().with_store(
            "my_store",
            [("foo", FieldType::NonUniqueSingle), ("bar", FieldType::NonUniqueMulti)],
        )
    }

    #[test]
    fn test_reopen_before_open_av() {
        let manager = ConnectionManager::new(MemoryBackend::new());
        assert!(matches!(
            pollster::block_on(manager.reopen()),
            Err(DbError::NotOpened)
        ));
    }

    #[test]
    fn test_open_av_then_reopen_round_trip() {
        let manager = ConnectionManager::new(MemoryBackend::new());
        drop(pollster::block_on(manager.open_av("db", &spec())).unwrap());

        let handle = pollster::block_on(manager.reopen()).unwrap();
        let live = pollster::block_on(handle.schema()).unwrap();
        let store = live.store("my_store").unwrap();
        assert_eq!(store.index_names(), vec!["bar", "foo"]);

        let foo = store.index("foo").unwrap();
        assert!(!foo.unique);
        assert!(!foo.multi_entry);
        let bar = store.index("bar").unwrap();
        assert!(!bar.unique);
        assert!(bar.multi_entry);
    }

    #[test]
    fn test_open_av_idempotent() {
        let manager = ConnectionManager::new(MemoryBackend::new());
        let first = pollster::block_on(manager.open_av("db", &spec())).unwrap();
        let version = first.version;
        drop(first);

        let second = pollster::block_on(manager.open_av("db", &spec())).unwrap();
        assert!(!second.upgraded());
        assert_eq!(second.version, version);
    }

    #[test]
    fn test_reopen_never_upgrades() {
        let backend = MemoryBackend::new();
        let manager = ConnectionManager::new(backend.clone());
        drop(pollster::block_on(manager.open_av("db", &spec())).unwrap());

        // Another context upgrades behind our back.
        let other = ConnectionManager::new(backend.clone());
        let wider = spec().with_store("extra", [("x", FieldType::UniqueSingle)]);
        drop(pollster::block_on(other.open_av("db", &wider)).unwrap());

        let handle = pollster::block_on(manager.reopen()).unwrap();
        assert_eq!(handle.version(), 3);
        assert_eq!(backend.database_version("db"), Some(3));
    }

    #[test]
    fn test_num_open_tracks_handles() {
        let manager = ConnectionManager::new(MemoryBackend::new());
        let first = pollster::block_on(manager.open_av("db", &spec())).unwrap();
        assert_eq!(manager.num_open(), 1);
        let second = pollster::block_on(manager.reopen()).unwrap();
        assert_eq!(manager.num_open(), 2);
        drop(first);
        second.close();
        assert_eq!(manager.num_open(), 0);
    }

    #[test]
    fn test_failed_open_av_keeps_previous_state() {
        let manager = ConnectionManager::new(MemoryBackend::new());
        drop(pollster::block_on(manager.open_av("db", &spec())).unwrap());

        let bad = IndexSpec::new().with_store("s", [("foo,bar", FieldType::UniqueMulti)]);
        assert!(pollster::block_on(manager.open_av("other", &bad)).is_err());
        assert_eq!(manager.name().as_deref(), Some("db"));
    }

    #[test]
    fn test_delete_database_forgets_name() {
        let backend = MemoryBackend::new();
        let manager = ConnectionManager::new(backend.clone());
        drop(pollster::block_on(manager.open_av("db", &spec())).unwrap());
        pollster::block_on(manager.delete_database()).unwrap();
        assert_eq!(backend.database_version("db"), None);
        assert!(matches!(
            pollster::block_on(manager.reopen()),
            Err(DbError::NotOpened)
        ));
    }
}
