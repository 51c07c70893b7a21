//! Single-writer, many-reader metadata owners.
//!
//! An owner holds the "current" pointer to one immutable metadata snapshot.
//! Readers receive an `Arc` whose lifetime is independent of later
//! replacements and never block on writers; writers serialize on an
//! internal mutex held only for the persist-and-swap critical section.

use std::sync::Arc;

use clustore_core::{Error, Result};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::persist::MetaStore;
use crate::{Bmd, Smap, VersionedMeta};

/// Listener invoked with `(old, new)` after each successful swap.
///
/// Listeners run synchronously on the writer's thread while the writer
/// mutex is held: calling back into `put`/`modify` from a listener
/// deadlocks and is a bug.
pub type Listener<T> = Box<dyn Fn(&T, &T) + Send + Sync>;

/// Owner of one metadata object.
pub struct Owner<T: VersionedMeta> {
    cur: RwLock<Arc<T>>,
    write_mu: Mutex<()>,
    store: Option<MetaStore>,
    listeners: RwLock<Vec<Listener<T>>>,
}

/// Owner of the cluster map.
pub type SmapOwner = Owner<Smap>;
/// Owner of the bucket metadata.
pub type BmdOwner = Owner<Bmd>;

impl<T: VersionedMeta> Owner<T> {
    /// Creates an in-memory owner (no persistence), for tests and
    /// ephemeral deployments.
    #[must_use]
    pub fn new(initial: T) -> Self {
        Self {
            cur: RwLock::new(Arc::new(initial)),
            write_mu: Mutex::new(()),
            store: None,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Creates an owner that persists every accepted snapshot to `store`.
    #[must_use]
    pub fn with_store(initial: T, store: MetaStore) -> Self {
        Self {
            cur: RwLock::new(Arc::new(initial)),
            write_mu: Mutex::new(()),
            store: Some(store),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Returns the current immutable snapshot. Never fails, never blocks
    /// on writers.
    #[must_use]
    pub fn get(&self) -> Arc<T> {
        self.cur.read().clone()
    }

    /// Registers a post-swap listener.
    pub fn subscribe(&self, listener: Listener<T>) {
        self.listeners.write().push(listener);
    }

    /// Replaces the current snapshot with `new`.
    ///
    /// Accepted iff `new.version > current.version` and the UUIDs match
    /// (or the current snapshot is the empty version-0 object). The
    /// snapshot is persisted before the pointer swap; a persist failure
    /// leaves the owner unchanged.
    ///
    /// Re-putting the currently held version is a no-op returning
    /// `Ok(false)`; listeners do not fire again.
    ///
    /// # Errors
    ///
    /// - `Error::StaleUpdate` on version regression.
    /// - `Error::ClusterIdentity` on UUID mismatch.
    /// - `Error::Persistence` if no mountpath accepted the write.
    pub fn put(&self, new: T) -> Result<bool> {
        let _guard = self.write_mu.lock();
        let cur = self.cur.read().clone();

        if new.version() == 0 {
            return Err(Error::InvalidRequest(format!(
                "refusing to install a version-0 {}",
                T::TAG
            )));
        }
        if cur.version() > 0 {
            if new.uuid() != cur.uuid() {
                return Err(Error::ClusterIdentity {
                    expected: cur.uuid().to_string(),
                    got: new.uuid().to_string(),
                });
            }
            if new.version() == cur.version() {
                return Ok(false);
            }
            if new.version() < cur.version() {
                return Err(Error::StaleUpdate {
                    tag: T::TAG,
                    have: cur.version(),
                    got: new.version(),
                });
            }
        }
        new.validate()?;
        self.commit(&cur, new)?;
        Ok(true)
    }

    /// Transforms the current snapshot under the writer mutex.
    ///
    /// `f` receives the current snapshot and must produce a successor with
    /// a strictly higher version and the same UUID (or assign the first
    /// UUID when the current snapshot is empty). Persist-and-swap is
    /// atomic with respect to other `modify`/`put` callers.
    ///
    /// # Errors
    ///
    /// Any error from `f`, plus the same rules as [`Owner::put`].
    pub fn modify(&self, f: impl FnOnce(&T) -> Result<T>) -> Result<Arc<T>> {
        let _guard = self.write_mu.lock();
        let cur = self.cur.read().clone();
        let new = f(&cur)?;

        if new.version() <= cur.version() {
            return Err(Error::StaleUpdate {
                tag: T::TAG,
                have: cur.version(),
                got: new.version(),
            });
        }
        if cur.version() > 0 && new.uuid() != cur.uuid() {
            return Err(Error::ClusterIdentity {
                expected: cur.uuid().to_string(),
                got: new.uuid().to_string(),
            });
        }
        new.validate()?;
        self.commit(&cur, new)?;
        Ok(self.cur.read().clone())
    }

    /// Persists `new`, swaps the pointer, and fires listeners.
    /// Caller holds `write_mu`.
    fn commit(&self, old: &Arc<T>, new: T) -> Result<()> {
        if let Some(store) = &self.store {
            store.save(&new)?;
        }
        let new = Arc::new(new);
        *self.cur.write() = new.clone();
        debug!(tag = T::TAG, version = new.version(), "installed metadata snapshot");

        for listener in self.listeners.read().iter() {
            listener(old, &new);
        }
        Ok(())
    }
}
