//! Lock table serializing ACL mutations.
//!
//! Reads never take these locks. Writers acquire them in a fixed order to
//! avoid deadlock: `sid_gc`, then `hierarchy`, then the per-object lock.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

/// Locks shared by the object identity store, the entry store and the SID store.
#[derive(Debug, Default)]
pub struct LockTable {
    /// Serializes create / parent / owner / inheritance / delete of identities,
    /// so a cycle check and the write that follows it are atomic over the
    /// whole chain.
    hierarchy: Mutex<()>,
    /// Taken shared by writers that add a reference to a SID, exclusively by
    /// SID deletion.
    sid_gc: RwLock<()>,
    /// One mutex per object identity, guarding its entry list.
    objects: DashMap<u64, Arc<Mutex<()>>>,
}

impl LockTable {
    /// Create an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` holding the hierarchy lock.
    pub fn with_hierarchy<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.hierarchy.lock();
        f()
    }

    /// Run `f` while no SID can be deleted.
    pub fn with_sid_shared<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.sid_gc.read();
        f()
    }

    /// Run `f` with exclusive access to SID references.
    pub fn with_sid_exclusive<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.sid_gc.write();
        f()
    }

    /// Run `f` holding the lock of object identity `oid`.
    pub fn with_object<T>(&self, oid: u64, f: impl FnOnce() -> T) -> T {
        let lock = self
            .objects
            .entry(oid)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock();
        f()
    }

    /// Drop the lock slot of a deleted identity.
    pub fn forget_object(&self, oid: u64) {
        self.objects.remove(&oid);
    }
}
