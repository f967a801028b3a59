//! Get-or-create interning of string keys to stable ids.
//!
//! Backs both the SID relation and the Class relation: a row tree keyed by
//! id plus a uniqueness index keyed by the natural key. Creation runs in a
//! sled transaction over both trees, so concurrent first use of the same key
//! converges on one id.

use dashmap::DashMap;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, IVec, Transactional, Tree};

use super::key::{decode_id, encode_id};
use crate::error::{AclError, AclResult};

/// Interning table over a row tree and its uniqueness index.
pub struct Interner {
    db: Db,
    rows: Tree,
    index: Tree,
    cache: DashMap<Vec<u8>, u64>,
}

impl Interner {
    /// Create an interner over the given trees.
    pub fn new(db: Db, rows: Tree, index: Tree) -> Self {
        Self {
            db,
            rows,
            index,
            cache: DashMap::new(),
        }
    }

    /// Id of `key`, if interned.
    ///
    /// A cached id whose row is gone is dropped and the index consulted
    /// again: a lookup overlapping [`remove`](Self::remove) may have cached it.
    pub fn find(&self, key: &[u8]) -> AclResult<Option<u64>> {
        let cached = self.cache.get(key).map(|id| *id);
        if let Some(id) = cached {
            if self.rows.contains_key(encode_id(id))? {
                return Ok(Some(id));
            }
            self.cache.remove_if(key, |_, stale| *stale == id);
        }
        match self.index.get(key)? {
            Some(bytes) => {
                let id = decode_id(&bytes)?;
                self.cache.insert(key.to_vec(), id);
                Ok(Some(id))
            }
            None => Ok(None),
        }
    }

    /// Id of `key`, creating it with `row` when absent.
    ///
    /// Returns the id and whether this call created it.
    pub fn intern(&self, key: &[u8], row: &[u8]) -> AclResult<(u64, bool)> {
        if let Some(id) = self.find(key)? {
            return Ok((id, false));
        }

        let candidate = self.db.generate_id()?;
        let candidate_bytes = encode_id(candidate);

        let result: Result<(u64, bool), TransactionError<AclError>> =
            (&self.rows, &self.index).transaction(|(rows, index)| {
                if let Some(existing) = index.get(key)? {
                    let id = decode_id(&existing).map_err(ConflictableTransactionError::Abort)?;
                    return Ok((id, false));
                }
                index.insert(key, &candidate_bytes[..])?;
                rows.insert(&candidate_bytes[..], row)?;
                Ok((candidate, true))
            });

        let (id, created) = result?;
        self.cache.insert(key.to_vec(), id);
        Ok((id, created))
    }

    /// Raw row stored for `id`.
    pub fn row(&self, id: u64) -> AclResult<Option<IVec>> {
        Ok(self.rows.get(encode_id(id))?)
    }

    /// Remove `id` and its index key.
    pub fn remove(&self, id: u64, key: &[u8]) -> AclResult<()> {
        let id_bytes = encode_id(id);
        let result: Result<(), TransactionError<AclError>> =
            (&self.rows, &self.index).transaction(|(rows, index)| {
                rows.remove(&id_bytes[..])?;
                index.remove(key)?;
                Ok(())
            });
        result?;
        self.cache.remove(key);
        Ok(())
    }

    /// Number of interned keys.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether nothing is interned.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_interner() -> Interner {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let rows = db.open_tree("rows").unwrap();
        let index = db.open_tree("index").unwrap();
        Interner::new(db, rows, index)
    }

    #[test]
    fn test_stale_cache_entry_is_not_returned() {
        let interner = test_interner();
        let (old, _) = interner.intern(b"alice", b"row-a").unwrap();
        interner.remove(old, b"alice").unwrap();

        // a lookup that overlapped the removal left the dead id behind
        interner.cache.insert(b"alice".to_vec(), old);

        assert_eq!(interner.find(b"alice").unwrap(), None);
        interner.cache.insert(b"alice".to_vec(), old);
        let (new, created) = interner.intern(b"alice", b"row-b").unwrap();
        assert!(created);
        assert_ne!(new, old);
        assert_eq!(interner.find(b"alice").unwrap(), Some(new));
        assert_eq!(&interner.row(new).unwrap().unwrap()[..], b"row-b");
    }

    #[test]
    fn test_intern_is_idempotent() {
        let interner = test_interner();
        let (a, created) = interner.intern(b"alice", b"row-a").unwrap();
        assert!(created);
        let (b, created) = interner.intern(b"alice", b"row-b").unwrap();
        assert!(!created);
        assert_eq!(a, b);
        assert_eq!(&interner.row(a).unwrap().unwrap()[..], b"row-a");
        assert_eq!(interner.len(), 1);
    }

    #[test]
    fn test_find_and_remove() {
        let interner = test_interner();
        assert_eq!(interner.find(b"bob").unwrap(), None);

        let (id, _) = interner.intern(b"bob", b"row").unwrap();
        assert_eq!(interner.find(b"bob").unwrap(), Some(id));

        interner.remove(id, b"bob").unwrap();
        assert_eq!(interner.find(b"bob").unwrap(), None);
        assert!(interner.row(id).unwrap().is_none());
    }

    #[test]
    fn test_concurrent_first_use() {
        let interner = Arc::new(test_interner());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let interner = Arc::clone(&interner);
                std::thread::spawn(move || interner.intern(b"shared", b"row").unwrap().0)
            })
            .collect();

        let ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(interner.len(), 1);
    }
}
