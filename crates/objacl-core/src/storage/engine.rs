//! Storage engine opening the ACL trees.

use std::sync::Arc;

use sled::{Db, Tree};

use super::{LockTable, StorageConfig};
use crate::error::AclResult;

/// Tree name for SID rows.
pub const SID_TREE: &str = "acl:sid";
/// Tree name for the SID uniqueness index.
pub const SID_KEY_TREE: &str = "acl:sid_key";
/// Tree name for Class rows.
pub const CLASS_TREE: &str = "acl:class";
/// Tree name for the Class uniqueness index.
pub const CLASS_NAME_TREE: &str = "acl:class_name";
/// Tree name for ObjectIdentity rows.
pub const OBJECT_IDENTITY_TREE: &str = "acl:object_identity";
/// Tree name for the ObjectIdentity uniqueness index.
pub const OBJECT_IDENTITY_KEY_TREE: &str = "acl:object_identity_key";
/// Tree name for the parent → child index.
pub const OBJECT_IDENTITY_CHILDREN_TREE: &str = "acl:object_identity_children";
/// Tree name for AclEntry rows.
pub const ENTRY_TREE: &str = "acl:entry";
/// Tree name for the entry id → entry key index.
pub const ENTRY_ID_TREE: &str = "acl:entry_id";
/// Tree name for counters.
pub const META_TREE: &str = "acl:meta";

/// Handles to every ACL tree. sled trees are reference-counted, so cloning
/// this is cheap and every clone sees the same data.
#[derive(Clone)]
pub struct AclTrees {
    pub(crate) sids: Tree,
    pub(crate) sid_keys: Tree,
    pub(crate) classes: Tree,
    pub(crate) class_names: Tree,
    pub(crate) objects: Tree,
    pub(crate) object_keys: Tree,
    pub(crate) object_children: Tree,
    pub(crate) entries: Tree,
    pub(crate) entry_ids: Tree,
    pub(crate) meta: Tree,
}

/// The sled database plus the ACL trees and shared lock table.
pub struct AclStorage {
    db: Db,
    trees: AclTrees,
    locks: Arc<LockTable>,
}

impl AclStorage {
    /// Open or create the storage with the given configuration.
    pub fn open(config: &StorageConfig) -> AclResult<Self> {
        let db = config.to_sled_config().open()?;
        let storage = Self::from_db(db)?;
        tracing::info!(
            path = %config.path.display(),
            temporary = config.temporary,
            recovered = storage.db.was_recovered(),
            "opened ACL storage"
        );
        Ok(storage)
    }

    /// Use an already opened sled database.
    pub fn from_db(db: Db) -> AclResult<Self> {
        let trees = AclTrees {
            sids: db.open_tree(SID_TREE)?,
            sid_keys: db.open_tree(SID_KEY_TREE)?,
            classes: db.open_tree(CLASS_TREE)?,
            class_names: db.open_tree(CLASS_NAME_TREE)?,
            objects: db.open_tree(OBJECT_IDENTITY_TREE)?,
            object_keys: db.open_tree(OBJECT_IDENTITY_KEY_TREE)?,
            object_children: db.open_tree(OBJECT_IDENTITY_CHILDREN_TREE)?,
            entries: db.open_tree(ENTRY_TREE)?,
            entry_ids: db.open_tree(ENTRY_ID_TREE)?,
            meta: db.open_tree(META_TREE)?,
        };

        Ok(Self {
            db,
            trees,
            locks: Arc::new(LockTable::new()),
        })
    }

    /// Handles to the ACL trees.
    pub fn trees(&self) -> &AclTrees {
        &self.trees
    }

    /// The shared lock table.
    pub fn locks(&self) -> Arc<LockTable> {
        Arc::clone(&self.locks)
    }

    /// The underlying sled database.
    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Allocate a new id. Ids are unique across every relation.
    pub fn generate_id(&self) -> AclResult<u64> {
        Ok(self.db.generate_id()?)
    }

    /// Flush all pending writes to disk.
    pub fn flush(&self) -> AclResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Database size in bytes.
    pub fn size_on_disk(&self) -> AclResult<u64> {
        Ok(self.db.size_on_disk()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_temporary() {
        let storage = AclStorage::open(&StorageConfig::temporary()).unwrap();
        assert!(storage.trees().sids.is_empty());

        let a = storage.generate_id().unwrap();
        let b = storage.generate_id().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig::new(dir.path());

        {
            let storage = AclStorage::open(&config).unwrap();
            storage.trees().meta.insert(b"marker", b"1".to_vec()).unwrap();
            storage.flush().unwrap();
        }

        {
            let storage = AclStorage::open(&config).unwrap();
            let value = storage.trees().meta.get(b"marker").unwrap().unwrap();
            assert_eq!(&value[..], b"1");
        }
    }
}
