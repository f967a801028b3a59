//! Object identities: the securable instances ACLs attach to.
//!
//! An object identity is `(type, instance id)` plus an optional owner, an
//! optional parent and an inheritance flag. Parents form a forest; every
//! parent assignment re-validates acyclicity under the hierarchy lock.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional};

use crate::class::{ClassId, ClassStore};
use crate::error::{AclError, AclResult};
use crate::sid::SidId;
use crate::storage::key::{
    child_key, decode_id, encode_id, next_order_key, object_identity_key, ID_SIZE,
};
use crate::storage::{AclStorage, AclTrees, EntryRow, LockTable, ObjectIdentityRow};

/// Value of child-link rows; only the key matters.
const EMPTY: &[u8] = &[];

/// Stable id of an object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectIdentityId(pub u64);

impl fmt::Display for ObjectIdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oid:{}", self.0)
    }
}

/// Primary key of a domain entity, kept as an opaque string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Create from any string-like key.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The key as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for InstanceId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<i64> for InstanceId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<u32> for InstanceId {
    fn from(id: u32) -> Self {
        Self(id.to_string())
    }
}

impl From<i32> for InstanceId {
    fn from(id: i32) -> Self {
        Self(id.to_string())
    }
}

/// A securable domain object instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIdentity {
    /// Stable id.
    pub id: ObjectIdentityId,
    /// Type discriminator.
    pub object_type: String,
    /// Domain primary key.
    pub instance_id: InstanceId,
    /// Owner. Holds every permission implicitly.
    pub owner: Option<SidId>,
    /// Parent identity whose entries may be inherited.
    pub parent: Option<ObjectIdentityId>,
    /// Whether evaluation continues past this node to its parent.
    pub entries_inheriting: bool,
}

/// Parameters for creating an object identity.
#[derive(Debug, Clone)]
pub struct NewObjectIdentity {
    /// Type discriminator.
    pub object_type: String,
    /// Domain primary key.
    pub instance_id: InstanceId,
    /// Owner SID.
    pub owner: Option<SidId>,
    /// Parent identity.
    pub parent: Option<ObjectIdentityId>,
    /// Inheritance flag (defaults to true).
    pub entries_inheriting: bool,
}

impl NewObjectIdentity {
    /// Start with no owner, no parent and inheritance on.
    pub fn new(object_type: impl Into<String>, instance_id: impl Into<InstanceId>) -> Self {
        Self {
            object_type: object_type.into(),
            instance_id: instance_id.into(),
            owner: None,
            parent: None,
            entries_inheriting: true,
        }
    }

    /// Set the owner.
    pub fn owned_by(mut self, owner: SidId) -> Self {
        self.owner = Some(owner);
        self
    }

    /// Set the parent.
    pub fn with_parent(mut self, parent: ObjectIdentityId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Set the inheritance flag.
    pub fn inheriting(mut self, entries_inheriting: bool) -> Self {
        self.entries_inheriting = entries_inheriting;
        self
    }
}

/// What to do with children when deleting an object identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChildPolicy {
    /// Refuse the delete while children exist.
    #[default]
    Reject,
    /// Move children to the deleted node's parent (or make them roots).
    ReparentToParent,
}

/// Read access to object identities.
pub trait ObjectIdentitySource {
    /// Load an identity by id. Fails with [`AclError::NotFound`] if absent.
    fn object_identity(&self, id: ObjectIdentityId) -> AclResult<ObjectIdentity>;
}

/// The inheritance chain of an identity: itself, then ancestors for as long
/// as the current node's own `entries_inheriting` flag is true.
///
/// Yields an [`AclError::Integrity`] error and stops if a node repeats or a
/// parent reference dangles.
pub struct AncestorChain<'a, S: ?Sized> {
    source: &'a S,
    next: Option<ObjectIdentityId>,
    visited: HashSet<ObjectIdentityId>,
    started: bool,
}

impl<'a, S: ObjectIdentitySource + ?Sized> AncestorChain<'a, S> {
    /// Start a chain at `start`.
    pub fn new(source: &'a S, start: ObjectIdentityId) -> Self {
        Self {
            source,
            next: Some(start),
            visited: HashSet::new(),
            started: false,
        }
    }
}

impl<S: ObjectIdentitySource + ?Sized> Iterator for AncestorChain<'_, S> {
    type Item = AclResult<ObjectIdentity>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;

        if !self.visited.insert(id) {
            tracing::error!(object_identity = id.0, "cycle in object identity parents");
            return Some(Err(AclError::Integrity(format!(
                "parent chain revisits {}",
                id
            ))));
        }

        let first = !self.started;
        self.started = true;

        match self.source.object_identity(id) {
            Ok(node) => {
                if node.entries_inheriting {
                    self.next = node.parent;
                }
                Some(Ok(node))
            }
            Err(err) if err.is_not_found() && !first => {
                tracing::error!(object_identity = id.0, "dangling parent reference");
                Some(Err(AclError::Integrity(format!(
                    "parent {} does not exist",
                    id
                ))))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

/// Chain of `start` over any identity source.
pub fn ancestor_chain<S: ObjectIdentitySource + ?Sized>(
    source: &S,
    start: ObjectIdentityId,
) -> AncestorChain<'_, S> {
    AncestorChain::new(source, start)
}

/// Persistent store of object identities.
pub struct ObjectIdentityStore {
    db: Db,
    classes: ClassStore,
    trees: AclTrees,
    locks: Arc<LockTable>,
}

impl ObjectIdentityStore {
    /// Open the store on the given storage.
    pub fn open(storage: &AclStorage) -> Self {
        Self {
            db: storage.db().clone(),
            classes: ClassStore::open(storage),
            trees: storage.trees().clone(),
            locks: storage.locks(),
        }
    }

    /// The Class relation used for type discriminators.
    pub fn classes(&self) -> &ClassStore {
        &self.classes
    }

    /// Create an identity with the given owner, no parent, inheritance on.
    pub fn create(
        &self,
        object_type: &str,
        instance_id: impl Into<InstanceId>,
        owner: Option<SidId>,
    ) -> AclResult<ObjectIdentity> {
        let mut request = NewObjectIdentity::new(object_type, instance_id);
        request.owner = owner;
        self.create_with(request)
    }

    /// Create an identity.
    ///
    /// Fails with [`AclError::Duplicate`] if `(type, instance id)` exists and
    /// with [`AclError::NotFound`] if the owner or parent does not exist.
    pub fn create_with(&self, request: NewObjectIdentity) -> AclResult<ObjectIdentity> {
        self.locks.with_sid_shared(|| {
            self.locks.with_hierarchy(|| {
                if let Some(owner) = request.owner {
                    self.ensure_sid(owner)?;
                }
                if let Some(parent) = request.parent {
                    self.load_row(parent)?;
                }

                let class_id = self.classes.resolve(&request.object_type)?;
                let unique_key = object_identity_key(class_id.0, request.instance_id.as_str());
                let id = self.db.generate_id()?;
                let id_bytes = encode_id(id);
                let row = ObjectIdentityRow {
                    class_id: class_id.0,
                    instance_id: request.instance_id.as_str().to_string(),
                    parent: request.parent.map(|p| p.0),
                    owner: request.owner.map(|o| o.0),
                    entries_inheriting: request.entries_inheriting,
                };
                let row_bytes = row.to_bytes()?;

                let result: Result<(), TransactionError<AclError>> = (
                    &self.trees.object_keys,
                    &self.trees.objects,
                    &self.trees.object_children,
                )
                    .transaction(|(keys, objects, children)| {
                        if keys.get(&unique_key)?.is_some() {
                            return Err(ConflictableTransactionError::Abort(AclError::Duplicate(
                                format!(
                                    "object identity ({}, {}) already exists",
                                    request.object_type, request.instance_id
                                ),
                            )));
                        }
                        keys.insert(unique_key.as_slice(), &id_bytes[..])?;
                        objects.insert(&id_bytes[..], row_bytes.as_slice())?;
                        if let Some(parent) = row.parent {
                            children.insert(&child_key(parent, id)[..], EMPTY)?;
                        }
                        Ok(())
                    });
                result?;

                tracing::info!(
                    object_identity = id,
                    object_type = %request.object_type,
                    instance_id = %request.instance_id,
                    owner = ?request.owner,
                    parent = ?request.parent,
                    "created object identity"
                );

                Ok(ObjectIdentity {
                    id: ObjectIdentityId(id),
                    object_type: request.object_type.clone(),
                    instance_id: request.instance_id.clone(),
                    owner: request.owner,
                    parent: request.parent,
                    entries_inheriting: request.entries_inheriting,
                })
            })
        })
    }

    /// Load an identity by id.
    pub fn get(&self, id: ObjectIdentityId) -> AclResult<ObjectIdentity> {
        let row = self.load_row(id)?;
        self.to_identity(id, row)
    }

    /// Identity for `(type, instance id)`, if it exists.
    pub fn find(
        &self,
        object_type: &str,
        instance_id: impl Into<InstanceId>,
    ) -> AclResult<Option<ObjectIdentity>> {
        let Some(class_id) = self.classes.find(object_type)? else {
            return Ok(None);
        };
        let instance_id = instance_id.into();
        let unique_key = object_identity_key(class_id.0, instance_id.as_str());
        match self.trees.object_keys.get(unique_key)? {
            Some(bytes) => Ok(Some(self.get(ObjectIdentityId(decode_id(&bytes)?))?)),
            None => Ok(None),
        }
    }

    /// Identity for `(type, instance id)`.
    ///
    /// Fails with [`AclError::NotFound`] if absent; nothing is created on read.
    pub fn lookup(
        &self,
        object_type: &str,
        instance_id: impl Into<InstanceId>,
    ) -> AclResult<ObjectIdentity> {
        let instance_id = instance_id.into();
        self.find(object_type, instance_id.clone())?.ok_or_else(|| {
            AclError::NotFound(format!("object identity ({}, {})", object_type, instance_id))
        })
    }

    /// Assign or clear the parent of `id`.
    ///
    /// Fails with [`AclError::Cycle`] if `new_parent` is `id` itself or one of
    /// its descendants. The store is unchanged after a failed call.
    pub fn set_parent(
        &self,
        id: ObjectIdentityId,
        new_parent: Option<ObjectIdentityId>,
    ) -> AclResult<()> {
        self.locks.with_hierarchy(|| {
            let mut row = self.load_row(id)?;
            if let Some(parent) = new_parent {
                self.check_acyclic(id, parent)?;
            }

            let old_parent = row.parent;
            row.parent = new_parent.map(|p| p.0);
            let row_bytes = row.to_bytes()?;
            let id_bytes = encode_id(id.0);

            let result: Result<(), TransactionError<AclError>> =
                (&self.trees.objects, &self.trees.object_children).transaction(
                    |(objects, children)| {
                        objects.insert(&id_bytes[..], row_bytes.as_slice())?;
                        if let Some(old) = old_parent {
                            children.remove(&child_key(old, id.0)[..])?;
                        }
                        if let Some(new) = new_parent {
                            children.insert(&child_key(new.0, id.0)[..], EMPTY)?;
                        }
                        Ok(())
                    },
                );
            result?;

            tracing::debug!(
                object_identity = id.0,
                old_parent = ?old_parent,
                new_parent = ?new_parent.map(|p| p.0),
                "reparented object identity"
            );
            Ok(())
        })
    }

    /// Change the owner of `id`.
    pub fn set_owner(&self, id: ObjectIdentityId, owner: Option<SidId>) -> AclResult<()> {
        self.locks.with_sid_shared(|| {
            self.locks.with_hierarchy(|| {
                let mut row = self.load_row(id)?;
                if let Some(owner) = owner {
                    self.ensure_sid(owner)?;
                }
                row.owner = owner.map(|o| o.0);
                self.write_row(id, &row)?;
                tracing::debug!(object_identity = id.0, owner = ?owner, "changed owner");
                Ok(())
            })
        })
    }

    /// Turn inheritance from the parent on or off for `id`.
    pub fn set_inheriting(&self, id: ObjectIdentityId, entries_inheriting: bool) -> AclResult<()> {
        self.locks.with_hierarchy(|| {
            let mut row = self.load_row(id)?;
            row.entries_inheriting = entries_inheriting;
            self.write_row(id, &row)?;
            tracing::debug!(object_identity = id.0, entries_inheriting, "changed inheritance");
            Ok(())
        })
    }

    /// Direct children of `id`.
    pub fn children(&self, id: ObjectIdentityId) -> AclResult<Vec<ObjectIdentityId>> {
        self.trees
            .object_children
            .scan_prefix(encode_id(id.0))
            .map(|result| {
                let (key, _) = result?;
                Ok(ObjectIdentityId(decode_id(&key[ID_SIZE..])?))
            })
            .collect()
    }

    /// The inheritance chain starting at `id`.
    pub fn ancestor_chain(&self, id: ObjectIdentityId) -> AncestorChain<'_, Self> {
        AncestorChain::new(self, id)
    }

    /// Delete an identity.
    ///
    /// Entries must be removed first; otherwise this fails with
    /// [`AclError::StillReferenced`]. Children are handled per `policy`.
    pub fn delete(&self, id: ObjectIdentityId, policy: ChildPolicy) -> AclResult<()> {
        self.remove(id, policy, false).map(|_| ())
    }

    /// Delete an identity together with its entries.
    ///
    /// The children check, the entry removal and the row removal happen in
    /// one transaction under the hierarchy lock, so a rejected delete leaves
    /// every entry in place. Returns the number of entries removed.
    pub fn delete_with_entries(
        &self,
        id: ObjectIdentityId,
        policy: ChildPolicy,
    ) -> AclResult<usize> {
        self.remove(id, policy, true)
    }

    fn remove(
        &self,
        id: ObjectIdentityId,
        policy: ChildPolicy,
        with_entries: bool,
    ) -> AclResult<usize> {
        let removed = self.locks.with_hierarchy(|| {
            self.locks.with_object(id.0, || {
                let row = self.load_row(id)?;

                let mut entries = Vec::new();
                for result in self.trees.entries.scan_prefix(encode_id(id.0)) {
                    let (key, value) = result?;
                    if !with_entries {
                        return Err(AclError::StillReferenced(format!(
                            "{} still has entries",
                            id
                        )));
                    }
                    let entry = EntryRow::from_bytes(&value)?;
                    entries.push((key, encode_id(entry.id)));
                }

                let children = self.children(id)?;
                if !children.is_empty() && policy == ChildPolicy::Reject {
                    return Err(AclError::StillReferenced(format!(
                        "{} still has {} children",
                        id,
                        children.len()
                    )));
                }

                let grandparent = row.parent;
                // children must not see ancestors this node used to cut off
                let cut_off = !row.entries_inheriting;
                let unique_key = object_identity_key(row.class_id, &row.instance_id);
                let id_bytes = encode_id(id.0);
                let counter_key = next_order_key(id.0);

                let result: Result<(), TransactionError<AclError>> = (
                    &self.trees.objects,
                    &self.trees.object_keys,
                    &self.trees.object_children,
                    &self.trees.meta,
                    &self.trees.entries,
                    &self.trees.entry_ids,
                )
                    .transaction(|(objects, keys, links, meta, entry_rows, entry_ids)| {
                        for child in &children {
                            let child_bytes = encode_id(child.0);
                            let Some(bytes) = objects.get(&child_bytes[..])? else {
                                return Err(ConflictableTransactionError::Abort(
                                    AclError::Integrity(format!("dangling child {}", child)),
                                ));
                            };
                            let mut child_row = ObjectIdentityRow::from_bytes(&bytes)
                                .map_err(ConflictableTransactionError::Abort)?;
                            child_row.parent = grandparent;
                            if cut_off {
                                child_row.entries_inheriting = false;
                            }
                            let child_row_bytes = child_row
                                .to_bytes()
                                .map_err(ConflictableTransactionError::Abort)?;
                            objects.insert(&child_bytes[..], child_row_bytes)?;
                            links.remove(&child_key(id.0, child.0)[..])?;
                            if let Some(gp) = grandparent {
                                links.insert(&child_key(gp, child.0)[..], EMPTY)?;
                            }
                        }
                        for (key, entry_id) in &entries {
                            entry_rows.remove(&key[..])?;
                            entry_ids.remove(&entry_id[..])?;
                        }
                        if let Some(parent) = grandparent {
                            links.remove(&child_key(parent, id.0)[..])?;
                        }
                        objects.remove(&id_bytes[..])?;
                        keys.remove(unique_key.as_slice())?;
                        meta.remove(counter_key.as_slice())?;
                        Ok(())
                    });
                result?;

                tracing::info!(
                    object_identity = id.0,
                    reparented = children.len(),
                    entries = entries.len(),
                    "deleted object identity"
                );
                Ok(entries.len())
            })
        })?;
        self.locks.forget_object(id.0);
        Ok(removed)
    }

    /// Number of object identities.
    pub fn len(&self) -> usize {
        self.trees.objects.len()
    }

    /// Whether no object identity exists.
    pub fn is_empty(&self) -> bool {
        self.trees.objects.is_empty()
    }

    /// Walk up from `parent`; reaching `child` means the assignment would loop.
    fn check_acyclic(&self, child: ObjectIdentityId, parent: ObjectIdentityId) -> AclResult<()> {
        let limit = self.trees.objects.len() + 1;
        let mut current = Some(parent);
        let mut steps = 0usize;

        while let Some(node) = current {
            if node == child {
                return Err(AclError::Cycle {
                    child: child.0,
                    parent: parent.0,
                });
            }
            steps += 1;
            if steps > limit {
                tracing::error!(object_identity = node.0, "parent walk exceeded store size");
                return Err(AclError::Integrity(format!(
                    "ancestors of {} do not terminate",
                    parent
                )));
            }
            current = self.load_row(node)?.parent.map(ObjectIdentityId);
        }
        Ok(())
    }

    fn ensure_sid(&self, sid: SidId) -> AclResult<()> {
        if self.trees.sids.contains_key(encode_id(sid.0))? {
            Ok(())
        } else {
            Err(AclError::NotFound(sid.to_string()))
        }
    }

    fn load_row(&self, id: ObjectIdentityId) -> AclResult<ObjectIdentityRow> {
        let bytes = self
            .trees
            .objects
            .get(encode_id(id.0))?
            .ok_or_else(|| AclError::NotFound(id.to_string()))?;
        ObjectIdentityRow::from_bytes(&bytes)
    }

    fn write_row(&self, id: ObjectIdentityId, row: &ObjectIdentityRow) -> AclResult<()> {
        self.trees.objects.insert(encode_id(id.0), row.to_bytes()?)?;
        Ok(())
    }

    fn to_identity(
        &self,
        id: ObjectIdentityId,
        row: ObjectIdentityRow,
    ) -> AclResult<ObjectIdentity> {
        Ok(ObjectIdentity {
            id,
            object_type: self.classes.name(ClassId(row.class_id))?,
            instance_id: InstanceId(row.instance_id),
            owner: row.owner.map(SidId),
            parent: row.parent.map(ObjectIdentityId),
            entries_inheriting: row.entries_inheriting,
        })
    }
}

impl ObjectIdentitySource for ObjectIdentityStore {
    fn object_identity(&self, id: ObjectIdentityId) -> AclResult<ObjectIdentity> {
        self.get(id)
    }
}
