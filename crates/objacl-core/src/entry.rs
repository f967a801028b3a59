//! Ordered ACL entries.
//!
//! Entries of one object identity live under a common key prefix
//! `[oid][order]`, so a prefix scan returns them in ascending `order`. Order
//! values come from a per-identity counter that only moves forward: a removed
//! entry's order is never handed out again.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sled::transaction::TransactionError;
use sled::{Db, Transactional};

use crate::error::{AclError, AclResult};
use crate::object_identity::ObjectIdentityId;
use crate::permission::Mask;
use crate::sid::SidId;
use crate::storage::key::{decode_entry_key, decode_u32, encode_id, entry_key, next_order_key};
use crate::storage::{AclStorage, AclTrees, EntryRow, LockTable};

/// Stable id of an entry. Survives reordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ace:{}", self.0)
    }
}

/// One grant or deny rule attached to an object identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    /// Stable id.
    pub id: EntryId,
    /// Owning object identity.
    pub object_identity: ObjectIdentityId,
    /// Evaluation position within the identity. Unique per identity, gaps allowed.
    pub order: u32,
    /// SID the rule applies to.
    pub sid: SidId,
    /// Permission bits covered by the rule.
    pub mask: Mask,
    /// Grant (true) or explicit deny (false).
    pub granting: bool,
    /// Ask the audit sink to record grants decided by this entry.
    pub audit_success: bool,
    /// Ask the audit sink to record denials decided by this entry.
    pub audit_failure: bool,
}

/// Read access to entries.
pub trait EntrySource {
    /// Entries of `oid` in ascending order.
    fn entries_for(&self, oid: ObjectIdentityId) -> AclResult<Vec<AclEntry>>;
}

/// Persistent store of ACL entries.
pub struct EntryStore {
    db: Db,
    trees: AclTrees,
    locks: Arc<LockTable>,
}

impl EntryStore {
    /// Open the entry store on the given storage.
    pub fn open(storage: &AclStorage) -> Self {
        Self {
            db: storage.db().clone(),
            trees: storage.trees().clone(),
            locks: storage.locks(),
        }
    }

    /// Append an entry after every existing entry of `oid`.
    ///
    /// The object identity and the SID must exist.
    pub fn append(
        &self,
        oid: ObjectIdentityId,
        sid: SidId,
        mask: Mask,
        granting: bool,
        audit_success: bool,
        audit_failure: bool,
    ) -> AclResult<AclEntry> {
        self.locks.with_sid_shared(|| {
            self.locks.with_object(oid.0, || {
                if !self.trees.objects.contains_key(encode_id(oid.0))? {
                    return Err(AclError::NotFound(oid.to_string()));
                }
                if !self.trees.sids.contains_key(encode_id(sid.0))? {
                    return Err(AclError::NotFound(sid.to_string()));
                }

                let order = self.next_order(oid)?;
                let next = order.checked_add(1).ok_or_else(|| {
                    AclError::Conflict(format!("order values of {} exhausted", oid))
                })?;

                let id = self.db.generate_id()?;
                let key = entry_key(oid.0, order);
                let row = EntryRow {
                    id,
                    sid: sid.0,
                    mask: mask.bits(),
                    granting,
                    audit_success,
                    audit_failure,
                };
                let row_bytes = row.to_bytes()?;
                let id_bytes = encode_id(id);
                let counter_key = next_order_key(oid.0);

                let result: Result<(), TransactionError<AclError>> = (
                    &self.trees.entries,
                    &self.trees.entry_ids,
                    &self.trees.meta,
                )
                    .transaction(|(entries, entry_ids, meta)| {
                        entries.insert(&key[..], row_bytes.as_slice())?;
                        entry_ids.insert(&id_bytes[..], &key[..])?;
                        meta.insert(counter_key.as_slice(), &next.to_be_bytes()[..])?;
                        Ok(())
                    });
                result?;

                tracing::debug!(
                    object_identity = oid.0,
                    entry = id,
                    order,
                    sid = sid.0,
                    mask = %mask,
                    granting,
                    "appended entry"
                );

                Ok(AclEntry {
                    id: EntryId(id),
                    object_identity: oid,
                    order,
                    sid,
                    mask,
                    granting,
                    audit_success,
                    audit_failure,
                })
            })
        })
    }

    /// Entries of `oid` in ascending order. Empty if the identity has none.
    pub fn entries_for(&self, oid: ObjectIdentityId) -> AclResult<Vec<AclEntry>> {
        self.trees
            .entries
            .scan_prefix(encode_id(oid.0))
            .map(|result| {
                let (key, value) = result?;
                decode_entry(&key, &value)
            })
            .collect()
    }

    /// Load one entry.
    pub fn get(&self, id: EntryId) -> AclResult<AclEntry> {
        let (oid, order) = self.locate(id)?;
        let key = entry_key(oid, order);
        let value = self
            .trees
            .entries
            .get(key)?
            .ok_or_else(|| AclError::Integrity(format!("{} points at a missing row", id)))?;
        decode_entry(&key, &value)
    }

    /// Remove one entry. Its order value is not reused.
    pub fn remove(&self, id: EntryId) -> AclResult<AclEntry> {
        let (oid, _) = self.locate(id)?;
        self.locks.with_object(oid, || {
            // reorder may have moved it while we waited for the lock
            let entry = self.get(id)?;
            let key = entry_key(oid, entry.order);
            let id_bytes = encode_id(id.0);

            let result: Result<(), TransactionError<AclError>> =
                (&self.trees.entries, &self.trees.entry_ids).transaction(|(entries, entry_ids)| {
                    entries.remove(&key[..])?;
                    entry_ids.remove(&id_bytes[..])?;
                    Ok(())
                });
            result?;

            tracing::debug!(
                object_identity = oid,
                entry = id.0,
                order = entry.order,
                "removed entry"
            );
            Ok(entry)
        })
    }

    /// Move entries of `oid` to new order values.
    ///
    /// `mapping` assigns new orders to some or all entries; unmentioned
    /// entries keep theirs. Fails with [`AclError::Conflict`] if two entries
    /// would share an order, with [`AclError::NotFound`] if the mapping names
    /// an entry that does not belong to `oid`. Nothing changes on failure.
    pub fn reorder(&self, oid: ObjectIdentityId, mapping: &[(EntryId, u32)]) -> AclResult<()> {
        self.locks.with_object(oid.0, || {
            let current = self.entries_for(oid)?;
            let known: HashSet<EntryId> = current.iter().map(|e| e.id).collect();

            let mut targets: HashMap<EntryId, u32> = HashMap::with_capacity(mapping.len());
            for (id, order) in mapping {
                if !known.contains(id) {
                    return Err(AclError::NotFound(format!("{} is not an entry of {}", id, oid)));
                }
                if targets.insert(*id, *order).is_some_and(|prev| prev != *order) {
                    return Err(AclError::Conflict(format!("{} mapped to two orders", id)));
                }
            }

            let mut used = HashSet::with_capacity(current.len());
            let mut moved = Vec::with_capacity(current.len());
            for entry in &current {
                let order = targets.get(&entry.id).copied().unwrap_or(entry.order);
                if !used.insert(order) {
                    return Err(AclError::Conflict(format!(
                        "order {} assigned twice on {}",
                        order, oid
                    )));
                }
                moved.push((entry, order));
            }

            let highest = moved.iter().map(|(_, order)| *order).max();
            let counter = self.next_order(oid)?;
            let next = match highest {
                Some(h) => counter.max(h.saturating_add(1)),
                None => counter,
            };
            let counter_key = next_order_key(oid.0);

            let mut writes = Vec::with_capacity(moved.len());
            for (entry, order) in &moved {
                let row = EntryRow {
                    id: entry.id.0,
                    sid: entry.sid.0,
                    mask: entry.mask.bits(),
                    granting: entry.granting,
                    audit_success: entry.audit_success,
                    audit_failure: entry.audit_failure,
                };
                writes.push((
                    entry_key(oid.0, entry.order),
                    entry_key(oid.0, *order),
                    encode_id(entry.id.0),
                    row.to_bytes()?,
                ));
            }

            let result: Result<(), TransactionError<AclError>> = (
                &self.trees.entries,
                &self.trees.entry_ids,
                &self.trees.meta,
            )
                .transaction(|(entries, entry_ids, meta)| {
                    for (old_key, _, _, _) in &writes {
                        entries.remove(&old_key[..])?;
                    }
                    for (_, new_key, id_bytes, row_bytes) in &writes {
                        entries.insert(&new_key[..], row_bytes.as_slice())?;
                        entry_ids.insert(&id_bytes[..], &new_key[..])?;
                    }
                    meta.insert(counter_key.as_slice(), &next.to_be_bytes()[..])?;
                    Ok(())
                });
            result?;

            tracing::debug!(object_identity = oid.0, moved = mapping.len(), "reordered entries");
            Ok(())
        })
    }

    /// Change the mask and grant flag of an entry in place.
    pub fn update(&self, id: EntryId, mask: Mask, granting: bool) -> AclResult<AclEntry> {
        self.rewrite(id, |entry| {
            entry.mask = mask;
            entry.granting = granting;
        })
    }

    /// Change the audit flags of an entry in place.
    pub fn set_auditing(
        &self,
        id: EntryId,
        audit_success: bool,
        audit_failure: bool,
    ) -> AclResult<AclEntry> {
        self.rewrite(id, |entry| {
            entry.audit_success = audit_success;
            entry.audit_failure = audit_failure;
        })
    }

    /// Remove every entry of `oid`. The order counter is kept.
    pub fn clear(&self, oid: ObjectIdentityId) -> AclResult<usize> {
        self.locks.with_object(oid.0, || {
            let current = self.entries_for(oid)?;
            let keys: Vec<_> = current
                .iter()
                .map(|e| (entry_key(oid.0, e.order), encode_id(e.id.0)))
                .collect();

            let result: Result<(), TransactionError<AclError>> =
                (&self.trees.entries, &self.trees.entry_ids).transaction(|(entries, entry_ids)| {
                    for (key, id_bytes) in &keys {
                        entries.remove(&key[..])?;
                        entry_ids.remove(&id_bytes[..])?;
                    }
                    Ok(())
                });
            result?;

            if !keys.is_empty() {
                tracing::debug!(object_identity = oid.0, removed = keys.len(), "cleared entries");
            }
            Ok(keys.len())
        })
    }

    /// Total number of entries across all identities.
    pub fn len(&self) -> usize {
        self.trees.entries.len()
    }

    /// Whether no entry exists.
    pub fn is_empty(&self) -> bool {
        self.trees.entries.is_empty()
    }

    fn rewrite(&self, id: EntryId, change: impl FnOnce(&mut AclEntry)) -> AclResult<AclEntry> {
        let (oid, _) = self.locate(id)?;
        self.locks.with_object(oid, || {
            let mut entry = self.get(id)?;
            change(&mut entry);
            let row = EntryRow {
                id: entry.id.0,
                sid: entry.sid.0,
                mask: entry.mask.bits(),
                granting: entry.granting,
                audit_success: entry.audit_success,
                audit_failure: entry.audit_failure,
            };
            self.trees
                .entries
                .insert(entry_key(oid, entry.order), row.to_bytes()?)?;
            tracing::debug!(
                entry = id.0,
                mask = %entry.mask,
                granting = entry.granting,
                audit_success = entry.audit_success,
                audit_failure = entry.audit_failure,
                "updated entry"
            );
            Ok(entry)
        })
    }

    fn locate(&self, id: EntryId) -> AclResult<(u64, u32)> {
        let bytes = self
            .trees
            .entry_ids
            .get(encode_id(id.0))?
            .ok_or_else(|| AclError::NotFound(id.to_string()))?;
        decode_entry_key(&bytes)
    }

    fn next_order(&self, oid: ObjectIdentityId) -> AclResult<u32> {
        match self.trees.meta.get(next_order_key(oid.0))? {
            Some(bytes) => decode_u32(&bytes),
            None => Ok(0),
        }
    }
}

impl EntrySource for EntryStore {
    fn entries_for(&self, oid: ObjectIdentityId) -> AclResult<Vec<AclEntry>> {
        EntryStore::entries_for(self, oid)
    }
}

fn decode_entry(key: &[u8], value: &[u8]) -> AclResult<AclEntry> {
    let (oid, order) = decode_entry_key(key)?;
    let row = EntryRow::from_bytes(value)?;
    Ok(AclEntry {
        id: EntryId(row.id),
        object_identity: ObjectIdentityId(oid),
        order,
        sid: SidId(row.sid),
        mask: Mask::from_bits(row.mask),
        granting: row.granting,
        audit_success: row.audit_success,
        audit_failure: row.audit_failure,
    })
}
