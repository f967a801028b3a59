//! Security identities.
//!
//! A SID is either a principal (an individual user) or an authority (a role
//! or group). `(key, is_principal)` is unique: a principal named `admin` and
//! an authority named `admin` are two different SIDs.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{AclError, AclResult};
use crate::storage::key::{decode_id, sid_key};
use crate::storage::{
    AclStorage, AclTrees, EntryRow, Interner, LockTable, ObjectIdentityRow, SidRow,
};

/// Stable id of a security identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SidId(pub u64);

impl fmt::Display for SidId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sid:{}", self.0)
    }
}

/// A resolved security identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sid {
    /// Stable id.
    pub id: SidId,
    /// Principal name or authority name.
    pub key: String,
    /// Whether this SID is an individual principal.
    pub is_principal: bool,
}

/// The SIDs representing one caller, in evaluation order: the principal
/// first, then its authorities in the order the authentication layer gave.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerSids {
    sids: Vec<SidId>,
}

impl CallerSids {
    /// Build from SIDs in evaluation order. Duplicates keep their first position.
    pub fn new(sids: impl IntoIterator<Item = SidId>) -> Self {
        let mut out: Vec<SidId> = Vec::new();
        for sid in sids {
            if !out.contains(&sid) {
                out.push(sid);
            }
        }
        Self { sids: out }
    }

    /// Whether `sid` represents this caller.
    pub fn contains(&self, sid: SidId) -> bool {
        self.sids.contains(&sid)
    }

    /// SIDs in evaluation order.
    pub fn as_slice(&self) -> &[SidId] {
        &self.sids
    }

    /// Iterate in evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = SidId> + '_ {
        self.sids.iter().copied()
    }

    /// Number of SIDs.
    pub fn len(&self) -> usize {
        self.sids.len()
    }

    /// Whether the caller has no known SID at all.
    pub fn is_empty(&self) -> bool {
        self.sids.is_empty()
    }
}

impl From<SidId> for CallerSids {
    fn from(sid: SidId) -> Self {
        Self { sids: vec![sid] }
    }
}

/// Get-or-create store of security identities.
pub struct SidStore {
    interner: Interner,
    trees: AclTrees,
    locks: Arc<LockTable>,
}

impl SidStore {
    /// Open the SID store on the given storage.
    pub fn open(storage: &AclStorage) -> Self {
        let trees = storage.trees().clone();
        Self {
            interner: Interner::new(
                storage.db().clone(),
                trees.sids.clone(),
                trees.sid_keys.clone(),
            ),
            trees,
            locks: storage.locks(),
        }
    }

    /// Id for `(key, is_principal)`, creating the SID on first reference.
    pub fn resolve(&self, key: &str, is_principal: bool) -> AclResult<SidId> {
        let row = SidRow {
            key: key.to_string(),
            is_principal,
        }
        .to_bytes()?;
        let (id, created) = self.interner.intern(&sid_key(key, is_principal), &row)?;
        if created {
            tracing::debug!(sid = id, key, is_principal, "created SID");
        }
        Ok(SidId(id))
    }

    /// Shorthand for resolving a principal.
    pub fn principal(&self, key: &str) -> AclResult<SidId> {
        self.resolve(key, true)
    }

    /// Shorthand for resolving an authority.
    pub fn authority(&self, key: &str) -> AclResult<SidId> {
        self.resolve(key, false)
    }

    /// Id for `(key, is_principal)` without creating it.
    pub fn find(&self, key: &str, is_principal: bool) -> AclResult<Option<SidId>> {
        Ok(self.interner.find(&sid_key(key, is_principal))?.map(SidId))
    }

    /// Load a SID by id.
    pub fn get(&self, id: SidId) -> AclResult<Sid> {
        let bytes = self
            .interner
            .row(id.0)?
            .ok_or_else(|| AclError::NotFound(id.to_string()))?;
        let row = SidRow::from_bytes(&bytes)?;
        Ok(Sid {
            id,
            key: row.key,
            is_principal: row.is_principal,
        })
    }

    /// Whether a SID with this id exists.
    pub fn exists(&self, id: SidId) -> AclResult<bool> {
        Ok(self.interner.row(id.0)?.is_some())
    }

    /// SIDs for a caller, creating any that do not exist yet.
    pub fn sids_for<S: AsRef<str>>(
        &self,
        principal: &str,
        authorities: &[S],
    ) -> AclResult<CallerSids> {
        let mut sids = Vec::with_capacity(authorities.len() + 1);
        sids.push(self.principal(principal)?);
        for authority in authorities {
            sids.push(self.authority(authority.as_ref())?);
        }
        Ok(CallerSids::new(sids))
    }

    /// SIDs for a caller without writing anything.
    ///
    /// Keys never interned are skipped: no entry or owner can reference them,
    /// so leaving them out cannot change a decision.
    pub fn caller_sids<S: AsRef<str>>(
        &self,
        principal: &str,
        authorities: &[S],
    ) -> AclResult<CallerSids> {
        let mut sids = Vec::with_capacity(authorities.len() + 1);
        if let Some(sid) = self.find(principal, true)? {
            sids.push(sid);
        }
        for authority in authorities {
            if let Some(sid) = self.find(authority.as_ref(), false)? {
                sids.push(sid);
            }
        }
        Ok(CallerSids::new(sids))
    }

    /// Delete a SID that nothing references.
    ///
    /// Fails with [`AclError::StillReferenced`] if an object identity is owned
    /// by it or an entry names it. This scans both relations; it is meant for
    /// rare administrative cleanup.
    pub fn delete(&self, id: SidId) -> AclResult<()> {
        self.locks.with_sid_exclusive(|| {
            let sid = self.get(id)?;

            for result in self.trees.objects.iter() {
                let (key, value) = result?;
                let row = ObjectIdentityRow::from_bytes(&value)?;
                if row.owner == Some(id.0) {
                    return Err(AclError::StillReferenced(format!(
                        "{} owns object identity {}",
                        id,
                        decode_id(&key)?
                    )));
                }
            }

            for result in self.trees.entries.iter() {
                let (_, value) = result?;
                let row = EntryRow::from_bytes(&value)?;
                if row.sid == id.0 {
                    return Err(AclError::StillReferenced(format!(
                        "{} is named by entry {}",
                        id, row.id
                    )));
                }
            }

            self.interner.remove(id.0, &sid_key(&sid.key, sid.is_principal))?;
            tracing::debug!(sid = id.0, key = %sid.key, "deleted SID");
            Ok(())
        })
    }

    /// Number of SIDs.
    pub fn len(&self) -> usize {
        self.interner.len()
    }

    /// Whether no SID exists.
    pub fn is_empty(&self) -> bool {
        self.interner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageConfig;

    fn test_store() -> (SidStore, AclStorage) {
        let storage = AclStorage::open(&StorageConfig::temporary()).unwrap();
        (SidStore::open(&storage), storage)
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let (store, _storage) = test_store();
        let a = store.principal("alice").unwrap();
        let b = store.principal("alice").unwrap();
        assert_eq!(a, b);

        let sid = store.get(a).unwrap();
        assert_eq!(sid.key, "alice");
        assert!(sid.is_principal);
    }

    #[test]
    fn test_principal_and_authority_are_distinct() {
        let (store, _storage) = test_store();
        let user = store.principal("admin").unwrap();
        let role = store.authority("admin").unwrap();
        assert_ne!(user, role);
        assert!(!store.get(role).unwrap().is_principal);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_sids_for_order() {
        let (store, _storage) = test_store();
        let caller = store
            .sids_for("alice", &["ROLE_USER", "ROLE_STAFF", "ROLE_USER"])
            .unwrap();

        let keys: Vec<String> = caller.iter().map(|id| store.get(id).unwrap().key).collect();
        assert_eq!(keys, vec!["alice", "ROLE_USER", "ROLE_STAFF"]);
    }

    #[test]
    fn test_caller_sids_does_not_create() {
        let (store, _storage) = test_store();
        let role = store.authority("ROLE_USER").unwrap();

        let caller = store.caller_sids("mallory", &["ROLE_USER", "ROLE_GHOST"]).unwrap();
        assert_eq!(caller.as_slice(), &[role]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_missing() {
        let (store, _storage) = test_store();
        assert!(store.get(SidId(999)).unwrap_err().is_not_found());
    }

    #[test]
    fn test_delete_unreferenced() {
        let (store, _storage) = test_store();
        let id = store.principal("temp").unwrap();
        store.delete(id).unwrap();
        assert!(store.find("temp", true).unwrap().is_none());
        assert!(!store.exists(id).unwrap());
    }
}
