//! The ACL service: every store over one database, plus the evaluator.

use std::sync::Arc;

use crate::audit::{AuditLogger, NullAuditLogger};
use crate::config::AclConfig;
use crate::entry::{AclEntry, EntryId, EntrySource, EntryStore};
use crate::error::{AclError, AclResult};
use crate::evaluator::PermissionEvaluator;
use crate::object_identity::{
    ChildPolicy, InstanceId, NewObjectIdentity, ObjectIdentity, ObjectIdentityId,
    ObjectIdentitySource, ObjectIdentityStore,
};
use crate::permission::{Mask, PermissionRegistry};
use crate::sid::{CallerSids, SidId, SidStore};
use crate::storage::AclStorage;

/// Owns the ACL relations and hands out evaluators over them.
pub struct AclService {
    storage: AclStorage,
    permissions: PermissionRegistry,
    sids: SidStore,
    objects: ObjectIdentityStore,
    entries: EntryStore,
    audit: Arc<dyn AuditLogger>,
}

impl AclService {
    /// Open the service.
    ///
    /// Custom permissions from `config` are registered after the built-ins;
    /// a bit or name collision fails with [`AclError::Conflict`].
    pub fn open(config: AclConfig) -> AclResult<Self> {
        let permissions = PermissionRegistry::with_builtins();
        permissions.register_all(&config.permissions)?;

        let storage = AclStorage::open(&config.storage)?;
        Ok(Self::from_parts(storage, permissions))
    }

    /// Open a temporary service for testing.
    pub fn temporary() -> AclResult<Self> {
        Self::open(AclConfig::temporary())
    }

    fn from_parts(storage: AclStorage, permissions: PermissionRegistry) -> Self {
        Self {
            sids: SidStore::open(&storage),
            objects: ObjectIdentityStore::open(&storage),
            entries: EntryStore::open(&storage),
            storage,
            permissions,
            audit: Arc::new(NullAuditLogger),
        }
    }

    /// Send audit notifications to `logger`.
    pub fn with_audit_logger(mut self, logger: Arc<dyn AuditLogger>) -> Self {
        self.audit = logger;
        self
    }

    /// Flush the database and the audit sink.
    pub fn flush(&self) -> AclResult<()> {
        self.storage.flush()?;
        self.audit.flush()?;
        Ok(())
    }

    /// The underlying storage.
    pub fn storage(&self) -> &AclStorage {
        &self.storage
    }

    /// The permission registry.
    pub fn permissions(&self) -> &PermissionRegistry {
        &self.permissions
    }

    /// The SID store.
    pub fn sids(&self) -> &SidStore {
        &self.sids
    }

    /// The object identity store.
    pub fn objects(&self) -> &ObjectIdentityStore {
        &self.objects
    }

    /// The entry store.
    pub fn entries(&self) -> &EntryStore {
        &self.entries
    }

    /// The configured audit sink.
    pub fn audit_logger(&self) -> &Arc<dyn AuditLogger> {
        &self.audit
    }

    /// An evaluator over this service's relations, auditing to its sink.
    pub fn evaluator(&self) -> PermissionEvaluator<'_> {
        PermissionEvaluator::new(&self.objects, &self.entries).with_audit(&*self.audit)
    }

    /// Protect a new entity instance, typically owned by its creator.
    pub fn create_object_identity(
        &self,
        object_type: &str,
        instance_id: impl Into<InstanceId>,
        owner: Option<SidId>,
    ) -> AclResult<ObjectIdentity> {
        self.objects.create(object_type, instance_id, owner)
    }

    /// Protect a new entity instance with a parent or inheritance setting.
    pub fn create_object_identity_with(
        &self,
        request: NewObjectIdentity,
    ) -> AclResult<ObjectIdentity> {
        self.objects.create_with(request)
    }

    /// Remove an identity together with its entries.
    ///
    /// A rejected delete leaves the identity and its entries in place.
    pub fn delete_object_identity(
        &self,
        oid: ObjectIdentityId,
        policy: ChildPolicy,
    ) -> AclResult<()> {
        self.objects.delete_with_entries(oid, policy).map(|_| ())
    }

    /// Delete a SID nothing references.
    pub fn delete_sid(&self, id: SidId) -> AclResult<()> {
        self.sids.delete(id)
    }

    /// Decide by names.
    ///
    /// Unknown permission names fail with [`AclError::UnknownPermission`].
    /// A missing object identity fails with [`AclError::NotFound`] so the
    /// caller can apply its own default. Caller SIDs are resolved without
    /// creating anything.
    pub fn is_granted<A, P>(
        &self,
        principal: &str,
        authorities: &[A],
        object_type: &str,
        instance_id: impl Into<InstanceId>,
        permissions: &[P],
    ) -> AclResult<bool>
    where
        A: AsRef<str>,
        P: AsRef<str>,
    {
        let required = self.permissions.resolve(permissions)?;
        let object = self.objects.lookup(object_type, instance_id)?;
        let caller = self.sids.caller_sids(principal, authorities)?;
        Ok(self.evaluator().is_granted(&caller, object.id, required))
    }

    /// Succeeds if `caller` owns `oid` or is granted `admin` on it.
    pub fn ensure_can_administer(
        &self,
        caller: &CallerSids,
        oid: ObjectIdentityId,
    ) -> AclResult<()> {
        let decision = self.evaluator().evaluate(caller, oid, Mask::ADMIN)?;
        if decision.is_granted() {
            Ok(())
        } else {
            tracing::debug!(object_identity = oid.0, "administration refused");
            Err(AclError::AccessDenied(format!(
                "caller may not administer {}",
                oid
            )))
        }
    }

    /// Append an entry on behalf of `caller`. Audit flags start off.
    pub fn append_entry_as(
        &self,
        caller: &CallerSids,
        oid: ObjectIdentityId,
        sid: SidId,
        mask: Mask,
        granting: bool,
    ) -> AclResult<AclEntry> {
        self.ensure_can_administer(caller, oid)?;
        self.entries.append(oid, sid, mask, granting, false, false)
    }

    /// Remove an entry on behalf of `caller`.
    pub fn remove_entry_as(&self, caller: &CallerSids, id: EntryId) -> AclResult<AclEntry> {
        let entry = self.entries.get(id)?;
        self.ensure_can_administer(caller, entry.object_identity)?;
        self.entries.remove(id)
    }

    /// Reorder entries on behalf of `caller`.
    pub fn reorder_entries_as(
        &self,
        caller: &CallerSids,
        oid: ObjectIdentityId,
        mapping: &[(EntryId, u32)],
    ) -> AclResult<()> {
        self.ensure_can_administer(caller, oid)?;
        self.entries.reorder(oid, mapping)
    }
}

impl ObjectIdentitySource for AclService {
    fn object_identity(&self, id: ObjectIdentityId) -> AclResult<ObjectIdentity> {
        self.objects.object_identity(id)
    }
}

impl EntrySource for AclService {
    fn entries_for(&self, oid: ObjectIdentityId) -> AclResult<Vec<AclEntry>> {
        self.entries.entries_for(oid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLogger;
    use crate::evaluator::Outcome;

    #[test]
    fn test_open_registers_custom_permissions() {
        let config = AclConfig::temporary().with_permission("approve", 5);
        let service = AclService::open(config).unwrap();
        assert_eq!(
            service.permissions().resolve(&["approve"]).unwrap(),
            Mask::bit(5).unwrap()
        );
    }

    #[test]
    fn test_open_rejects_colliding_permission() {
        let result = AclService::open(AclConfig::temporary().with_permission("approve", 4));
        assert!(matches!(result, Err(AclError::Conflict(_))));
    }

    #[test]
    fn test_is_granted_by_name() {
        let service = AclService::temporary().unwrap();
        let alice = service.sids().principal("alice").unwrap();
        let staff = service.sids().authority("ROLE_STAFF").unwrap();
        let doc = service.create_object_identity("Doc", 1u64, Some(alice)).unwrap();
        service.entries().append(doc.id, staff, Mask::READ, true, false, false).unwrap();

        let none: [&str; 0] = [];
        assert!(service.is_granted("bob", &["ROLE_STAFF"], "Doc", 1u64, &["read"]).unwrap());
        assert!(!service.is_granted("bob", &none, "Doc", 1u64, &["read"]).unwrap());
        assert!(!service
            .is_granted("bob", &["ROLE_STAFF"], "Doc", 1u64, &["read", "write"])
            .unwrap());
        assert!(service.is_granted("alice", &none, "Doc", 1u64, &["delete"]).unwrap());

        // caller resolution is read-only
        assert_eq!(service.sids().find("bob", true).unwrap(), None);
    }

    #[test]
    fn test_is_granted_errors() {
        let service = AclService::temporary().unwrap();
        let none: [&str; 0] = [];
        assert!(service
            .is_granted("bob", &none, "Doc", 1u64, &["read"])
            .unwrap_err()
            .is_not_found());

        service.create_object_identity("Doc", 1u64, None).unwrap();
        assert!(matches!(
            service.is_granted("bob", &none, "Doc", 1u64, &["approve"]),
            Err(AclError::UnknownPermission(_))
        ));
    }

    #[test]
    fn test_guarded_mutations() {
        let service = AclService::temporary().unwrap();
        let sids = service.sids();
        let owner = sids.principal("owner").unwrap();
        let helper = sids.principal("helper").unwrap();
        let stranger = sids.principal("stranger").unwrap();
        let doc = service.create_object_identity("Doc", 1u64, Some(owner)).unwrap();

        let as_owner = CallerSids::from(owner);
        let as_helper = CallerSids::from(helper);
        let as_stranger = CallerSids::from(stranger);

        assert!(matches!(
            service.append_entry_as(&as_stranger, doc.id, stranger, Mask::READ, true),
            Err(AclError::AccessDenied(_))
        ));

        service.append_entry_as(&as_owner, doc.id, helper, Mask::ADMIN, true).unwrap();
        let read = service
            .append_entry_as(&as_helper, doc.id, stranger, Mask::READ, true)
            .unwrap();

        assert!(matches!(
            service.remove_entry_as(&as_stranger, read.id),
            Err(AclError::AccessDenied(_))
        ));
        assert!(matches!(
            service.reorder_entries_as(&as_stranger, doc.id, &[(read.id, 10)]),
            Err(AclError::AccessDenied(_))
        ));

        service.reorder_entries_as(&as_helper, doc.id, &[(read.id, 10)]).unwrap();
        service.remove_entry_as(&as_helper, read.id).unwrap();
        assert_eq!(service.entries().entries_for(doc.id).unwrap().len(), 1);
    }

    #[test]
    fn test_admin_on_parent_is_inherited() {
        let service = AclService::temporary().unwrap();
        let admin = service.sids().authority("ROLE_ADMIN").unwrap();
        let folder = service.create_object_identity("Folder", 1u64, None).unwrap();
        let doc = service
            .create_object_identity_with(NewObjectIdentity::new("Doc", 1u64).with_parent(folder.id))
            .unwrap();
        service.entries().append(folder.id, admin, Mask::ADMIN, true, false, false).unwrap();

        service.ensure_can_administer(&CallerSids::from(admin), doc.id).unwrap();
    }

    #[test]
    fn test_delete_object_identity_clears_entries() {
        let service = AclService::temporary().unwrap();
        let alice = service.sids().principal("alice").unwrap();
        let doc = service.create_object_identity("Doc", 1u64, Some(alice)).unwrap();
        service.entries().append(doc.id, alice, Mask::READ, true, false, false).unwrap();

        service.delete_object_identity(doc.id, ChildPolicy::Reject).unwrap();
        assert!(service.entries().is_empty());
        assert!(service.objects().is_empty());

        // nothing references the SID any more
        service.delete_sid(alice).unwrap();
        assert!(service.sids().is_empty());
    }

    #[test]
    fn test_rejected_delete_keeps_entries() {
        let service = AclService::temporary().unwrap();
        let alice = service.sids().principal("alice").unwrap();
        let folder = service.create_object_identity("Folder", 1u64, None).unwrap();
        service
            .create_object_identity_with(NewObjectIdentity::new("Doc", 1u64).with_parent(folder.id))
            .unwrap();
        service.entries().append(folder.id, alice, Mask::READ, true, false, false).unwrap();

        let err = service.delete_object_identity(folder.id, ChildPolicy::Reject).unwrap_err();
        assert!(matches!(err, AclError::StillReferenced(_)));
        assert_eq!(service.entries().entries_for(folder.id).unwrap().len(), 1);
    }

    #[test]
    fn test_audit_logger_receives_events() {
        let audit = Arc::new(MemoryAuditLogger::new());
        let service = AclService::temporary().unwrap().with_audit_logger(audit.clone());
        let bob = service.sids().principal("bob").unwrap();
        let doc = service.create_object_identity("Doc", 1u64, None).unwrap();
        let entry = service
            .entries()
            .append(doc.id, bob, Mask::WRITE, false, false, false)
            .unwrap();

        let caller = CallerSids::from(bob);
        assert!(!service.evaluator().is_granted(&caller, doc.id, Mask::WRITE));
        assert!(audit.is_empty());

        service.entries().set_auditing(entry.id, false, true).unwrap();
        assert!(!service.evaluator().is_granted(&caller, doc.id, Mask::WRITE));
        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].outcome, Outcome::Deny);
        assert_eq!(events[0].entry.id, entry.id);

        service.flush().unwrap();
    }
}
