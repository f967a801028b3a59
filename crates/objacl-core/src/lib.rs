//! objacl core - per-instance access control lists.
//!
//! This crate stores security identities, object identities and ordered
//! grant/deny entries in sled, and decides whether a caller holds a set of
//! permission bits on one object instance.

pub mod audit;
pub mod class;
pub mod config;
pub mod entry;
pub mod error;
pub mod evaluator;
pub mod object_identity;
pub mod permission;
pub mod service;
pub mod sid;
pub mod storage;

pub use class::{ClassId, ClassStore};
pub use config::AclConfig;
pub use entry::{AclEntry, EntryId, EntrySource, EntryStore};
pub use error::{AclError, AclResult};
pub use evaluator::{Decision, DecisionBasis, Outcome, PermissionEvaluator};
pub use object_identity::{
    ancestor_chain, AncestorChain, ChildPolicy, InstanceId, NewObjectIdentity, ObjectIdentity,
    ObjectIdentityId, ObjectIdentitySource, ObjectIdentityStore,
};
pub use permission::{mask_contains, Mask, PermissionDef, PermissionRegistry};
pub use service::AclService;
pub use sid::{CallerSids, Sid, SidId, SidStore};
pub use storage::{AclStorage, StorageConfig};

// Audit exports
pub use audit::{
    AuditError, AuditEvent, AuditLogger, JsonLinesAuditLogger, MemoryAuditLogger,
    NullAuditLogger, TracingAuditLogger,
};
