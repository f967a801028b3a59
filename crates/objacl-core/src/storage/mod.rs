//! Storage layer for the ACL relations.
//!
//! This module provides a sled-backed layout of the SID, Class,
//! ObjectIdentity and AclEntry relations, plus the locks that serialize
//! mutations on them.

mod config;
mod engine;
mod interner;
mod locks;
mod record;

pub mod key;

pub use config::StorageConfig;
pub use engine::{AclStorage, AclTrees};
pub use interner::Interner;
pub use locks::LockTable;
pub use record::{ClassRow, EntryRow, ObjectIdentityRow, SidRow};
