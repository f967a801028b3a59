//! Type discriminators of securable objects.

use std::fmt;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::{AclError, AclResult};
use crate::storage::{AclStorage, ClassRow, Interner};

/// Stable id of a type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClassId(pub u64);

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class:{}", self.0)
    }
}

/// Maps type names (e.g. `"app::Possession"`) to class ids and back.
pub struct ClassStore {
    interner: Interner,
    names: DashMap<ClassId, String>,
}

impl ClassStore {
    /// Open the class store on the given storage.
    pub fn open(storage: &AclStorage) -> Self {
        let trees = storage.trees();
        Self {
            interner: Interner::new(
                storage.db().clone(),
                trees.classes.clone(),
                trees.class_names.clone(),
            ),
            names: DashMap::new(),
        }
    }

    /// Class id of `type_name`, creating it on first use.
    pub fn resolve(&self, type_name: &str) -> AclResult<ClassId> {
        let row = ClassRow {
            type_name: type_name.to_string(),
        }
        .to_bytes()?;
        let (id, created) = self.interner.intern(type_name.as_bytes(), &row)?;
        if created {
            tracing::debug!(class = id, type_name, "registered object type");
        }
        Ok(ClassId(id))
    }

    /// Class id of `type_name`, if known.
    pub fn find(&self, type_name: &str) -> AclResult<Option<ClassId>> {
        Ok(self.interner.find(type_name.as_bytes())?.map(ClassId))
    }

    /// Type name of a class id.
    pub fn name(&self, id: ClassId) -> AclResult<String> {
        if let Some(name) = self.names.get(&id) {
            return Ok(name.clone());
        }
        let bytes = self
            .interner
            .row(id.0)?
            .ok_or_else(|| AclError::Integrity(format!("dangling {}", id)))?;
        let row = ClassRow::from_bytes(&bytes)?;
        self.names.insert(id, row.type_name.clone());
        Ok(row.type_name)
    }
}
