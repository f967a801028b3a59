//! Service configuration.

use std::path::PathBuf;

use crate::error::{AclError, AclResult};
use crate::permission::PermissionDef;
use crate::storage::StorageConfig;

/// Configuration for [`AclService`](crate::AclService).
#[derive(Debug, Clone)]
pub struct AclConfig {
    /// Storage settings.
    pub storage: StorageConfig,

    /// Permissions registered on open, in addition to the built-ins.
    pub permissions: Vec<PermissionDef>,
}

impl AclConfig {
    /// Create a configuration storing data at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            storage: StorageConfig::new(path),
            permissions: Vec::new(),
        }
    }

    /// Create a temporary configuration for testing.
    pub fn temporary() -> Self {
        Self {
            storage: StorageConfig::temporary(),
            permissions: Vec::new(),
        }
    }

    /// Replace the storage settings.
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Add a custom permission.
    pub fn with_permission(mut self, name: impl Into<String>, bit: u8) -> Self {
        self.permissions.push(PermissionDef::new(name, bit));
        self
    }

    /// Add custom permissions from a JSON array of `{"name": .., "bit": ..}`.
    pub fn with_permissions_json(mut self, json: &str) -> AclResult<Self> {
        let defs: Vec<PermissionDef> =
            serde_json::from_str(json).map_err(|e| AclError::Deserialization(e.to_string()))?;
        self.permissions.extend(defs);
        Ok(self)
    }
}
