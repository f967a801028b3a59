//! Error types for ACL storage and evaluation.

use thiserror::Error;

/// Errors raised by the ACL stores and the permission evaluator.
#[derive(Debug, Error)]
pub enum AclError {
    /// Uniqueness violation on create.
    #[error("duplicate: {0}")]
    Duplicate(String),

    /// Lookup miss. Callers decide whether absence means allow or deny.
    #[error("not found: {0}")]
    NotFound(String),

    /// Parent assignment would create a loop in the identity graph.
    #[error("cycle: object identity {child} cannot take {parent} as parent")]
    Cycle {
        /// Identity whose parent was being assigned.
        child: u64,
        /// Proposed parent.
        parent: u64,
    },

    /// Duplicate entry order or permission bit collision.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Permission name not present in the registry.
    #[error("unknown permission: {0}")]
    UnknownPermission(String),

    /// Stored data violates a structural invariant (cycle, dangling reference).
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// Deletion refused because other rows still point at the target.
    #[error("still referenced: {0}")]
    StillReferenced(String),

    /// Malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Caller may not administer the object identity.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Audit sink failed to flush.
    #[error("audit sink error: {0}")]
    Audit(#[from] crate::audit::AuditError),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl AclError {
    /// Returns `true` for lookup misses.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AclError::NotFound(_))
    }

    /// Returns `true` for read-time structural violations.
    pub fn is_integrity(&self) -> bool {
        matches!(self, AclError::Integrity(_))
    }
}

impl From<sled::transaction::TransactionError<AclError>> for AclError {
    fn from(err: sled::transaction::TransactionError<AclError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => AclError::Storage(e),
        }
    }
}

/// Result type for ACL operations.
pub type AclResult<T> = Result<T, AclError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AclError::Cycle { child: 7, parent: 3 };
        let msg = err.to_string();
        assert!(msg.contains("7"));
        assert!(msg.contains("3"));

        let err = AclError::UnknownPermission("approve".to_string());
        assert!(err.to_string().contains("approve"));
    }

    #[test]
    fn test_classification() {
        assert!(AclError::NotFound("oid 1".into()).is_not_found());
        assert!(!AclError::Duplicate("oid 1".into()).is_not_found());
        assert!(AclError::Integrity("loop".into()).is_integrity());
    }

    #[test]
    fn test_transaction_error_flattens_abort() {
        let err: AclError = sled::transaction::TransactionError::Abort(AclError::Conflict(
            "order 3".into(),
        ))
        .into();
        assert!(matches!(err, AclError::Conflict(_)));
    }
}
