//! Permission evaluation.
//!
//! Given a caller's SIDs, an object identity and a required mask:
//!
//! 1. If the identity's owner is one of the caller's SIDs, grant. Entries are
//!    not consulted.
//! 2. Otherwise walk the inheritance chain (the identity, then ancestors while
//!    each node's own `entries_inheriting` flag allows), scanning each node's
//!    entries in ascending order.
//! 3. The first entry whose SID belongs to the caller and whose mask covers
//!    every required bit decides: grant if it is granting, deny otherwise.
//! 4. If nothing matches, deny.
//!
//! Evaluation only reads. Any error while computing a decision, including a
//! corrupt parent chain, yields a deny from [`PermissionEvaluator::decide`].

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::audit::{AuditEvent, AuditLogger};
use crate::entry::{AclEntry, EntrySource};
use crate::error::{AclError, AclResult};
use crate::object_identity::{AncestorChain, ObjectIdentityId, ObjectIdentitySource};
use crate::permission::Mask;
use crate::sid::{CallerSids, SidId};

/// Result of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Outcome {
    /// Permission granted.
    Grant,
    /// Permission denied.
    Deny,
}

impl Outcome {
    /// Whether this is a grant.
    pub fn is_grant(self) -> bool {
        self == Outcome::Grant
    }
}

/// Why a decision came out the way it did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionBasis {
    /// The caller owns the object identity.
    Owner {
        /// The owning SID.
        owner: SidId,
    },
    /// An entry matched.
    Entry {
        /// The deciding entry.
        entry: AclEntry,
        /// 0 for the identity itself, 1 for its parent, and so on.
        depth: usize,
    },
    /// The chain was exhausted without a match.
    NoMatchingEntry {
        /// Number of chain nodes examined.
        nodes: usize,
    },
    /// The decision could not be computed. Always paired with a deny.
    Failed {
        /// Description of the underlying error.
        reason: String,
    },
}

/// An authorization decision with its explanation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Grant or deny.
    pub outcome: Outcome,
    /// Explanation for audit and diagnostics.
    pub basis: DecisionBasis,
}

impl Decision {
    fn failed(err: &AclError) -> Self {
        Self {
            outcome: Outcome::Deny,
            basis: DecisionBasis::Failed {
                reason: err.to_string(),
            },
        }
    }

    /// Whether the permission is granted.
    pub fn is_granted(&self) -> bool {
        self.outcome.is_grant()
    }

    /// The entry that decided, if one did.
    pub fn deciding_entry(&self) -> Option<&AclEntry> {
        match &self.basis {
            DecisionBasis::Entry { entry, .. } => Some(entry),
            _ => None,
        }
    }
}

/// Evaluates `(caller, object identity, mask)` triples.
///
/// Holds read-only views of the identity and entry relations; it has no way
/// to mutate either.
pub struct PermissionEvaluator<'a> {
    objects: &'a dyn ObjectIdentitySource,
    entries: &'a dyn EntrySource,
    audit: Option<&'a dyn AuditLogger>,
}

impl<'a> PermissionEvaluator<'a> {
    /// Create an evaluator over the given sources, without auditing.
    pub fn new(objects: &'a dyn ObjectIdentitySource, entries: &'a dyn EntrySource) -> Self {
        Self {
            objects,
            entries,
            audit: None,
        }
    }

    /// Send audit notifications to `audit`.
    pub fn with_audit(mut self, audit: &'a dyn AuditLogger) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Evaluate and surface errors.
    ///
    /// An empty `required` mask is rejected with [`AclError::InvalidArgument`]:
    /// every entry would trivially cover it.
    #[instrument(
        level = "debug",
        skip_all,
        fields(object_identity = oid.0, required = %required, callers = caller.len())
    )]
    pub fn evaluate(
        &self,
        caller: &CallerSids,
        oid: ObjectIdentityId,
        required: Mask,
    ) -> AclResult<Decision> {
        if required.is_empty() {
            return Err(AclError::InvalidArgument(
                "required mask has no bits set".to_string(),
            ));
        }

        let mut nodes = 0usize;
        for node in AncestorChain::new(self.objects, oid) {
            let node = node?;

            if nodes == 0 {
                if let Some(owner) = node.owner.filter(|owner| caller.contains(*owner)) {
                    tracing::debug!(owner = owner.0, "granted by ownership");
                    return Ok(Decision {
                        outcome: Outcome::Grant,
                        basis: DecisionBasis::Owner { owner },
                    });
                }
            }

            let matched = self
                .entries
                .entries_for(node.id)?
                .into_iter()
                .find(|entry| caller.contains(entry.sid) && entry.mask.contains(required));

            if let Some(entry) = matched {
                let outcome = if entry.granting {
                    Outcome::Grant
                } else {
                    Outcome::Deny
                };
                tracing::debug!(
                    outcome = ?outcome,
                    entry = entry.id.0,
                    order = entry.order,
                    depth = nodes,
                    "decided by entry"
                );
                self.notify(caller, oid, required, &entry, outcome);
                return Ok(Decision {
                    outcome,
                    basis: DecisionBasis::Entry {
                        entry,
                        depth: nodes,
                    },
                });
            }

            nodes += 1;
        }

        tracing::debug!(nodes, "no matching entry, denying");
        Ok(Decision {
            outcome: Outcome::Deny,
            basis: DecisionBasis::NoMatchingEntry { nodes },
        })
    }

    /// Evaluate, failing closed: any error becomes a deny.
    pub fn decide(&self, caller: &CallerSids, oid: ObjectIdentityId, required: Mask) -> Decision {
        match self.evaluate(caller, oid, required) {
            Ok(decision) => decision,
            Err(err) => {
                if err.is_integrity() {
                    tracing::error!(
                        object_identity = oid.0,
                        error = %err,
                        "integrity violation during evaluation, denying"
                    );
                } else {
                    tracing::warn!(
                        object_identity = oid.0,
                        error = %err,
                        "evaluation failed, denying"
                    );
                }
                Decision::failed(&err)
            }
        }
    }

    /// Shorthand for `decide(..).is_granted()`.
    pub fn is_granted(&self, caller: &CallerSids, oid: ObjectIdentityId, required: Mask) -> bool {
        self.decide(caller, oid, required).is_granted()
    }

    /// Grant if any of `alternatives` is granted on its own.
    ///
    /// Each mask is evaluated separately with all-of semantics. Returns the
    /// first grant, or the last deny if none is granted.
    pub fn decide_any(
        &self,
        caller: &CallerSids,
        oid: ObjectIdentityId,
        alternatives: &[Mask],
    ) -> Decision {
        let mut last = Decision::failed(&AclError::InvalidArgument(
            "no permissions requested".to_string(),
        ));
        for required in alternatives {
            let decision = self.decide(caller, oid, *required);
            if decision.is_granted() {
                return decision;
            }
            last = decision;
        }
        last
    }

    fn notify(
        &self,
        caller: &CallerSids,
        oid: ObjectIdentityId,
        required: Mask,
        entry: &AclEntry,
        outcome: Outcome,
    ) {
        let Some(audit) = self.audit else {
            return;
        };
        if AuditEvent::wanted(entry, outcome) {
            audit.log(AuditEvent::new(caller, oid, required, entry.clone(), outcome));
        }
    }
}
