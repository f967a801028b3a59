//! Audit notifications for decisions made by audited entries.
//!
//! The evaluator calls an [`AuditLogger`] only after a decision is final and
//! only when the deciding entry asked for it: `audit_success` on a grant,
//! `audit_failure` on a deny.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;

use crate::entry::AclEntry;
use crate::evaluator::Outcome;
use crate::object_identity::ObjectIdentityId;
use crate::permission::Mask;
use crate::sid::{CallerSids, SidId};
use crate::storage::key::current_timestamp;

/// Counter for generating unique event IDs.
static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a unique event ID using timestamp and counter.
fn generate_event_id() -> [u8; 16] {
    let ts = current_timestamp();
    let counter = EVENT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut id = [0u8; 16];
    id[0..8].copy_from_slice(&ts.to_be_bytes());
    id[8..16].copy_from_slice(&counter.to_be_bytes());
    id
}

/// A decision made by an entry whose audit flags asked for a record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Unique event ID.
    pub id: [u8; 16],
    /// Timestamp in microseconds since Unix epoch.
    pub timestamp: u64,
    /// SIDs of the caller, in evaluation order.
    pub caller: Vec<SidId>,
    /// Object identity the decision was requested for.
    pub object_identity: ObjectIdentityId,
    /// Requested permission bits.
    pub required: Mask,
    /// The deciding entry. May belong to an ancestor of `object_identity`.
    pub entry: AclEntry,
    /// Grant or deny.
    pub outcome: Outcome,
}

impl AuditEvent {
    /// Create an event for a decision made by `entry`.
    pub fn new(
        caller: &CallerSids,
        object_identity: ObjectIdentityId,
        required: Mask,
        entry: AclEntry,
        outcome: Outcome,
    ) -> Self {
        Self {
            id: generate_event_id(),
            timestamp: current_timestamp(),
            caller: caller.as_slice().to_vec(),
            object_identity,
            required,
            entry,
            outcome,
        }
    }

    /// Whether `entry`'s flags ask for a record of `outcome`.
    pub fn wanted(entry: &AclEntry, outcome: Outcome) -> bool {
        match outcome {
            Outcome::Grant => entry.audit_success,
            Outcome::Deny => entry.audit_failure,
        }
    }

    /// Format the event as a log line.
    pub fn to_log_line(&self) -> String {
        let caller: Vec<String> = self.caller.iter().map(|s| s.0.to_string()).collect();
        format!(
            "{} id={} {} oid={} required={} entry={} order={} sid={} caller=[{}]",
            self.timestamp,
            hex::encode(self.id),
            match self.outcome {
                Outcome::Grant => "GRANTED",
                Outcome::Deny => "DENIED",
            },
            self.object_identity.0,
            self.required,
            self.entry.id.0,
            self.entry.order,
            self.entry.sid.0,
            caller.join(",")
        )
    }

    /// Serialize the event as one line of JSON.
    pub fn to_json_line(&self) -> Result<String, AuditError> {
        serde_json::to_string(self).map_err(|e| AuditError(e.to_string()))
    }
}

/// Audit logging error.
#[derive(Debug, Error)]
#[error("audit error: {0}")]
pub struct AuditError(pub String);

/// Trait for audit sinks.
pub trait AuditLogger: Send + Sync {
    /// Record an audit event.
    fn log(&self, event: AuditEvent);

    /// Flush any buffered events.
    fn flush(&self) -> Result<(), AuditError>;
}

impl<T: AuditLogger + ?Sized> AuditLogger for Arc<T> {
    fn log(&self, event: AuditEvent) {
        (**self).log(event)
    }

    fn flush(&self) -> Result<(), AuditError> {
        (**self).flush()
    }
}

/// In-memory audit logger for testing.
#[derive(Debug, Default)]
pub struct MemoryAuditLogger {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditLogger {
    /// Create a new memory logger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all logged events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Clear all events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Get event count.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Check if empty.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditLogger for MemoryAuditLogger {
    fn log(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// No-op audit logger that discards all events.
#[derive(Debug, Default)]
pub struct NullAuditLogger;

impl AuditLogger for NullAuditLogger {
    fn log(&self, _event: AuditEvent) {}

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Audit logger that emits `tracing` events under the `objacl::audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditLogger;

impl AuditLogger for TracingAuditLogger {
    fn log(&self, event: AuditEvent) {
        tracing::info!(
            target: "objacl::audit",
            event_id = %hex::encode(event.id),
            outcome = ?event.outcome,
            object_identity = event.object_identity.0,
            required = %event.required,
            entry = event.entry.id.0,
            order = event.entry.order,
            sid = event.entry.sid.0,
            "acl decision"
        );
    }

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Audit logger writing one JSON document per line.
pub struct JsonLinesAuditLogger<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesAuditLogger<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Unwrap the writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> AuditLogger for JsonLinesAuditLogger<W> {
    fn log(&self, event: AuditEvent) {
        let line = match event.to_json_line() {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode audit event");
                return;
            }
        };
        let mut writer = self.writer.lock();
        if let Err(e) = writeln!(writer, "{}", line) {
            tracing::warn!(error = %e, "failed to write audit event");
        }
    }

    fn flush(&self) -> Result<(), AuditError> {
        self.writer
            .lock()
            .flush()
            .map_err(|e| AuditError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::EntryId;

    fn sample_entry(audit_success: bool, audit_failure: bool) -> AclEntry {
        AclEntry {
            id: EntryId(11),
            object_identity: ObjectIdentityId(4),
            order: 2,
            sid: SidId(9),
            mask: Mask::READ,
            granting: true,
            audit_success,
            audit_failure,
        }
    }

    fn sample_event() -> AuditEvent {
        AuditEvent::new(
            &CallerSids::new([SidId(9), SidId(12)]),
            ObjectIdentityId(4),
            Mask::READ,
            sample_entry(true, false),
            Outcome::Grant,
        )
    }

    #[test]
    fn test_wanted() {
        assert!(AuditEvent::wanted(&sample_entry(true, false), Outcome::Grant));
        assert!(!AuditEvent::wanted(&sample_entry(true, false), Outcome::Deny));
        assert!(AuditEvent::wanted(&sample_entry(false, true), Outcome::Deny));
    }

    #[test]
    fn test_event_ids_unique() {
        assert_ne!(sample_event().id, sample_event().id);
    }

    #[test]
    fn test_event_to_log_line() {
        let line = sample_event().to_log_line();
        assert!(line.contains("GRANTED"));
        assert!(line.contains("oid=4"));
        assert!(line.contains("entry=11"));
        assert!(line.contains("caller=[9,12]"));
    }

    #[test]
    fn test_memory_logger() {
        let logger = MemoryAuditLogger::new();
        logger.log(sample_event());
        logger.log(sample_event());
        assert_eq!(logger.len(), 2);

        logger.clear();
        assert!(logger.is_empty());
    }

    #[test]
    fn test_json_lines_logger() {
        let logger = JsonLinesAuditLogger::new(Vec::new());
        logger.log(sample_event());
        logger.flush().unwrap();

        let output = String::from_utf8(logger.into_inner()).unwrap();
        let value: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
        assert_eq!(value["outcome"], "Grant");
        assert_eq!(value["object_identity"], 4);
        assert_eq!(value["entry"]["order"], 2);
    }

    #[test]
    fn test_null_logger() {
        let logger = NullAuditLogger;
        logger.log(sample_event());
        logger.flush().unwrap();
    }
}
