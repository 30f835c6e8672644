//! Audit logging — every settled tool call, recorded unconditionally.
//!
//! Entries are kept in memory for queries, handed to any number of
//! [`AuditSink`]s, forwarded to the persistence sink, and announced on the
//! event bus.

use chrono::{DateTime, Utc};
use conclave_core::event::{DomainEvent, EventBus};
use conclave_core::persistence::{PersistedRecord, PersistenceQueue};
use conclave_core::turn::ToolCallRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single audit log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    /// The participant whose loop requested the call
    pub actor: String,
    pub call_id: String,
    pub tool_name: String,
    pub outcome: AuditOutcome,
    pub duration_ms: u64,
    pub details: Option<String>,
}

/// Outcome of an audited call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// Trait for audit log sinks (where entries are written).
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// In-memory audit log with optional forwarding.
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
    sinks: Vec<Box<dyn AuditSink>>,
    persistence: Option<PersistenceQueue>,
    events: Option<Arc<EventBus>>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("entry_count", &self.entries.lock().len())
            .field("sink_count", &self.sinks.len())
            .field("persistent", &self.persistence.is_some())
            .finish()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    /// Create a new audit log with no sinks.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sinks: Vec::new(),
            persistence: None,
            events: None,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_persistence(mut self, queue: PersistenceQueue) -> Self {
        self.persistence = Some(queue);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    /// Record a settled call.
    pub fn record(&self, session_id: &str, participant_id: &str, call: &ToolCallRecord) {
        let (outcome, details) = if call.is_success() {
            (AuditOutcome::Success, None)
        } else {
            (AuditOutcome::Failure, call.error.clone())
        };

        let entry = AuditEntry {
            timestamp: Utc::now(),
            session_id: session_id.into(),
            actor: participant_id.into(),
            call_id: call.call_id.clone(),
            tool_name: call.tool_name.clone(),
            outcome,
            duration_ms: call.duration_ms,
            details,
        };

        self.entries.lock().push(entry.clone());

        for sink in &self.sinks {
            sink.record(&entry);
        }

        if let Some(queue) = &self.persistence {
            queue.persist(PersistedRecord::ToolCall {
                session_id: session_id.into(),
                participant_id: participant_id.into(),
                record: call.clone(),
            });
        }

        if let Some(bus) = &self.events {
            bus.publish(DomainEvent::ToolExecuted {
                session_id: session_id.into(),
                participant_id: participant_id.into(),
                tool_name: call.tool_name.clone(),
                success: outcome == AuditOutcome::Success,
                duration_ms: call.duration_ms,
                timestamp: entry.timestamp,
            });
        }
    }

    /// Get all recorded entries.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn entries_for_tool(&self, tool_name: &str) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.tool_name == tool_name)
            .cloned()
            .collect()
    }

    pub fn failures(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.outcome == AuditOutcome::Failure)
            .cloned()
            .collect()
    }

    /// Clear all stored entries.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Count of stored entries.
    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }
}

/// A tracing-based audit sink that logs entries via `tracing::info!`.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &AuditEntry) {
        tracing::info!(
            session_id = %entry.session_id,
            actor = %entry.actor,
            tool = %entry.tool_name,
            outcome = ?entry.outcome,
            duration_ms = entry.duration_ms,
            details = ?entry.details,
            "AUDIT"
        );
    }
}
