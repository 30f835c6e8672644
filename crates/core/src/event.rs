//! Domain event system — decoupled communication between components.
//!
//! Events are published when something interesting happens in a session.
//! Front-ends and loggers subscribe to react without tight coupling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::participant::ParticipantStatus;

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    SessionCreated {
        session_id: String,
        participants: usize,
        timestamp: DateTime<Utc>,
    },

    SessionDestroyed {
        session_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A completed turn was appended to a session's history
    TurnAppended {
        session_id: String,
        turn_id: String,
        author_id: String,
        truncated: bool,
        timestamp: DateTime<Utc>,
    },

    ParticipantStatusChanged {
        session_id: String,
        participant_id: String,
        status: ParticipantStatus,
        timestamp: DateTime<Utc>,
    },

    /// A tool call settled
    ToolExecuted {
        session_id: String,
        participant_id: String,
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// The idle timer invited a participant to speak
    FlowLockTriggered {
        session_id: String,
        participant_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A loop run ended with a transport failure
    LoopFailed {
        session_id: String,
        participant_id: String,
        error_message: String,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
