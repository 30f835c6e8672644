//! Streaming notifications for subscribers of a session.

use serde::{Deserialize, Serialize};

/// Where a participant's in-flight output stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamPhase {
    Thinking,
    Streaming,
    Complete,
}

/// Events emitted by a session's stream multiplexer.
///
/// - `thinking` — a participant started generating
/// - `render`   — a throttled snapshot of the text so far
/// - `complete` — the authoritative final text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Thinking {
        participant_id: String,
        turn_id: String,
    },

    Render {
        participant_id: String,
        turn_id: String,
        /// Everything streamed so far, not just the latest delta
        text: String,
    },

    Complete {
        participant_id: String,
        turn_id: String,
        text: String,
        truncated: bool,
    },
}

impl StreamEvent {
    /// SSE-style event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Thinking { .. } => "thinking",
            Self::Render { .. } => "render",
            Self::Complete { .. } => "complete",
        }
    }

    pub fn participant_id(&self) -> &str {
        match self {
            Self::Thinking { participant_id, .. }
            | Self::Render { participant_id, .. }
            | Self::Complete { participant_id, .. } => participant_id,
        }
    }

    pub fn turn_id(&self) -> &str {
        match self {
            Self::Thinking { turn_id, .. }
            | Self::Render { turn_id, .. }
            | Self::Complete { turn_id, .. } => turn_id,
        }
    }
}
