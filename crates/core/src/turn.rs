//! Turns and tool-call records — the append-only history of a session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool::ToolCall;

/// Author id used for turns written by the human user.
pub const USER_AUTHOR: &str = "user";

/// One contribution to a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,

    /// `"user"` or a participant id
    pub author_id: String,

    pub content: String,

    pub timestamp: DateTime<Utc>,

    /// Tool calls performed while producing this turn, in request order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRecord>,

    /// The run was cut short (interrupt or iteration ceiling)
    #[serde(default)]
    pub truncated: bool,

    /// The run hit its iteration ceiling without a natural answer
    #[serde(default)]
    pub truncated_by_iteration_limit: bool,

    /// Set when the run failed; `content` then explains the failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Model rounds used to produce this turn
    #[serde(default)]
    pub iterations: u32,
}

impl Turn {
    pub fn new(
        id: impl Into<String>,
        author_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            author_id: author_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            tool_calls: Vec::new(),
            truncated: false,
            truncated_by_iteration_limit: false,
            error: None,
            iterations: 0,
        }
    }

    /// A turn written by the human user.
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Uuid::new_v4().to_string(), USER_AUTHOR, content)
    }

    /// A turn explaining why a participant's run failed.
    pub fn failure(
        id: impl Into<String>,
        participant_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        let error = error.into();
        let mut turn = Self::new(
            id,
            participant_id,
            format!("I couldn't finish my reply because the model call failed: {error}"),
        );
        turn.error = Some(error);
        turn
    }

    pub fn is_user(&self) -> bool {
        self.author_id == USER_AUTHOR
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Lifecycle of a single tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Success,
    Error,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

/// The recorded outcome of one requested capability call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub status: ToolCallStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub duration_ms: u64,
}

impl ToolCallRecord {
    /// A fresh record for a requested call.
    pub fn pending(call: &ToolCall) -> Self {
        Self {
            call_id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            status: ToolCallStatus::Pending,
            output: None,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn mark_running(&mut self) {
        if self.status == ToolCallStatus::Pending {
            self.status = ToolCallStatus::Running;
        }
    }

    /// Settle as a success. Returns false if the record was already terminal.
    pub fn succeed(&mut self, output: impl Into<String>, duration_ms: u64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ToolCallStatus::Success;
        self.output = Some(output.into());
        self.duration_ms = duration_ms;
        true
    }

    /// Settle as a failure. Returns false if the record was already terminal.
    pub fn fail(&mut self, error: impl Into<String>, duration_ms: u64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = ToolCallStatus::Error;
        self.error = Some(error.into());
        self.duration_ms = duration_ms;
        true
    }

    pub fn is_success(&self) -> bool {
        self.status == ToolCallStatus::Success
    }

    /// Text folded back into the model context for this call.
    pub fn context_text(&self) -> String {
        match self.status {
            ToolCallStatus::Success => format!(
                "[Tool result: {}]\n{}",
                self.tool_name,
                self.output.as_deref().unwrap_or_default()
            ),
            ToolCallStatus::Error => format!(
                "[Tool result: {}]\nError: {}",
                self.tool_name,
                self.error.as_deref().unwrap_or("unknown error")
            ),
            ToolCallStatus::Pending | ToolCallStatus::Running => format!(
                "[Tool result: {}]\nError: call did not complete",
                self.tool_name
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> ToolCall {
        ToolCall {
            id: "call_1".into(),
            name: "echo".into(),
            arguments: serde_json::json!({"text": "hi"}),
        }
    }

    #[test]
    fn terminal_state_is_permanent() {
        let mut rec = ToolCallRecord::pending(&call());
        rec.mark_running();
        assert_eq!(rec.status, ToolCallStatus::Running);
        assert!(rec.succeed("hi", 3));
        assert!(!rec.fail("late failure", 9));
        assert_eq!(rec.status, ToolCallStatus::Success);
        assert_eq!(rec.output.as_deref(), Some("hi"));
        assert!(rec.error.is_none());
        assert_eq!(rec.duration_ms, 3);
    }

    #[test]
    fn failures_degrade_to_inline_error_text() {
        let mut rec = ToolCallRecord::pending(&call());
        rec.fail("disk full", 1);
        let text = rec.context_text();
        assert!(text.contains("echo"));
        assert!(text.contains("Error: disk full"));
    }

    #[test]
    fn user_turns_are_authored_by_user() {
        let turn = Turn::user("hello");
        assert!(turn.is_user());
        assert!(!turn.truncated);
    }

    #[test]
    fn failure_turn_explains_error() {
        let turn = Turn::failure("t1", "alice", "connection reset");
        assert!(turn.is_failure());
        assert!(turn.content.contains("connection reset"));
        assert_eq!(turn.author_id, "alice");
    }
}
