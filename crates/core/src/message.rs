//! Context message types.
//!
//! A `Context` is the ordered list of messages submitted to a model for one
//! completion call. It is derived from session history and grows locally
//! inside a loop run as tool results are folded back in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The role of a message sender in a model context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user, or another speaker seen from a participant's perspective
    User,
    /// The participant being driven
    Assistant,
    /// System instructions (persona, roster, capabilities)
    System,
    /// Synthetic tool result entry
    Tool,
}

/// A single message in a model context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: String,

    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,

    /// If this is a tool result, which tool call it responds to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            tool_call_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Create a synthetic tool result entry.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut msg = Self::with_role(Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }
}

/// The ordered messages submitted to a model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    pub messages: Vec<Message>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message to the end of the context.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Get the total token count estimate (rough: 4 chars ≈ 1 token).
    pub fn estimated_tokens(&self) -> usize {
        self.messages.iter().map(|m| m.content.len() / 4).sum()
    }
}

impl From<Vec<Message>> for Context {
    fn from(messages: Vec<Message>) -> Self {
        Self { messages }
    }
}
