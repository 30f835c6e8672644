//! Participants — the AI speakers of a session.

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// The part a participant plays in a conversation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    /// Preferred speaker when the flow-lock fires
    Host,
    #[default]
    Participant,
    /// Listens only; never selected automatically
    Observer,
    Expert,
    Moderator,
}

/// Generation status of a participant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantStatus {
    #[default]
    Idle,
    Thinking,
    Speaking,
    Error,
}

impl ParticipantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Error => "error",
        }
    }

    /// Whether `self -> next` is a legal status transition.
    ///
    /// The generation cycle is `idle -> thinking -> speaking -> idle`. A run
    /// that ends before its first delta goes `thinking -> idle`. Any state may
    /// fall into `error`, and `error` recovers to `idle`.
    pub fn can_transition_to(self, next: ParticipantStatus) -> bool {
        use ParticipantStatus::*;
        matches!(
            (self, next),
            (Idle, Thinking)
                | (Thinking, Speaking)
                | (Thinking, Idle)
                | (Speaking, Idle)
                | (_, Error)
                | (Error, Idle)
        )
    }
}

impl std::fmt::Display for ParticipantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which model a participant speaks through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelBinding {
    /// Provider name as registered in the provider router (None = default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Model identifier passed to the provider
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

impl ModelBinding {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            provider: None,
            model: model.into(),
            temperature: default_temperature(),
            max_tokens: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

/// An AI speaker in a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    /// Unique within its session
    pub id: String,

    pub display_name: String,

    #[serde(default)]
    pub role: ParticipantRole,

    #[serde(default)]
    pub status: ParticipantStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelBinding>,

    /// Persona instructions placed at the top of the participant's context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Topic tags used by weighted-random selection
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Trigger words used by keyword selection
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role: ParticipantRole::default(),
            status: ParticipantStatus::Idle,
            model: None,
            system_prompt: None,
            tags: Vec::new(),
            keywords: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: ParticipantRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_model(mut self, model: ModelBinding) -> Self {
        self.model = Some(model);
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Whether automatic selection policies may pick this participant.
    pub fn auto_selectable(&self) -> bool {
        self.role != ParticipantRole::Observer
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&mut self, next: ParticipantStatus) -> Result<(), SessionError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                participant_id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Receives participant status changes from a running loop.
pub trait StatusTracker: Send + Sync {
    fn set_status(&self, participant_id: &str, status: ParticipantStatus);
}

/// A tracker that ignores every update.
pub struct NoopStatusTracker;

impl StatusTracker for NoopStatusTracker {
    fn set_status(&self, _participant_id: &str, _status: ParticipantStatus) {}
}
