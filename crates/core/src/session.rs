//! Session identity and speaking-mode policy names.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Policy deciding who answers a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SpeakingMode {
    /// Round-robin over the selectable participants
    #[default]
    Sequential,
    /// One participant, uniformly at random
    Random,
    /// One participant, weighted by relevance to the message
    WeightedRandom,
    /// Participants addressed with `@name`
    Mention,
    /// Participants whose keywords occur in the message
    Keyword,
    /// Nobody automatically; the caller invites explicitly
    Invitation,
    /// Every selectable participant
    Consensus,
}

impl SpeakingMode {
    pub const ALL: [SpeakingMode; 7] = [
        Self::Sequential,
        Self::Random,
        Self::WeightedRandom,
        Self::Mention,
        Self::Keyword,
        Self::Invitation,
        Self::Consensus,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Random => "random",
            Self::WeightedRandom => "weighted-random",
            Self::Mention => "mention",
            Self::Keyword => "keyword",
            Self::Invitation => "invitation",
            Self::Consensus => "consensus",
        }
    }
}

impl std::fmt::Display for SpeakingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SpeakingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|mode| mode.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown speaking mode: {s}"))
    }
}
