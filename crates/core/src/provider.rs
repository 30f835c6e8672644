//! Provider trait — the abstraction over streaming model transports.
//!
//! A Provider knows how to send a context to a model and stream the reply
//! back as text deltas. The agent loop calls `stream()` without knowing
//! which backend is being used.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::message::Message;

/// Configuration for a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The model to use (e.g., "anthropic/claude-sonnet-4", "gpt-4o")
    pub model: String,

    /// The context messages
    pub messages: Vec<Message>,

    /// Temperature (0.0 = deterministic, 1.0 = creative)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens to generate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

fn default_temperature() -> f32 {
    0.7
}

/// Receives text deltas in arrival order.
pub type DeltaSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// The core Provider trait.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A human-readable name for this provider (e.g., "openrouter").
    fn name(&self) -> &str;

    /// Stream a completion, forwarding each delta to `on_delta`, and return
    /// the full text once the stream ends.
    ///
    /// Must return `ProviderError::Cancelled` promptly once `cancel` fires.
    async fn stream(
        &self,
        request: CompletionRequest,
        on_delta: DeltaSink<'_>,
        cancel: &CancellationToken,
    ) -> std::result::Result<String, ProviderError>;

    /// Health check — can we reach the provider?
    async fn health_check(&self) -> std::result::Result<bool, ProviderError> {
        Ok(true)
    }
}
