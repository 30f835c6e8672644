//! OpenAI-compatible streaming provider.
//!
//! Works with: OpenAI, OpenRouter, Ollama, vLLM, Together AI, Fireworks AI,
//! and any endpoint exposing a streaming `/v1/chat/completions`.

use async_trait::async_trait;
use conclave_core::error::ProviderError;
use conclave_core::message::{Message, Role};
use conclave_core::provider::{CompletionRequest, DeltaSink, Provider};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    /// Create a new OpenAI-compatible provider.
    ///
    /// No overall request timeout is set on the client; the agent loop
    /// bounds each completion call itself.
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Create an OpenRouter provider (convenience constructor).
    pub fn openrouter(api_key: impl Into<String>) -> Self {
        Self::new("openrouter", "https://openrouter.ai/api/v1", api_key)
    }

    /// Create an OpenAI provider (convenience constructor).
    pub fn openai(api_key: impl Into<String>) -> Self {
        Self::new("openai", "https://api.openai.com/v1", api_key)
    }

    /// Create an Ollama provider (convenience constructor).
    pub fn ollama(base_url: Option<&str>) -> Self {
        Self::new(
            "ollama",
            base_url.unwrap_or("http://localhost:11434/v1"),
            "ollama", // Ollama doesn't need a real key
        )
    }

    /// Convert our Message types to OpenAI API format.
    ///
    /// Tool results travel as user messages: calls are requested through
    /// text directives, so there is no native tool call to answer.
    fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::User | Role::Tool => "user".into(),
                    Role::Assistant => "assistant".into(),
                    Role::System => "system".into(),
                },
                content: m.content.clone(),
            })
            .collect()
    }

    fn request_body(request: &CompletionRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "temperature": request.temperature,
            "stream": true,
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        if !request.stop.is_empty() {
            body["stop"] = serde_json::json!(request.stop);
        }

        body
    }

    async fn open_stream(
        &self,
        request: &CompletionRequest,
    ) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);

        debug!(provider = %self.name, model = %request.model, "Sending streaming request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&Self::request_body(request))
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        let status = response.status().as_u16();

        if status == 429 {
            return Err(ProviderError::RateLimited {
                retry_after_secs: 5,
            });
        }

        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Provider streaming error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        on_delta: DeltaSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            response = self.open_stream(&request) => response?,
        };

        let mut byte_stream = response.bytes_stream();
        let mut lines = SseLineBuffer::default();
        let mut full_text = String::new();

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                chunk = byte_stream.next() => chunk,
            };

            let bytes = match chunk {
                Some(Ok(b)) => b,
                Some(Err(e)) => return Err(ProviderError::StreamInterrupted(e.to_string())),
                // Stream ended without [DONE]
                None => return Ok(full_text),
            };

            for event in lines.push(&bytes) {
                match event {
                    SseEvent::Done => return Ok(full_text),
                    SseEvent::Data(data) => match parse_content_delta(&data) {
                        Ok(Some(delta)) => {
                            on_delta(&delta);
                            full_text.push_str(&delta);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            trace!(
                                provider = %self.name,
                                data = %data,
                                error = %e,
                                "Ignoring unparseable SSE chunk"
                            );
                        }
                    },
                }
            }
        }
    }

    async fn health_check(&self) -> Result<bool, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        Ok(response.status().is_success())
    }
}

/// One parsed server-sent event.
#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Splits an SSE byte stream into complete `data:` events.
///
/// Bytes are buffered raw and only complete lines are decoded, so a
/// multi-byte character split across network chunks survives intact.
#[derive(Default)]
struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        while let Some(line_end) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=line_end).collect();
            let line = String::from_utf8_lossy(&raw[..line_end]);
            let line = line.trim_end_matches('\r');

            // Skip empty lines and SSE comments
            if line.is_empty() || line.starts_with(':') {
                continue;
            }

            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim();
                if data == "[DONE]" {
                    events.push(SseEvent::Done);
                } else if !data.is_empty() {
                    events.push(SseEvent::Data(data.to_string()));
                }
            }
        }
        events
    }
}

/// Extract the text delta of the first choice, if any.
fn parse_content_delta(data: &str) -> Result<Option<String>, serde_json::Error> {
    let chunk: StreamResponse = serde_json::from_str(data)?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty()))
}

// --- OpenAI API types (internal) ---

#[derive(Debug, Serialize, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

/// A single SSE `data: {...}` chunk from a streaming response.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openrouter_constructor() {
        let provider = OpenAiCompatProvider::openrouter("sk-test");
        assert_eq!(provider.name(), "openrouter");
        assert!(provider.base_url.contains("openrouter.ai"));
    }

    #[test]
    fn ollama_constructor() {
        let provider = OpenAiCompatProvider::ollama(None);
        assert_eq!(provider.name(), "ollama");
        assert!(provider.base_url.contains("localhost:11434"));
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let provider = OpenAiCompatProvider::new("x", "http://localhost:8000/v1/", "k");
        assert_eq!(provider.base_url, "http://localhost:8000/v1");
    }

    #[test]
    fn message_conversion() {
        let messages = vec![
            Message::system("You are helpful"),
            Message::user("Hello"),
            Message::assistant("Hi"),
            Message::tool_result("call_1", "[Tool result: echo]\nhi"),
        ];
        let api_messages = OpenAiCompatProvider::to_api_messages(&messages);
        let roles: Vec<&str> = api_messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
    }

    #[test]
    fn request_body_is_streaming() {
        let request = CompletionRequest {
            model: "gpt-4o".into(),
            messages: vec![Message::user("hi")],
            temperature: 0.2,
            max_tokens: Some(256),
            stop: vec![],
        };
        let body = OpenAiCompatProvider::request_body(&request);
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 256);
        assert!(body.get("stop").is_none());
    }

    // --- SSE parsing tests ---

    #[test]
    fn parse_stream_content_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        assert_eq!(parse_content_delta(data).unwrap().as_deref(), Some("Hello"));
    }

    #[test]
    fn parse_stream_finish_chunk() {
        let data = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        assert!(parse_content_delta(data).unwrap().is_none());
    }

    #[test]
    fn parse_usage_only_chunk() {
        let data = r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#;
        assert!(parse_content_delta(data).unwrap().is_none());
    }

    #[test]
    fn line_buffer_handles_split_lines() {
        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(b"data: {\"choices\":[{\"delta\":{\"con").is_empty());

        let events = buffer.push(b"tent\":\"Hel\"}}]}\n\ndata: [DONE]\n");
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            SseEvent::Data(r#"{"choices":[{"delta":{"content":"Hel"}}]}"#.into())
        );
        assert_eq!(events[1], SseEvent::Done);
    }

    #[test]
    fn line_buffer_keeps_characters_split_across_chunks() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"tool_name:「始」Hello「末」\"}}]}\n";
        let bytes = line.as_bytes();
        let split = line.find('「').unwrap() + 1;

        let mut buffer = SseLineBuffer::default();
        assert!(buffer.push(&bytes[..split]).is_empty());
        let events = buffer.push(&bytes[split..]);

        let [SseEvent::Data(data)] = events.as_slice() else {
            panic!("expected one data event, got {events:?}");
        };
        assert_eq!(
            parse_content_delta(data).unwrap().as_deref(),
            Some("tool_name:「始」Hello「末」")
        );
    }

    #[test]
    fn line_buffer_skips_comments_and_crlf() {
        let mut buffer = SseLineBuffer::default();
        let events = buffer.push(b": keep-alive\r\ndata: {\"x\":1}\r\n\r\n");
        assert_eq!(events, vec![SseEvent::Data(r#"{"x":1}"#.into())]);
    }

    #[tokio::test]
    async fn cancelled_before_connect() {
        let provider = OpenAiCompatProvider::new("dead", "http://127.0.0.1:9", "k");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let request = CompletionRequest {
            model: "m".into(),
            messages: vec![],
            temperature: 0.7,
            max_tokens: None,
            stop: vec![],
        };
        let err = provider.stream(request, &|_: &str| {}, &cancel).await.unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled));
    }
}
