//! Shared test helpers for agent tests.

use async_trait::async_trait;
use conclave_core::error::{ProviderError, ToolError};
use conclave_core::participant::{ParticipantStatus, StatusTracker};
use conclave_core::provider::{CompletionRequest, DeltaSink, Provider};
use conclave_core::tool::{Tool, ToolRegistry, ToolResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One scripted provider response.
#[derive(Clone)]
pub enum Step {
    /// Stream these chunks, then finish
    Say(Vec<String>),
    /// Stream these chunks, then hang until cancelled
    Stall(Vec<String>),
    /// Fail without streaming anything
    Fail(ProviderError),
}

impl Step {
    pub fn say(text: &str) -> Self {
        Self::Say(vec![text.to_string()])
    }

    pub fn chunks(chunks: &[&str]) -> Self {
        Self::Say(chunks.iter().map(|c| c.to_string()).collect())
    }
}

/// A provider that plays back a script, one step per call.
///
/// Once the script runs out, `repeat` (if set) answers every further call;
/// otherwise the call fails.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    repeat: Option<Step>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            repeat: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn always(step: Step) -> Self {
        Self {
            steps: Mutex::new(VecDeque::new()),
            repeat: Some(step),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        request: CompletionRequest,
        on_delta: DeltaSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        self.requests.lock().push(request);
        let step = self.steps.lock().pop_front().or_else(|| self.repeat.clone());

        match step {
            Some(Step::Say(chunks)) => {
                let mut full = String::new();
                for chunk in chunks {
                    if cancel.is_cancelled() {
                        return Err(ProviderError::Cancelled);
                    }
                    on_delta(&chunk);
                    full.push_str(&chunk);
                    tokio::task::yield_now().await;
                }
                Ok(full)
            }
            Some(Step::Stall(chunks)) => {
                for chunk in chunks {
                    on_delta(&chunk);
                }
                cancel.cancelled().await;
                Err(ProviderError::Cancelled)
            }
            Some(Step::Fail(error)) => Err(error),
            None => Err(ProviderError::ApiError {
                status_code: 500,
                message: "script exhausted".into(),
            }),
        }
    }
}

/// Echoes its `text` argument, optionally after `ms` milliseconds.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo back the text argument"
    }

    async fn execute(
        &self,
        arguments: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        let text = arguments["text"].as_str().unwrap_or_default().to_string();
        let ms = arguments["ms"]
            .as_str()
            .and_then(|ms| ms.parse::<u64>().ok())
            .unwrap_or(0);
        tokio::select! {
            _ = cancel.cancelled() => Err(ToolError::Cancelled { tool_name: "echo".into() }),
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(ToolResult::ok(text)),
        }
    }
}

pub fn echo_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(EchoTool));
    registry
}

/// Records every status a loop reports.
#[derive(Default)]
pub struct RecordingTracker {
    seen: Mutex<Vec<(String, ParticipantStatus)>>,
}

impl RecordingTracker {
    pub fn statuses(&self, participant_id: &str) -> Vec<ParticipantStatus> {
        self.seen
            .lock()
            .iter()
            .filter(|(id, _)| id == participant_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

impl StatusTracker for RecordingTracker {
    fn set_status(&self, participant_id: &str, status: ParticipantStatus) {
        self.seen.lock().push((participant_id.to_string(), status));
    }
}
