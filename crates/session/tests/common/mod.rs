#![allow(dead_code)]

use async_trait::async_trait;
use conclave_core::error::{ProviderError, ToolError};
use conclave_core::participant::{ModelBinding, Participant};
use conclave_core::persistence::{PersistenceQueue, PersistenceSink};
use conclave_core::provider::{CompletionRequest, DeltaSink, Provider};
use conclave_core::tool::{Tool, ToolRegistry, ToolResult};
use conclave_providers::router::ProviderRouter;
use conclave_session::SessionRegistry;
use conclave_tools::audit::AuditLog;
use conclave_tools::runner::ToolInvocationRunner;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub enum Step {
    Say(String),
    /// Stream the text, then hang until cancelled
    Stall(String),
    Fail(ProviderError),
}

/// Plays back a script; repeats the last step once the script runs out.
pub struct ScriptedProvider {
    steps: Mutex<VecDeque<Step>>,
    last: Mutex<Option<Step>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn saying(text: &str) -> Arc<Self> {
        Self::new(vec![Step::Say(text.to_string())])
    }

    pub fn stalling(text: &str) -> Arc<Self> {
        Self::new(vec![Step::Stall(text.to_string())])
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
        let step = {
            let next = self.steps.lock().pop_front();
            let mut last = self.last.lock();
            if let Some(step) = next {
                *last = Some(step);
            }
            last.clone()
        };

        match step {
            Some(Step::Say(text)) => {
                for word in text.split_inclusive(' ') {
                    if cancel.is_cancelled() {
                        return Err(ProviderError::Cancelled);
                    }
                    on_delta(word);
                    tokio::task::yield_now().await;
                }
                Ok(text)
            }
            Some(Step::Stall(text)) => {
                on_delta(&text);
                cancel.cancelled().await;
                Err(ProviderError::Cancelled)
            }
            Some(Step::Fail(error)) => Err(error),
            None => Ok(String::new()),
        }
    }
}

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
        _cancel: &CancellationToken,
    ) -> Result<ToolResult, ToolError> {
        Ok(ToolResult::ok(arguments["text"].as_str().unwrap_or_default()))
    }
}

/// Participant bound to the provider registered under its own id.
pub fn participant(id: &str, display_name: &str) -> Participant {
    Participant::new(id, display_name).with_model(ModelBinding::new("test-model").with_provider(id))
}

pub fn registry(providers: &[(&str, Arc<ScriptedProvider>)]) -> SessionRegistry {
    registry_with_tools(providers, ToolRegistry::new())
}

pub fn registry_with_tools(
    providers: &[(&str, Arc<ScriptedProvider>)],
    tools: ToolRegistry,
) -> SessionRegistry {
    let mut router = ProviderRouter::new("default");
    for (name, provider) in providers {
        router.register(*name, Arc::clone(provider) as Arc<dyn Provider>);
    }
    let runner = ToolInvocationRunner::new(Arc::new(tools), Arc::new(AuditLog::new()));
    SessionRegistry::new(Arc::new(router), Arc::new(runner))
}

/// Like [`registry_with_tools`], with turns and tool outcomes sharing one
/// persistence queue.
pub fn registry_with_persistence(
    providers: &[(&str, Arc<ScriptedProvider>)],
    tools: ToolRegistry,
    sink: Arc<dyn PersistenceSink>,
) -> SessionRegistry {
    let mut router = ProviderRouter::new("default");
    for (name, provider) in providers {
        router.register(*name, Arc::clone(provider) as Arc<dyn Provider>);
    }
    let queue = PersistenceQueue::start(sink);
    let audit = AuditLog::new().with_persistence(queue.clone());
    let runner = ToolInvocationRunner::new(Arc::new(tools), Arc::new(audit));
    SessionRegistry::new(Arc::new(router), Arc::new(runner)).with_persistence(queue)
}

/// Poll `condition` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}
