//! The agentic loop: one participant's reply, built over one or more model rounds.
//!
//! Each round streams a completion into the multiplexer. If the reply asks
//! for tools, the calls fan out through the [`ToolInvocationRunner`], their
//! results are folded back into the local context and the model is asked
//! again. The loop ends when a reply asks for nothing, when the iteration
//! limit is hit, or when the run is cancelled.

use chrono::Utc;
use conclave_core::error::{Error, ProviderError, Result};
use conclave_core::event::{DomainEvent, EventBus};
use conclave_core::message::{Context, Message};
use conclave_core::participant::{NoopStatusTracker, Participant, ParticipantStatus, StatusTracker};
use conclave_core::provider::{CompletionRequest, Provider};
use conclave_core::turn::{ToolCallRecord, Turn};
use conclave_tools::directive;
use conclave_tools::runner::{InvocationContext, ToolInvocationRunner};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::stream::StreamMultiplexer;

pub const DEFAULT_MAX_ITERATIONS: u32 = 10;
pub const DEFAULT_MODEL_TIMEOUT: Duration = Duration::from_secs(300);

/// Separates the visible text of consecutive rounds.
const ROUND_SEPARATOR: &str = "\n\n";

/// Drives model rounds and tool fan-out for a single participant turn.
pub struct AgentLoop {
    /// Transport used for every round
    provider: Arc<dyn Provider>,

    /// Executes the tool calls a round asks for
    runner: Arc<ToolInvocationRunner>,

    /// Where streamed output goes
    multiplexer: StreamMultiplexer,

    /// Told about thinking/speaking/idle/error changes
    status: Arc<dyn StatusTracker>,

    event_bus: Option<Arc<EventBus>>,

    session_id: String,

    /// Hard cap on model rounds per turn
    max_iterations: u32,

    /// Upper bound on a single model round
    model_timeout: Duration,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn Provider>,
        runner: Arc<ToolInvocationRunner>,
        multiplexer: StreamMultiplexer,
    ) -> Self {
        Self {
            provider,
            runner,
            multiplexer,
            status: Arc::new(NoopStatusTracker),
            event_bus: None,
            session_id: String::new(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            model_timeout: DEFAULT_MODEL_TIMEOUT,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_status_tracker(mut self, status: Arc<dyn StatusTracker>) -> Self {
        self.status = status;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    /// Set the maximum number of model rounds per turn. Zero is treated as one.
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max.max(1);
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    /// Run one turn under a freshly generated turn id.
    pub async fn run(
        &self,
        participant: &Participant,
        context: Context,
        cancel: &CancellationToken,
    ) -> Result<Turn> {
        let turn_id = Uuid::new_v4().to_string();
        self.run_turn(&turn_id, participant, context, cancel).await
    }

    /// Run one turn for `participant`, starting from `context`.
    ///
    /// The context is private to this run; assistant replies and tool
    /// results are appended to it locally and never reach session history.
    /// Cancellation is not an error: the turn comes back marked truncated
    /// with whatever visible text was produced so far. A transport failure
    /// completes the stream with an explanation, sets the participant to
    /// `Error` and is returned.
    pub async fn run_turn(
        &self,
        turn_id: &str,
        participant: &Participant,
        mut context: Context,
        cancel: &CancellationToken,
    ) -> Result<Turn> {
        let binding = participant.model.as_ref().ok_or_else(|| Error::Config {
            message: format!("participant '{}' has no model bound", participant.id),
        })?;
        let pid = participant.id.as_str();

        info!(
            session_id = %self.session_id,
            participant_id = pid,
            turn_id,
            model = %binding.model,
            "Starting turn"
        );

        self.status.set_status(pid, ParticipantStatus::Thinking);
        self.multiplexer.begin_thinking(pid, turn_id);

        let spoke = AtomicBool::new(false);
        let mut visible_parts: Vec<String> = Vec::new();
        let mut records: Vec<ToolCallRecord> = Vec::new();
        let mut iterations: u32 = 0;
        let mut truncated = false;
        let mut hit_limit = false;

        loop {
            if cancel.is_cancelled() {
                truncated = true;
                break;
            }
            iterations += 1;
            debug!(participant_id = pid, iteration = iterations, "Model round");

            let round_text = Mutex::new(String::new());
            let needs_separator = AtomicBool::new(
                self.multiplexer
                    .snapshot(pid)
                    .is_some_and(|text| !text.is_empty()),
            );
            let on_delta = |delta: &str| {
                if delta.is_empty() {
                    return;
                }
                if !spoke.swap(true, Ordering::AcqRel) {
                    self.status.set_status(pid, ParticipantStatus::Speaking);
                }
                if needs_separator.swap(false, Ordering::AcqRel) {
                    self.multiplexer.append_delta(pid, ROUND_SEPARATOR);
                }
                round_text.lock().push_str(delta);
                self.multiplexer.append_delta(pid, delta);
            };

            let request = CompletionRequest {
                model: binding.model.clone(),
                messages: context.messages.clone(),
                temperature: binding.temperature,
                max_tokens: binding.max_tokens,
                stop: Vec::new(),
            };

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(ProviderError::Cancelled),
                result = tokio::time::timeout(
                    self.model_timeout,
                    self.provider.stream(request, &on_delta, cancel),
                ) => result.unwrap_or(Err(ProviderError::Timeout {
                    timeout_secs: self.model_timeout.as_secs(),
                })),
            };

            let text = match outcome {
                Ok(text) => text,
                Err(ProviderError::Cancelled) => {
                    let partial = directive::parse(&round_text.lock());
                    if !partial.visible.is_empty() {
                        visible_parts.push(partial.visible);
                    }
                    truncated = true;
                    break;
                }
                Err(e) => return Err(self.fail(pid, turn_id, e)),
            };

            let parsed = directive::parse(&text);
            if !parsed.visible.is_empty() {
                visible_parts.push(parsed.visible.clone());
            }
            if !parsed.has_calls() {
                if !parsed.malformed.is_empty() {
                    debug!(
                        participant_id = pid,
                        count = parsed.malformed.len(),
                        "Ignoring malformed tool requests in final reply"
                    );
                }
                break;
            }
            // No model round is left to read the results
            if iterations >= self.max_iterations {
                warn!(
                    participant_id = pid,
                    max = self.max_iterations,
                    skipped_calls = parsed.calls.len(),
                    "Iteration limit reached, ending turn"
                );
                truncated = true;
                hit_limit = true;
                break;
            }

            context.push(Message::assistant(text));
            if cancel.is_cancelled() {
                truncated = true;
                break;
            }

            let invocation = InvocationContext::new(&self.session_id, pid, cancel.clone());
            let batch = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                batch = self.runner.invoke_all(parsed.calls, &invocation) => Some(batch),
            };
            let Some(batch) = batch else {
                // In-flight results are discarded
                truncated = true;
                break;
            };

            for record in &batch {
                context.push(Message::tool_result(&record.call_id, record.context_text()));
            }
            for bad in &parsed.malformed {
                context.push(Message::tool_result(
                    "malformed",
                    format!("[Tool request rejected]\n{}\n{}", bad.reason, bad.raw),
                ));
            }
            records.extend(batch);
        }

        let content = visible_parts.join(ROUND_SEPARATOR);
        self.multiplexer.complete(pid, &content, truncated);
        self.status.set_status(pid, ParticipantStatus::Idle);

        info!(
            participant_id = pid,
            turn_id,
            iterations,
            tool_calls = records.len(),
            truncated,
            "Turn finished"
        );

        let mut turn = Turn::new(turn_id, pid, content);
        turn.tool_calls = records;
        turn.truncated = truncated;
        turn.truncated_by_iteration_limit = hit_limit;
        turn.iterations = iterations;
        Ok(turn)
    }

    fn fail(&self, participant_id: &str, turn_id: &str, cause: ProviderError) -> Error {
        error!(
            session_id = %self.session_id,
            participant_id,
            error = %cause,
            "Model call failed"
        );

        let failure = Turn::failure(turn_id, participant_id, cause.to_string());
        self.multiplexer.complete(participant_id, &failure.content, false);
        self.status.set_status(participant_id, ParticipantStatus::Error);

        if let Some(bus) = &self.event_bus {
            bus.publish(DomainEvent::LoopFailed {
                session_id: self.session_id.clone(),
                participant_id: participant_id.to_string(),
                error_message: cause.to_string(),
                timestamp: Utc::now(),
            });
        }

        Error::Provider(cause)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream_event::StreamEvent;
    use crate::test_helpers::{RecordingTracker, ScriptedProvider, Step, echo_registry};
    use conclave_core::message::Role;
    use conclave_core::participant::ModelBinding;
    use conclave_tools::audit::AuditLog;

    fn alice() -> Participant {
        Participant::new("alice", "Alice").with_model(ModelBinding::new("test-model"))
    }

    fn runner() -> Arc<ToolInvocationRunner> {
        Arc::new(ToolInvocationRunner::new(
            Arc::new(echo_registry()),
            Arc::new(AuditLog::new()),
        ))
    }

    fn agent(provider: Arc<ScriptedProvider>, mux: StreamMultiplexer) -> AgentLoop {
        AgentLoop::new(provider, runner(), mux).with_session_id("s1")
    }

    fn echo_request(text: &str) -> String {
        directive::render("echo", &[("text", text)])
    }

    fn user_context(text: &str) -> Context {
        let mut ctx = Context::new();
        ctx.push(Message::user(text));
        ctx
    }

    #[tokio::test]
    async fn plain_reply_is_single_round() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::chunks(&["Hel", "lo"])]));
        let tracker = Arc::new(RecordingTracker::default());
        let agent = agent(provider.clone(), StreamMultiplexer::default())
            .with_status_tracker(tracker.clone());

        let turn = agent
            .run(&alice(), user_context("Hi"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(turn.content, "Hello");
        assert_eq!(turn.author_id, "alice");
        assert_eq!(turn.iterations, 1);
        assert!(!turn.truncated);
        assert!(turn.tool_calls.is_empty());
        assert_eq!(provider.call_count(), 1);
        assert_eq!(
            tracker.statuses("alice"),
            vec![
                ParticipantStatus::Thinking,
                ParticipantStatus::Speaking,
                ParticipantStatus::Idle
            ]
        );
    }

    #[tokio::test]
    async fn request_carries_model_binding() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::say("ok")]));
        let agent = agent(provider.clone(), StreamMultiplexer::default());
        let mut binding = ModelBinding::new("m-1");
        binding.temperature = 0.2;
        binding.max_tokens = Some(64);
        let p = Participant::new("alice", "Alice").with_model(binding);

        agent
            .run(&p, user_context("Hi"), &CancellationToken::new())
            .await
            .unwrap();

        let request = &provider.requests()[0];
        assert_eq!(request.model, "m-1");
        assert_eq!(request.max_tokens, Some(64));
        assert!((request.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(request.messages.len(), 1);
    }

    #[tokio::test]
    async fn tool_results_fold_back_into_context() {
        let first = format!("Let me check.\n{}", echo_request("pong"));
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::say(&first),
            Step::say("The answer is pong."),
        ]));
        let agent = agent(provider.clone(), StreamMultiplexer::default());

        let turn = agent
            .run(&alice(), user_context("ping?"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(turn.iterations, 2);
        assert_eq!(turn.tool_calls.len(), 1);
        assert!(turn.tool_calls[0].is_success());
        assert_eq!(turn.tool_calls[0].output.as_deref(), Some("pong"));
        assert_eq!(turn.content, "Let me check.\n\nThe answer is pong.");
        assert!(!turn.content.contains("TOOL_REQUEST"));

        let second = &provider.requests()[1];
        let roles: Vec<Role> = second.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool]);
        assert!(second.messages[2].content.contains("[Tool result: echo]"));
        assert!(second.messages[2].content.contains("pong"));
    }

    #[tokio::test]
    async fn failed_tool_does_not_end_turn() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::say(&directive::render("missing", &[])),
            Step::say("That tool is not available."),
        ]));
        let agent = agent(provider.clone(), StreamMultiplexer::default());

        let turn = agent
            .run(&alice(), user_context("go"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(turn.tool_calls.len(), 1);
        assert!(!turn.tool_calls[0].is_success());
        assert_eq!(turn.content, "That tool is not available.");
        let second = &provider.requests()[1];
        assert!(second.messages[2].content.contains("Unknown tool: missing"));
    }

    #[tokio::test]
    async fn batch_results_keep_request_order() {
        let reply = format!(
            "{}\n{}",
            directive::render("echo", &[("text", "slow"), ("ms", "30")]),
            directive::render("echo", &[("text", "fast"), ("ms", "1")]),
        );
        let provider = Arc::new(ScriptedProvider::new(vec![Step::say(&reply), Step::say("done")]));
        let agent = agent(provider.clone(), StreamMultiplexer::default());

        let turn = agent
            .run(&alice(), user_context("go"), &CancellationToken::new())
            .await
            .unwrap();

        let outputs: Vec<_> = turn
            .tool_calls
            .iter()
            .map(|r| r.output.clone().unwrap_or_default())
            .collect();
        assert_eq!(outputs, vec!["slow", "fast"]);
        let tool_messages: Vec<_> = provider.requests()[1]
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.content.clone())
            .collect();
        assert!(tool_messages[0].contains("slow"));
        assert!(tool_messages[1].contains("fast"));
    }

    #[tokio::test]
    async fn iteration_limit_truncates_turn() {
        let provider = Arc::new(ScriptedProvider::always(Step::say(&echo_request("again"))));
        let runner = runner();
        let agent = AgentLoop::new(provider.clone(), runner.clone(), StreamMultiplexer::default())
            .with_session_id("s1")
            .with_max_iterations(3);

        let turn = agent
            .run(&alice(), user_context("loop"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(provider.call_count(), 3);
        assert_eq!(turn.iterations, 3);
        // The last round's request is not executed since no round remains to read it
        assert_eq!(turn.tool_calls.len(), 2);
        assert_eq!(runner.audit().count(), 2);
        assert!(turn.truncated);
        assert!(turn.truncated_by_iteration_limit);
    }

    #[tokio::test]
    async fn malformed_request_alone_ends_turn() {
        let reply = format!("Trying.\n{START}\nnot a pair\n{END}", START = directive::START_MARKER, END = directive::END_MARKER);
        let provider = Arc::new(ScriptedProvider::always(Step::say(&reply)));
        let agent = agent(provider.clone(), StreamMultiplexer::default());

        let turn = agent
            .run(&alice(), user_context("go"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(provider.call_count(), 1);
        assert_eq!(turn.content, "Trying.");
        assert!(!turn.truncated);
    }

    #[tokio::test]
    async fn transport_failure_is_reported() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Fail(
            ProviderError::Network("connection reset".into()),
        )]));
        let mux = StreamMultiplexer::default();
        let (_sub, mut rx) = mux.subscribe_channel();
        let bus = Arc::new(EventBus::default());
        let mut events = bus.subscribe();
        let tracker = Arc::new(RecordingTracker::default());
        let agent = agent(provider, mux)
            .with_event_bus(bus.clone())
            .with_status_tracker(tracker.clone());

        let err = agent
            .run(&alice(), user_context("Hi"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Provider(ProviderError::Network(_))));
        assert_eq!(tracker.statuses("alice").last(), Some(&ParticipantStatus::Error));

        let mut completed = None;
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::Complete { text, truncated, .. } = event {
                completed = Some((text, truncated));
            }
        }
        let (text, truncated) = completed.expect("complete event");
        assert!(text.contains("connection reset"));
        assert!(!truncated);

        let event = events.recv().await.unwrap();
        assert!(matches!(event.as_ref(), DomainEvent::LoopFailed { participant_id, .. } if participant_id == "alice"));
    }

    #[tokio::test]
    async fn cancellation_mid_stream_keeps_partial_text() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Stall(vec![
            "partial ".into(),
            "answer".into(),
        ])]));
        let mux = StreamMultiplexer::default();
        let (_sub, mut rx) = mux.subscribe_channel();
        let tracker = Arc::new(RecordingTracker::default());
        let agent = agent(provider.clone(), mux).with_status_tracker(tracker.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let turn = agent.run(&alice(), user_context("Hi"), &cancel).await.unwrap();

        assert!(turn.truncated);
        assert!(!turn.truncated_by_iteration_limit);
        assert_eq!(turn.content, "partial answer");
        assert_eq!(provider.call_count(), 1);
        assert_eq!(tracker.statuses("alice").last(), Some(&ParticipantStatus::Idle));

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        match seen.last() {
            Some(StreamEvent::Complete { text, truncated, .. }) => {
                assert_eq!(text, "partial answer");
                assert!(*truncated);
            }
            other => panic!("expected complete last, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_before_start_skips_model() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::say("never")]));
        let agent = agent(provider.clone(), StreamMultiplexer::default());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let turn = agent.run(&alice(), user_context("Hi"), &cancel).await.unwrap();

        assert_eq!(provider.call_count(), 0);
        assert!(turn.truncated);
        assert!(turn.content.is_empty());
    }

    #[tokio::test]
    async fn cancellation_during_tools_discards_results() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::say(&directive::render("echo", &[("text", "late"), ("ms", "5000")])),
            Step::say("unreachable"),
        ]));
        let runner = runner();
        let agent = AgentLoop::new(provider.clone(), runner.clone(), StreamMultiplexer::default())
            .with_session_id("s1");
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let turn = agent.run(&alice(), user_context("go"), &cancel).await.unwrap();

        assert!(turn.truncated);
        assert!(turn.tool_calls.is_empty());
        assert_eq!(provider.call_count(), 1);

        // The discarded call still settles and reaches the audit log
        for _ in 0..100 {
            if runner.audit().count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let failures = runner.audit().failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].tool_name, "echo");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_model_round_times_out() {
        let provider = Arc::new(ScriptedProvider::new(vec![Step::Stall(vec![])]));
        let agent = agent(provider, StreamMultiplexer::default())
            .with_model_timeout(Duration::from_secs(5));

        let err = agent
            .run(&alice(), user_context("Hi"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::Provider(ProviderError::Timeout { timeout_secs: 5 })
        ));
    }

    #[tokio::test]
    async fn unbound_participant_is_rejected() {
        let provider = Arc::new(ScriptedProvider::new(vec![]));
        let agent = agent(provider.clone(), StreamMultiplexer::default());
        let observer = Participant::new("obs", "Observer");

        let err = agent
            .run(&observer, Context::new(), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Config { .. }));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn streamed_rounds_are_separated_on_the_display() {
        let provider = Arc::new(ScriptedProvider::new(vec![
            Step::say(&format!("One.{}", echo_request("x"))),
            Step::say("Two."),
        ]));
        let mux = StreamMultiplexer::new(Duration::ZERO);
        let (_sub, mut rx) = mux.subscribe_channel();
        let agent = agent(provider, mux);

        agent
            .run(&alice(), user_context("go"), &CancellationToken::new())
            .await
            .unwrap();

        let mut last_render = String::new();
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::Render { text, .. } = event {
                last_render = text;
            }
        }
        assert!(last_render.ends_with("\n\nTwo."));
    }
}
