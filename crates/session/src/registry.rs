//! SessionRegistry — owns every live session of the process.
//!
//! Callers hold a registry handle and address sessions by id. Creating a
//! session binds its multiplexer and scheduler; destroying it cancels every
//! run, stops the flow-lock timer and tears the stream down.

use chrono::Utc;
use conclave_agent::{StreamEvent, StreamObserver, Subscription};
use conclave_config::{AppConfig, OrchestrationConfig};
use conclave_core::error::{Result, SessionError};
use conclave_core::event::{DomainEvent, EventBus};
use conclave_core::participant::Participant;
use conclave_core::persistence::{PersistenceQueue, PersistenceSink};
use conclave_core::session::{SessionId, SpeakingMode};
use conclave_core::turn::Turn;
use conclave_providers::router::{ProviderRouter, build_from_config};
use conclave_tools::audit::{AuditLog, TracingAuditSink};
use conclave_tools::plugin::registry_from_plugins;
use conclave_tools::runner::ToolInvocationRunner;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use crate::session::{Dispatch, Services, Session, SessionOptions, resolve_providers};

/// A one-line view of a live session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub name: Option<String>,
    pub speaking_mode: SpeakingMode,
    pub participants: usize,
    pub turns: usize,
    pub flow_lock: bool,
    pub active: Vec<String>,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    router: Arc<ProviderRouter>,
    services: Services,
}

impl SessionRegistry {
    pub fn new(router: Arc<ProviderRouter>, runner: Arc<ToolInvocationRunner>) -> Self {
        let defaults = OrchestrationConfig::default();
        Self {
            sessions: RwLock::new(HashMap::new()),
            router,
            services: Services {
                runner,
                persistence: PersistenceQueue::disabled(),
                events: Arc::new(EventBus::default()),
                max_iterations: defaults.max_iterations,
                model_timeout: defaults.model_timeout(),
                stream_throttle: defaults.stream_throttle(),
            },
        }
    }

    /// Wire providers, plugins, audit and persistence from configuration.
    pub fn from_config(config: &AppConfig, persistence: Arc<dyn PersistenceSink>) -> Self {
        let events = Arc::new(EventBus::default());
        let persistence = PersistenceQueue::start(persistence);
        let audit = AuditLog::new()
            .with_sink(Box::new(TracingAuditSink))
            .with_persistence(persistence.clone())
            .with_event_bus(Arc::clone(&events));
        let tools = registry_from_plugins(&config.plugins);
        let runner = ToolInvocationRunner::new(Arc::new(tools), Arc::new(audit));

        Self::new(Arc::new(build_from_config(config)), Arc::new(runner))
            .with_event_bus(events)
            .with_persistence(persistence)
            .with_orchestration(&config.orchestration)
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.services.events = events;
        self
    }

    /// Route appended turns through `queue`. Share the queue with the
    /// runner's [`AuditLog`] to keep turns and tool outcomes in one order.
    pub fn with_persistence(mut self, queue: PersistenceQueue) -> Self {
        self.services.persistence = queue;
        self
    }

    pub fn with_orchestration(mut self, config: &OrchestrationConfig) -> Self {
        self.services.max_iterations = config.max_iterations;
        self.services.model_timeout = config.model_timeout();
        self.services.stream_throttle = config.stream_throttle();
        self
    }

    /// Domain events from every session.
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.services.events)
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        self.services.runner.audit()
    }

    /// Create a session and start its flow-lock timer.
    ///
    /// Fails on duplicate participant ids or when a participant's model
    /// binding names a provider the router does not know. Must be called
    /// from within a tokio runtime.
    pub fn create_session(&self, options: SessionOptions) -> Result<SessionId> {
        let providers = resolve_providers(
            &options.participants,
            |binding| self.router.for_binding(binding),
            self.router.default_name(),
        )?;

        let id = SessionId::new();
        let participants = options.participants.len();
        let name = options.name.clone();
        let session = Session::start(id.clone(), options, providers, self.services.clone())?;
        self.sessions.write().insert(id.clone(), session);

        self.services.events.publish(DomainEvent::SessionCreated {
            session_id: id.to_string(),
            participants,
            timestamp: Utc::now(),
        });
        info!(session_id = %id, name = ?name, participants, "Session created");
        Ok(id)
    }

    /// End a session. Its id is unknown afterwards. Returns once the
    /// session's queued records have reached the persistence sink.
    pub async fn destroy_session(&self, id: &SessionId) -> Result<()> {
        let session = self
            .sessions
            .write()
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        session.shutdown().await;
        self.services.persistence.flush().await;
        Ok(())
    }

    /// End every session.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.shutdown().await;
        }
        self.services.persistence.flush().await;
    }

    pub fn get(&self, id: &SessionId) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.to_string()).into())
    }

    pub fn subscribe(&self, id: &SessionId, observer: Arc<dyn StreamObserver>) -> Result<Subscription> {
        self.get(id)?.subscribe(observer)
    }

    pub fn subscribe_channel(
        &self,
        id: &SessionId,
    ) -> Result<(Subscription, mpsc::UnboundedReceiver<StreamEvent>)> {
        self.get(id)?.subscribe_channel()
    }

    pub fn post_user_message(&self, id: &SessionId, text: &str) -> Result<Dispatch> {
        self.get(id)?.post_user_message(text)
    }

    pub fn invite(&self, id: &SessionId, participant_id: &str) -> Result<Dispatch> {
        self.get(id)?.invite(participant_id)
    }

    /// Cancel the session's in-flight runs without ending it.
    pub fn interrupt(&self, id: &SessionId) -> Result<usize> {
        Ok(self.get(id)?.interrupt())
    }

    pub fn set_speaking_mode(&self, id: &SessionId, mode: SpeakingMode) -> Result<()> {
        self.get(id)?.set_speaking_mode(mode)
    }

    pub fn set_flow_lock(&self, id: &SessionId, enabled: bool) -> Result<()> {
        self.get(id)?.set_flow_lock(enabled)
    }

    pub fn history(&self, id: &SessionId) -> Result<Vec<Turn>> {
        Ok(self.get(id)?.history())
    }

    pub fn participants(&self, id: &SessionId) -> Result<Vec<Participant>> {
        Ok(self.get(id)?.participants())
    }

    /// Live sessions, ordered by name then id.
    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .read()
            .values()
            .map(|s| SessionSummary {
                id: s.id().clone(),
                name: s.name().map(str::to_string),
                speaking_mode: s.speaking_mode(),
                participants: s.participants().len(),
                turns: s.turn_count(),
                flow_lock: s.flow_lock_enabled(),
                active: s.active_participants(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.0.cmp(&b.id.0)));
        summaries
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}
