//! One live conversation: its roster, history, scheduler and stream.
//!
//! History only grows, and only through [`Session::append_turn`], which is
//! reached from two places: a posted user message and a finished run.
//! Every run owns a child of the session's cancellation token, so
//! interrupting or ending the session reaches every participant at once.

use chrono::Utc;
use conclave_agent::{AgentLoop, StreamEvent, StreamMultiplexer, StreamObserver, Subscription};
use conclave_config::{AppConfig, FlowLockConfig, SessionConfig};
use conclave_core::error::{Error, ProviderError, Result, SessionError};
use conclave_core::event::{DomainEvent, EventBus};
use conclave_core::participant::Participant;
use conclave_core::persistence::{PersistedRecord, PersistenceQueue};
use conclave_core::provider::Provider;
use conclave_core::session::{SessionId, SpeakingMode};
use conclave_core::turn::Turn;
use conclave_scheduler::{FlowLockTimer, RelevanceScorer, TurnScheduler};
use conclave_tools::runner::ToolInvocationRunner;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::ContextBuilder;
use crate::roster::Roster;

/// How long teardown waits for cancelled runs to deliver their final event.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// How to set up a new session.
#[derive(Clone)]
pub struct SessionOptions {
    pub name: Option<String>,
    pub participants: Vec<Participant>,
    pub speaking_mode: SpeakingMode,
    pub flow_lock: FlowLockConfig,
    /// Seed for random speaker selection
    pub seed: Option<u64>,
    /// Overrides the default tag-overlap scoring in weighted-random mode
    pub scorer: Option<Arc<dyn RelevanceScorer>>,
}

impl SessionOptions {
    pub fn new(participants: Vec<Participant>) -> Self {
        Self {
            name: None,
            participants,
            speaking_mode: SpeakingMode::default(),
            flow_lock: FlowLockConfig::default(),
            seed: None,
            scorer: None,
        }
    }

    /// Options for a session defined in the config file.
    pub fn from_config(config: &AppConfig, session: &SessionConfig) -> Self {
        Self {
            name: Some(session.name.clone()),
            participants: config.participants_for(session),
            speaking_mode: session.speaking_mode,
            flow_lock: session.flow_lock.clone(),
            seed: None,
            scorer: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_speaking_mode(mut self, mode: SpeakingMode) -> Self {
        self.speaking_mode = mode;
        self
    }

    pub fn with_flow_lock(mut self, flow_lock: FlowLockConfig) -> Self {
        self.flow_lock = flow_lock;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }
}

/// Collaborators shared by every session of a registry.
#[derive(Clone)]
pub(crate) struct Services {
    pub runner: Arc<ToolInvocationRunner>,
    pub persistence: PersistenceQueue,
    pub events: Arc<EventBus>,
    pub max_iterations: u32,
    pub model_timeout: Duration,
    pub stream_throttle: Duration,
}

/// Runs started for one message or invitation.
#[derive(Debug)]
pub struct Dispatch {
    /// The user turn that was appended, if any
    pub user_turn_id: Option<String>,
    /// Participants whose run started, in speaking order
    pub speakers: Vec<String>,
    /// Selected participants that could not start (busy or unbound)
    pub skipped: Vec<String>,
    handles: Vec<JoinHandle<Result<Turn>>>,
}

impl Dispatch {
    /// Whether nobody was asked to speak.
    pub fn is_empty(&self) -> bool {
        self.speakers.is_empty()
    }

    /// Wait for every started run, in speaking order.
    pub async fn join(self) -> Vec<Result<Turn>> {
        let mut results = Vec::with_capacity(self.handles.len());
        for handle in self.handles {
            results.push(
                handle
                    .await
                    .unwrap_or_else(|e| Err(Error::Internal(format!("run task failed: {e}")))),
            );
        }
        results
    }
}

pub struct Session {
    id: SessionId,
    name: Option<String>,
    roster: Arc<Roster>,
    /// Model transport per participant with a model bound
    providers: HashMap<String, Arc<dyn Provider>>,
    history: RwLock<Vec<Turn>>,
    scheduler: Mutex<TurnScheduler>,
    multiplexer: StreamMultiplexer,
    services: Services,
    trigger_prompt: String,
    root: CancellationToken,
    /// Parent of the runs started since the last interrupt
    generation: Mutex<CancellationToken>,
    /// Participants with a run in flight
    active: Mutex<HashSet<String>>,
    settled: Notify,
    ended: AtomicBool,
}

impl Session {
    /// Build a session and start its flow-lock timer.
    pub(crate) fn start(
        id: SessionId,
        options: SessionOptions,
        providers: HashMap<String, Arc<dyn Provider>>,
        services: Services,
    ) -> Result<Arc<Self>> {
        let roster = Arc::new(Roster::new(
            id.as_str(),
            options.participants,
            Arc::clone(&services.events),
        )?);
        let root = CancellationToken::new();
        let generation = root.child_token();
        let flow = options.flow_lock;

        Ok(Arc::new_cyclic(|weak: &Weak<Session>| {
            let weak = weak.clone();
            let timer = FlowLockTimer::start(flow.enabled, flow.cooldown(), &root, move || {
                if let Some(session) = weak.upgrade() {
                    session.on_flow_lock();
                }
            });

            let mut scheduler = TurnScheduler::new(options.speaking_mode).with_flow_lock(timer);
            if let Some(seed) = options.seed {
                scheduler = scheduler.with_seed(seed);
            }
            if let Some(scorer) = options.scorer {
                scheduler = scheduler.with_scorer(scorer);
            }

            Session {
                id,
                name: options.name,
                roster,
                providers,
                history: RwLock::new(Vec::new()),
                scheduler: Mutex::new(scheduler),
                multiplexer: StreamMultiplexer::new(services.stream_throttle),
                services,
                trigger_prompt: flow.trigger_prompt,
                root,
                generation: Mutex::new(generation),
                active: Mutex::new(HashSet::new()),
                settled: Notify::new(),
                ended: AtomicBool::new(false),
            }
        }))
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub fn multiplexer(&self) -> &StreamMultiplexer {
        &self.multiplexer
    }

    /// Participants with their current status, in roster order.
    pub fn participants(&self) -> Vec<Participant> {
        self.roster.snapshot()
    }

    /// Every turn so far, oldest first.
    pub fn history(&self) -> Vec<Turn> {
        self.history.read().clone()
    }

    pub fn turn_count(&self) -> usize {
        self.history.read().len()
    }

    pub fn speaking_mode(&self) -> SpeakingMode {
        self.scheduler.lock().mode()
    }

    pub fn flow_lock_enabled(&self) -> bool {
        self.scheduler
            .lock()
            .flow_lock()
            .is_some_and(|timer| timer.is_enabled())
    }

    /// Participants currently generating, sorted.
    pub fn active_participants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.active.lock().iter().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn subscribe(&self, observer: Arc<dyn StreamObserver>) -> Result<Subscription> {
        self.ensure_live()?;
        Ok(self.multiplexer.subscribe(observer))
    }

    pub fn subscribe_channel(
        &self,
    ) -> Result<(Subscription, mpsc::UnboundedReceiver<StreamEvent>)> {
        self.ensure_live()?;
        Ok(self.multiplexer.subscribe_channel())
    }

    /// Append the user's message and start a run for every selected speaker.
    ///
    /// An empty selection is not an error; the message simply stays in
    /// history.
    pub fn post_user_message(self: &Arc<Self>, text: &str) -> Result<Dispatch> {
        self.ensure_live()?;

        let turn = Turn::user(text);
        let user_turn_id = turn.id.clone();
        self.append_turn(turn);

        let roster = self.roster.snapshot();
        let selected = self.scheduler.lock().select_next(text, &roster);

        let mut dispatch = Dispatch {
            user_turn_id: Some(user_turn_id),
            speakers: Vec::new(),
            skipped: Vec::new(),
            handles: Vec::new(),
        };
        for participant_id in selected {
            match self.start_run(&participant_id, None) {
                Ok(handle) => {
                    dispatch.speakers.push(participant_id);
                    dispatch.handles.push(handle);
                }
                Err(e) => {
                    debug!(participant_id = %participant_id, reason = %e, "Skipping selected speaker");
                    dispatch.skipped.push(participant_id);
                }
            }
        }

        info!(
            session_id = %self.id,
            speakers = ?dispatch.speakers,
            skipped = dispatch.skipped.len(),
            "User message dispatched"
        );
        Ok(dispatch)
    }

    /// Ask one participant to speak now, whatever the speaking mode.
    pub fn invite(self: &Arc<Self>, participant_id: &str) -> Result<Dispatch> {
        self.ensure_live()?;
        self.scheduler.lock().validate_invitation(
            self.id.as_str(),
            participant_id,
            &self.roster.snapshot(),
        )?;

        let handle = self.start_run(participant_id, None)?;
        info!(session_id = %self.id, participant_id, "Participant invited");
        Ok(Dispatch {
            user_turn_id: None,
            speakers: vec![participant_id.to_string()],
            skipped: Vec::new(),
            handles: vec![handle],
        })
    }

    /// Cancel every run in flight. The session stays usable.
    ///
    /// Returns how many runs were cancelled.
    pub fn interrupt(&self) -> usize {
        let count = self.active.lock().len();
        {
            let mut generation = self.generation.lock();
            generation.cancel();
            *generation = self.root.child_token();
        }
        info!(session_id = %self.id, runs = count, "Session interrupted");
        count
    }

    pub fn set_speaking_mode(&self, mode: SpeakingMode) -> Result<()> {
        self.ensure_live()?;
        self.scheduler.lock().set_mode(mode);
        Ok(())
    }

    pub fn set_flow_lock(&self, enabled: bool) -> Result<()> {
        self.ensure_live()?;
        if let Some(timer) = self.scheduler.lock().flow_lock() {
            timer.set_enabled(enabled);
        }
        Ok(())
    }

    pub fn set_flow_lock_cooldown(&self, cooldown: Duration) -> Result<()> {
        self.ensure_live()?;
        if let Some(timer) = self.scheduler.lock().flow_lock() {
            timer.set_cooldown(cooldown);
        }
        Ok(())
    }

    /// The single way history grows. Ignored once the session has ended.
    pub(crate) fn append_turn(&self, turn: Turn) {
        if self.is_ended() {
            debug!(session_id = %self.id, turn_id = %turn.id, "Dropping turn for ended session");
            return;
        }

        self.history.write().push(turn.clone());
        self.services.events.publish(DomainEvent::TurnAppended {
            session_id: self.id.to_string(),
            turn_id: turn.id.clone(),
            author_id: turn.author_id.clone(),
            truncated: turn.truncated,
            timestamp: Utc::now(),
        });
        self.services.persistence.persist(PersistedRecord::Turn {
            session_id: self.id.to_string(),
            turn,
        });
        self.scheduler.lock().note_activity();
    }

    /// End the session: stop the timer, cancel every run, wait briefly for
    /// their final events, then tear the stream down.
    pub(crate) async fn shutdown(&self) {
        if self.ended.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(timer) = self.scheduler.lock().flow_lock() {
            timer.stop();
        }
        self.root.cancel();

        if tokio::time::timeout(SHUTDOWN_GRACE, self.wait_idle()).await.is_err() {
            warn!(
                session_id = %self.id,
                active = ?self.active_participants(),
                "Runs still active at teardown"
            );
        }
        self.multiplexer.teardown();

        self.services.events.publish(DomainEvent::SessionDestroyed {
            session_id: self.id.to_string(),
            timestamp: Utc::now(),
        });
        info!(session_id = %self.id, "Session ended");
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_ended() {
            return Err(SessionError::Ended(self.id.to_string()).into());
        }
        Ok(())
    }

    async fn wait_idle(&self) {
        loop {
            let settled = self.settled.notified();
            if self.active.lock().is_empty() {
                return;
            }
            settled.await;
        }
    }

    fn start_run(
        self: &Arc<Self>,
        participant_id: &str,
        prompt: Option<String>,
    ) -> Result<JoinHandle<Result<Turn>>> {
        let participant = self.roster.get(participant_id).ok_or_else(|| {
            SessionError::UnknownParticipant {
                session_id: self.id.to_string(),
                participant_id: participant_id.to_string(),
            }
        })?;
        let provider = self.providers.get(participant_id).cloned().ok_or_else(|| {
            Error::Config {
                message: format!("participant '{participant_id}' has no model bound"),
            }
        })?;
        if !self.active.lock().insert(participant_id.to_string()) {
            return Err(SessionError::ParticipantBusy(participant_id.to_string()).into());
        }

        let cancel = self.generation.lock().child_token();
        let session = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let outcome = session.run(&participant, provider, prompt, cancel).await;
            session.release(&participant.id);
            outcome
        }))
    }

    async fn run(
        &self,
        participant: &Participant,
        provider: Arc<dyn Provider>,
        prompt: Option<String>,
        cancel: CancellationToken,
    ) -> Result<Turn> {
        let history = self.history();
        let roster = self.roster.snapshot();
        let tools = self.services.runner.definitions();
        let context = ContextBuilder::new(participant, &roster)
            .history(&history)
            .tools(&tools)
            .prompt(prompt.as_deref())
            .build();

        let agent = AgentLoop::new(
            provider,
            Arc::clone(&self.services.runner),
            self.multiplexer.clone(),
        )
        .with_session_id(self.id.as_str())
        .with_status_tracker(self.roster.clone())
        .with_event_bus(Arc::clone(&self.services.events))
        .with_max_iterations(self.services.max_iterations)
        .with_model_timeout(self.services.model_timeout);

        let turn_id = Uuid::new_v4().to_string();
        match agent.run_turn(&turn_id, participant, context, &cancel).await {
            Ok(turn) => {
                self.append_turn(turn.clone());
                Ok(turn)
            }
            Err(Error::Provider(cause)) => {
                self.append_turn(Turn::failure(&turn_id, &participant.id, cause.to_string()));
                Err(Error::Provider(cause))
            }
            Err(e) => Err(e),
        }
    }

    fn release(&self, participant_id: &str) {
        self.active.lock().remove(participant_id);
        self.settled.notify_waiters();
    }

    /// Timer callback: let someone break the silence if nobody is talking.
    fn on_flow_lock(self: &Arc<Self>) {
        if self.is_ended() {
            return;
        }
        if !self.active.lock().is_empty() {
            debug!(session_id = %self.id, "Flow-lock fired while busy, skipping");
            return;
        }

        let roster = self.roster.snapshot();
        let Some(participant_id) = self.scheduler.lock().select_flow_lock_speaker(&roster) else {
            debug!(session_id = %self.id, "Flow-lock found nobody to invite");
            return;
        };

        info!(session_id = %self.id, participant_id = %participant_id, "Flow-lock triggered");
        self.services.events.publish(DomainEvent::FlowLockTriggered {
            session_id: self.id.to_string(),
            participant_id: participant_id.clone(),
            timestamp: Utc::now(),
        });

        if let Err(e) = self.start_run(&participant_id, Some(self.trigger_prompt.clone())) {
            warn!(participant_id = %participant_id, error = %e, "Flow-lock run did not start");
        }
    }
}

/// Resolve a transport for every participant that has a model bound.
pub(crate) fn resolve_providers(
    participants: &[Participant],
    resolve: impl Fn(&conclave_core::participant::ModelBinding) -> Option<Arc<dyn Provider>>,
    default_provider: &str,
) -> Result<HashMap<String, Arc<dyn Provider>>> {
    let mut providers = HashMap::new();
    for participant in participants {
        let Some(binding) = &participant.model else {
            continue;
        };
        let provider = resolve(binding).ok_or_else(|| {
            ProviderError::NotConfigured(
                binding
                    .provider
                    .clone()
                    .unwrap_or_else(|| default_provider.to_string()),
            )
        })?;
        providers.insert(participant.id.clone(), provider);
    }
    Ok(providers)
}
