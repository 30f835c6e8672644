//! StreamMultiplexer — per-session fan-in of participants' streaming output.
//!
//! Each generating participant owns exactly one [`StreamingHandle`] here.
//! Deltas accumulate into it and subscribers see throttled `render`
//! snapshots, bracketed by a `thinking` event and a `complete` event that
//! carries the authoritative final text.
//!
//! Every notification goes through one delivery gate, so a trailing flush
//! can never overtake a completion and nothing is delivered after
//! [`StreamMultiplexer::teardown`]. The gate is reentrant: observers may
//! call back into the multiplexer from inside a callback.

use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::throttle::{Throttle, ThrottleDecision};
use crate::stream_event::{StreamEvent, StreamPhase};

/// Default minimum gap between two render notifications for one participant.
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(150);

/// Receives stream notifications.
pub trait StreamObserver: Send + Sync {
    fn on_event(&self, event: &StreamEvent);
}

impl<F> StreamObserver for F
where
    F: Fn(&StreamEvent) + Send + Sync,
{
    fn on_event(&self, event: &StreamEvent) {
        self(event)
    }
}

/// In-flight output of one participant.
struct StreamingHandle {
    turn_id: String,
    text: String,
    phase: StreamPhase,
    throttle: Throttle,
    /// Distinguishes this handle from one it replaced
    epoch: u64,
}

impl StreamingHandle {
    fn render(&self, participant_id: &str) -> StreamEvent {
        StreamEvent::Render {
            participant_id: participant_id.to_string(),
            turn_id: self.turn_id.clone(),
            text: self.text.clone(),
        }
    }
}

#[derive(Default)]
struct State {
    handles: HashMap<String, StreamingHandle>,
    next_epoch: u64,
}

struct Inner {
    interval: Duration,
    state: Mutex<State>,
    observers: Mutex<Vec<(u64, Arc<dyn StreamObserver>)>>,
    next_observer: AtomicU64,
    delivery: ReentrantMutex<()>,
    torn_down: AtomicBool,
    /// Parent of every armed trailing-flush timer
    timers: CancellationToken,
}

impl Inner {
    fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Must be called with the delivery gate held.
    fn deliver(&self, events: &[StreamEvent]) {
        for event in events {
            let observers: Vec<Arc<dyn StreamObserver>> = self
                .observers
                .lock()
                .iter()
                .map(|(_, observer)| Arc::clone(observer))
                .collect();

            for observer in observers {
                if self.is_torn_down() {
                    return;
                }
                observer.on_event(event);
            }
        }
    }

    fn fire_trailing(&self, participant_id: &str, epoch: u64) {
        let _gate = self.delivery.lock();
        if self.is_torn_down() {
            return;
        }

        let event = {
            let mut state = self.state.lock();
            state.handles.get_mut(participant_id).and_then(|handle| {
                (handle.epoch == epoch && handle.throttle.on_trailing_fire(Instant::now()))
                    .then(|| handle.render(participant_id))
            })
        };

        if let Some(event) = event {
            self.deliver(&[event]);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.timers.cancel();
    }
}

/// Handle returned by [`StreamMultiplexer::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    inner: Weak<Inner>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop receiving notifications. Safe to call from inside a callback.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.observers.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

/// One per session. Cloning yields another handle to the same multiplexer.
#[derive(Clone)]
pub struct StreamMultiplexer {
    inner: Arc<Inner>,
}

impl Default for StreamMultiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE)
    }
}

impl StreamMultiplexer {
    pub fn new(throttle: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                interval: throttle,
                state: Mutex::new(State::default()),
                observers: Mutex::new(Vec::new()),
                next_observer: AtomicU64::new(1),
                delivery: ReentrantMutex::new(()),
                torn_down: AtomicBool::new(false),
                timers: CancellationToken::new(),
            }),
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn StreamObserver>) -> Subscription {
        let id = self.inner.next_observer.fetch_add(1, Ordering::Relaxed);
        if !self.inner.is_torn_down() {
            self.inner.observers.lock().push((id, observer));
        }
        Subscription {
            id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe with an unbounded channel instead of a callback.
    pub fn subscribe_channel(&self) -> (Subscription, mpsc::UnboundedReceiver<StreamEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(Arc::new(move |event: &StreamEvent| {
            let _ = tx.send(event.clone());
        }));
        (subscription, rx)
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.lock().len()
    }

    /// Start (or restart) a participant's stream in the thinking phase.
    ///
    /// An existing handle for the participant is replaced, not merged.
    pub fn begin_thinking(&self, participant_id: &str, turn_id: &str) {
        let _gate = self.inner.delivery.lock();
        if self.inner.is_torn_down() {
            return;
        }

        {
            let mut state = self.inner.state.lock();
            let epoch = state.next_epoch;
            state.next_epoch += 1;
            let replaced = state.handles.insert(
                participant_id.to_string(),
                StreamingHandle {
                    turn_id: turn_id.to_string(),
                    text: String::new(),
                    phase: StreamPhase::Thinking,
                    throttle: Throttle::new(self.inner.interval),
                    epoch,
                },
            );
            if let Some(old) = replaced {
                debug!(participant_id, old_turn = %old.turn_id, "Replacing unfinished stream");
            }
        }

        self.inner.deliver(&[StreamEvent::Thinking {
            participant_id: participant_id.to_string(),
            turn_id: turn_id.to_string(),
        }]);
    }

    /// Append a delta. Ignored when the participant has no open stream.
    pub fn append_delta(&self, participant_id: &str, delta: &str) {
        if delta.is_empty() {
            return;
        }

        let _gate = self.inner.delivery.lock();
        if self.inner.is_torn_down() {
            return;
        }

        let event = {
            let mut state = self.inner.state.lock();
            let Some(handle) = state.handles.get_mut(participant_id) else {
                trace!(participant_id, "Dropping delta for closed stream");
                return;
            };
            handle.text.push_str(delta);
            handle.phase = StreamPhase::Streaming;

            match handle.throttle.on_event(Instant::now()) {
                ThrottleDecision::FireNow => Some(handle.render(participant_id)),
                ThrottleDecision::ScheduleTrailing(wait) => {
                    if self.arm_trailing(participant_id, handle.epoch, wait) {
                        None
                    } else {
                        handle.throttle.take_pending();
                        Some(handle.render(participant_id))
                    }
                }
                ThrottleDecision::Coalesce => None,
            }
        };

        if let Some(event) = event {
            self.inner.deliver(&[event]);
        }
    }

    fn arm_trailing(&self, participant_id: &str, epoch: u64, wait: Duration) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return false;
        };

        let inner = Arc::downgrade(&self.inner);
        let timers = self.inner.timers.clone();
        let participant_id = participant_id.to_string();
        runtime.spawn(async move {
            tokio::select! {
                _ = timers.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    if let Some(inner) = inner.upgrade() {
                        inner.fire_trailing(&participant_id, epoch);
                    }
                }
            }
        });
        true
    }

    /// Close a participant's stream with its final text.
    ///
    /// A pending throttled render is flushed first. Returns false when the
    /// participant had no open stream.
    pub fn complete(&self, participant_id: &str, final_text: &str, truncated: bool) -> bool {
        let _gate = self.inner.delivery.lock();
        if self.inner.is_torn_down() {
            return false;
        }

        let events = {
            let mut state = self.inner.state.lock();
            let Some(mut handle) = state.handles.remove(participant_id) else {
                return false;
            };

            let mut events = Vec::with_capacity(2);
            if handle.throttle.take_pending() {
                events.push(handle.render(participant_id));
            }
            handle.phase = StreamPhase::Complete;
            events.push(StreamEvent::Complete {
                participant_id: participant_id.to_string(),
                turn_id: handle.turn_id,
                text: final_text.to_string(),
                truncated,
            });
            events
        };

        self.inner.deliver(&events);
        true
    }

    /// Cancel pending flushes, drop every handle and subscriber.
    /// Idempotent; nothing is delivered afterwards.
    pub fn teardown(&self) {
        let _gate = self.inner.delivery.lock();
        if self.inner.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.timers.cancel();
        self.inner.state.lock().handles.clear();
        self.inner.observers.lock().clear();
        debug!("Stream multiplexer torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.inner.is_torn_down()
    }

    pub fn phase(&self, participant_id: &str) -> Option<StreamPhase> {
        self.inner
            .state
            .lock()
            .handles
            .get(participant_id)
            .map(|h| h.phase)
    }

    /// Text accumulated so far for a participant's open stream.
    pub fn snapshot(&self, participant_id: &str) -> Option<String> {
        self.inner
            .state
            .lock()
            .handles
            .get(participant_id)
            .map(|h| h.text.clone())
    }

    /// Participants with an open stream, sorted.
    pub fn active_participants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.state.lock().handles.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }
}
