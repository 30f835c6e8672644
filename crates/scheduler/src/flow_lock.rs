//! FlowLockTimer — breaks a silence after a cooldown of inactivity.
//!
//! The timer runs as a background task. Every completed turn resets it; if
//! nothing happens for `cooldown` while it is enabled, the `on_fire`
//! callback runs once and the clock starts over. Stopping the timer (or
//! cancelling the parent token) ends the task for good.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

type FireCallback = Arc<dyn Fn() + Send + Sync>;

struct TimerState {
    enabled: bool,
    cooldown: Duration,
    last_activity: Instant,
    last_trigger_at: Option<Instant>,
}

struct Shared {
    state: Mutex<TimerState>,
    /// Wakes the task when the deadline may have moved
    changed: Notify,
}

pub struct FlowLockTimer {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl FlowLockTimer {
    /// Spawn the timer task. It lives until [`stop`](Self::stop) is called,
    /// `parent` is cancelled, or the timer is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(
        enabled: bool,
        cooldown: Duration,
        parent: &CancellationToken,
        on_fire: F,
    ) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                enabled,
                cooldown,
                last_activity: Instant::now(),
                last_trigger_at: None,
            }),
            changed: Notify::new(),
        });
        let cancel = parent.child_token();

        tokio::spawn(run(Arc::clone(&shared), cancel.clone(), Arc::new(on_fire)));
        debug!(enabled, cooldown_ms = cooldown.as_millis() as u64, "Flow-lock timer started");

        Self { shared, cancel }
    }

    /// Restart the idle clock.
    pub fn reset(&self) {
        self.shared.state.lock().last_activity = Instant::now();
        self.shared.changed.notify_one();
    }

    /// Turn autonomous triggering on or off. Enabling starts a fresh cooldown.
    pub fn set_enabled(&self, enabled: bool) {
        {
            let mut state = self.shared.state.lock();
            if state.enabled == enabled {
                return;
            }
            state.enabled = enabled;
            if enabled {
                state.last_activity = Instant::now();
            }
        }
        info!(enabled, "Flow-lock toggled");
        self.shared.changed.notify_one();
    }

    pub fn set_cooldown(&self, cooldown: Duration) {
        self.shared.state.lock().cooldown = cooldown;
        self.shared.changed.notify_one();
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.state.lock().enabled
    }

    pub fn cooldown(&self) -> Duration {
        self.shared.state.lock().cooldown
    }

    /// When the timer last fired, if ever.
    pub fn last_trigger_at(&self) -> Option<Instant> {
        self.shared.state.lock().last_trigger_at
    }

    /// Disable permanently. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for FlowLockTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run(shared: Arc<Shared>, cancel: CancellationToken, on_fire: FireCallback) {
    loop {
        let (enabled, deadline) = {
            let state = shared.state.lock();
            (state.enabled, state.last_activity + state.cooldown)
        };

        if !enabled {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = shared.changed.notified() => continue,
            }
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = shared.changed.notified() => continue,
            _ = tokio::time::sleep_until(deadline) => {
                let fire = {
                    let mut state = shared.state.lock();
                    let now = Instant::now();
                    let due = state.enabled && now >= state.last_activity + state.cooldown;
                    if due {
                        state.last_activity = now;
                        state.last_trigger_at = Some(now);
                    }
                    due
                };
                if fire && !cancel.is_cancelled() {
                    debug!("Flow-lock cooldown elapsed");
                    on_fire();
                }
            }
        }
    }
    debug!("Flow-lock timer stopped");
}
