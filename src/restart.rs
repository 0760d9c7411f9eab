//! Automatic restart policy for crashed instances
//!
//! Every process exit reaches the policy as an [`ExitNotice`]. Unsolicited
//! exits of instances with `auto_restart` enabled are respawned after a
//! linear backoff (`attempt × backoff_step`). Attempts are counted per
//! instance inside a time window; once the cap is reached the policy gives
//! up for the rest of that window and says so exactly once.

use crate::config::RestartSettings;
use crate::error::SupervisorError;
use crate::events::{Event, EventBus};
use crate::registry::InstanceRegistry;
use crate::supervisor::{ExitNotice, Supervisor};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Outcome of evaluating one crash against an attempt window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Respawn after `delay`
    Schedule { attempt: u32, delay: Duration },
    /// The cap was just reached; report it
    GiveUp { attempts: u32 },
    /// Already gave up in this window
    Exhausted,
}

/// Restart attempts made for one instance within the current window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptWindow {
    pub attempts: u32,
    pub started_at: Instant,
    pub gave_up: bool,
}

impl AttemptWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            attempts: 0,
            started_at: now,
            gave_up: false,
        }
    }

    /// Record a crash at `now` and decide what to do about it
    pub fn evaluate(&mut self, now: Instant, settings: &RestartSettings) -> RestartDecision {
        if now.duration_since(self.started_at) > settings.window() {
            *self = Self::new(now);
        }

        if self.attempts >= settings.max_attempts {
            if self.gave_up {
                return RestartDecision::Exhausted;
            }
            self.gave_up = true;
            return RestartDecision::GiveUp {
                attempts: self.attempts,
            };
        }

        self.attempts += 1;
        RestartDecision::Schedule {
            attempt: self.attempts,
            delay: settings.backoff(self.attempts),
        }
    }
}

struct PendingRespawn {
    token: u64,
    handle: AbortHandle,
}

/// Decides whether and when crashed instances are respawned.
///
/// Owns only the attempt windows and the pending respawn tasks; processes
/// are started through the [`Supervisor`].
pub struct RestartPolicy {
    supervisor: Arc<Supervisor>,
    registry: Arc<dyn InstanceRegistry>,
    events: EventBus,
    settings: RestartSettings,
    windows: Mutex<HashMap<String, AttemptWindow>>,
    pending: Mutex<HashMap<String, PendingRespawn>>,
    next_token: AtomicU64,
}

impl RestartPolicy {
    pub fn new(
        settings: RestartSettings,
        supervisor: Arc<Supervisor>,
        registry: Arc<dyn InstanceRegistry>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            registry,
            events,
            settings,
            windows: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        })
    }

    /// Consume exit notices until the supervisor goes away
    pub fn spawn(self: &Arc<Self>, mut exits: mpsc::UnboundedReceiver<ExitNotice>) -> JoinHandle<()> {
        let policy = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(notice) = exits.recv().await {
                policy.handle_exit(notice);
            }
            debug!("Exit channel closed, restart policy stopped");
        })
    }

    pub fn handle_exit(self: &Arc<Self>, notice: ExitNotice) {
        let instance_id = notice.instance_id.as_str();

        if notice.requested {
            debug!(instance_id, "Exit was requested, not restarting");
            return;
        }

        let Some(record) = self.registry.get(instance_id) else {
            debug!(instance_id, "Exited instance no longer registered");
            self.forget(instance_id);
            return;
        };
        if !record.config.auto_restart {
            return;
        }

        let now = Instant::now();
        let decision = {
            let mut windows = self.windows.lock();
            if notice.uptime >= self.settings.stable_uptime() {
                windows.remove(instance_id);
            }
            windows
                .entry(instance_id.to_string())
                .or_insert_with(|| AttemptWindow::new(now))
                .evaluate(now, &self.settings)
        };

        match decision {
            RestartDecision::Schedule { attempt, delay } => {
                let delay_ms = delay.as_millis() as u64;
                info!(instance_id, attempt, delay_ms, "Scheduling automatic restart");
                self.supervisor.log_system(
                    instance_id,
                    format!("restarting in {}ms (attempt {})", delay_ms, attempt),
                );
                self.events.publish(Event::AutoRestartScheduled {
                    instance_id: instance_id.to_string(),
                    attempt,
                    delay_ms,
                });
                self.schedule(instance_id, attempt, delay);
            }
            RestartDecision::GiveUp { attempts } => {
                warn!(
                    instance_id,
                    attempts,
                    window_secs = self.settings.window_secs,
                    "Instance keeps crashing, giving up on automatic restart"
                );
                self.supervisor.log_system(
                    instance_id,
                    format!("giving up after {} restart attempts", attempts),
                );
                self.events.publish(Event::AutoRestartFailed {
                    instance_id: instance_id.to_string(),
                    attempts,
                });
            }
            RestartDecision::Exhausted => {
                debug!(instance_id, "Restart attempts exhausted for this window");
            }
        }
    }

    fn schedule(self: &Arc<Self>, instance_id: &str, attempt: u32, delay: Duration) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let policy = Arc::clone(self);
        let id = instance_id.to_string();

        let mut pending = self.pending.lock();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            policy.respawn(&id, attempt, token);
        });
        let previous = pending.insert(
            instance_id.to_string(),
            PendingRespawn {
                token,
                handle: task.abort_handle(),
            },
        );
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    fn respawn(&self, instance_id: &str, attempt: u32, token: u64) {
        {
            let mut pending = self.pending.lock();
            match pending.get(instance_id) {
                Some(p) if p.token == token => {
                    pending.remove(instance_id);
                }
                // Cancelled or re-armed after the timer fired
                _ => return,
            }
        }

        let Some(record) = self.registry.get(instance_id) else {
            debug!(instance_id, "Instance removed before scheduled restart");
            self.windows.lock().remove(instance_id);
            return;
        };
        // The supervisor checks and claims the slot atomically, so a manual
        // start that won the race shows up here as AlreadyRunning
        match self.supervisor.start(instance_id, &record.launch_spec()) {
            Ok(pid) => {
                info!(instance_id, pid, attempt, "Instance restarted automatically");
            }
            Err(SupervisorError::AlreadyRunning(_)) => {
                debug!(instance_id, "Instance already running, skipping scheduled restart");
                self.windows.lock().remove(instance_id);
            }
            Err(e) => {
                warn!(instance_id, attempt, error = %e, "Automatic restart failed");
                self.events.publish(Event::AutoRestartError {
                    instance_id: instance_id.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Clear the attempt window and cancel any pending respawn.
    /// Called on manual start and restart.
    pub fn reset(&self, instance_id: &str) {
        self.windows.lock().remove(instance_id);
        self.cancel(instance_id);
    }

    /// Cancel a pending respawn. Returns true if one was scheduled.
    pub fn cancel(&self, instance_id: &str) -> bool {
        match self.pending.lock().remove(instance_id) {
            Some(pending) => {
                pending.handle.abort();
                debug!(instance_id, "Cancelled scheduled restart");
                true
            }
            None => false,
        }
    }

    /// Drop all state for a deleted instance
    pub fn forget(&self, instance_id: &str) {
        self.reset(instance_id);
    }

    /// Attempts counted in the instance's current window
    pub fn attempts(&self, instance_id: &str) -> u32 {
        self.windows
            .lock()
            .get(instance_id)
            .map(|w| w.attempts)
            .unwrap_or(0)
    }

    pub fn is_pending(&self, instance_id: &str) -> bool {
        self.pending.lock().contains_key(instance_id)
    }
}
