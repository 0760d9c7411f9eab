//! Event taxonomy and the publish/subscribe bus that fans events out to observers
//!
//! Every producer (supervisor, restart policy, admin relay) publishes onto a
//! single [`EventBus`]. Publishing delivers to all observers while holding one
//! lock, which is the only sequencing point: each observer sees events in the
//! order they were published. Observers whose channel is closed or full are
//! pruned during the publish that discovers it, without affecting the rest.

use crate::logs::LogChannel;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Default per-observer queue depth
pub const DEFAULT_OBSERVER_BUFFER: usize = 1024;

/// Current state of one registered instance, as reported to observers and the API
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub auto_restart: bool,
    pub restart_attempts: u32,
}

/// Everything that can be broadcast to observers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Event {
    /// A line captured from a child or a supervisor notice
    Log {
        instance_id: String,
        channel: LogChannel,
        message: String,
        timestamp: DateTime<Utc>,
    },
    /// Terminal event of one process lifetime
    ProcessExit {
        instance_id: String,
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// The OS refused to spawn or wait on the child
    ProcessError { instance_id: String, message: String },
    InstanceStarted { instance_id: String, pid: Option<u32> },
    InstanceStopped { instance_id: String, pid: Option<u32> },
    InstanceRestarted { instance_id: String, pid: Option<u32> },
    InstanceDeleted { instance_id: String },
    AutoRestartScheduled {
        instance_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// The attempt cap was reached; no more automatic respawns this window
    AutoRestartFailed { instance_id: String, attempts: u32 },
    /// A scheduled respawn fired but the start failed
    AutoRestartError { instance_id: String, message: String },
    /// Full state, sent once to each newly connected observer
    Snapshot { instances: Vec<InstanceStatus> },
    /// Pass-through from an external collaborator (config change, download progress, ...)
    Notice {
        topic: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        instance_id: Option<String>,
        payload: serde_json::Value,
    },
}

impl Event {
    /// The instance this event concerns, if any
    pub fn instance_id(&self) -> Option<&str> {
        match self {
            Event::Log { instance_id, .. }
            | Event::ProcessExit { instance_id, .. }
            | Event::ProcessError { instance_id, .. }
            | Event::InstanceStarted { instance_id, .. }
            | Event::InstanceStopped { instance_id, .. }
            | Event::InstanceRestarted { instance_id, .. }
            | Event::InstanceDeleted { instance_id }
            | Event::AutoRestartScheduled { instance_id, .. }
            | Event::AutoRestartFailed { instance_id, .. }
            | Event::AutoRestartError { instance_id, .. } => Some(instance_id.as_str()),
            Event::Notice { instance_id, .. } => instance_id.as_deref(),
            Event::Snapshot { .. } => None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"unserializable event: {}"}}"#, e)
        })
    }
}

struct ObserverSlot {
    id: u64,
    tx: mpsc::Sender<Arc<Event>>,
}

struct BusInner {
    observers: Mutex<Vec<ObserverSlot>>,
    capacity: usize,
    next_id: AtomicU64,
}

/// Cloneable handle to the shared event bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_BUFFER)
    }
}

impl EventBus {
    /// Create a bus whose observers each queue up to `capacity` undelivered events
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                observers: Mutex::new(Vec::new()),
                capacity: capacity.max(1),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Deliver an event to every connected observer
    pub fn publish(&self, event: Event) {
        let event = Arc::new(event);
        let mut observers = self.inner.observers.lock();
        observers.retain(|slot| match slot.tx.try_send(Arc::clone(&event)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(observer = slot.id, "Observer queue full, disconnecting");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(observer = slot.id, "Observer gone, pruning");
                false
            }
        });
    }

    /// Register an observer that receives every event published from now on
    pub fn subscribe(&self) -> Observer {
        self.register(None::<fn() -> Event>)
    }

    /// Register an observer whose first message is the snapshot built by `snapshot`.
    ///
    /// The snapshot is taken while publishing is blocked, so no event is lost
    /// or duplicated between the snapshot and the live stream. `snapshot` must
    /// not publish.
    pub fn subscribe_with<F>(&self, snapshot: F) -> Observer
    where
        F: FnOnce() -> Event,
    {
        self.register(Some(snapshot))
    }

    fn register<F>(&self, snapshot: Option<F>) -> Observer
    where
        F: FnOnce() -> Event,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);

        let mut observers = self.inner.observers.lock();
        if let Some(snapshot) = snapshot {
            // Fresh channel with capacity >= 1 always has room
            let _ = tx.try_send(Arc::new(snapshot()));
        }
        observers.push(ObserverSlot { id, tx });
        debug!(observer = id, total = observers.len(), "Observer connected");

        Observer { id, rx }
    }

    /// Number of currently connected observers
    pub fn observer_count(&self) -> usize {
        let mut observers = self.inner.observers.lock();
        observers.retain(|slot| !slot.tx.is_closed());
        observers.len()
    }
}

/// Receiving side of one subscription
pub struct Observer {
    id: u64,
    rx: mpsc::Receiver<Arc<Event>>,
}

impl Observer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or None once the bus has pruned this observer
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        self.rx.recv().await
    }

    /// Non-blocking receive, for tests and draining
    pub fn try_recv(&mut self) -> Option<Arc<Event>> {
        self.rx.try_recv().ok()
    }
}
