//! Subscriber registry and fan-out channel for simulation events.
//!
//! Subscribers join and leave a single logical group; publishing is
//! best-effort fan-out over a broadcast channel and never blocks on a slow
//! or gone receiver. The pacing loop consults the membership count for its
//! auto-stop-when-unobserved check. A short ring of recent prediction events
//! is kept so late joiners don't start from an empty feed.

use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::{PredictionEvent, WsServerEvent};

const RECENT_EVENTS_CAP: usize = 50;

pub struct SimulationHub {
    tx: broadcast::Sender<WsServerEvent>,
    subscribers: Mutex<HashSet<Uuid>>,
    recent: Mutex<VecDeque<PredictionEvent>>,
}

/// Handle returned by `join`; the caller must `leave` with the id when done.
pub struct Subscription {
    pub id: Uuid,
    pub rx: broadcast::Receiver<WsServerEvent>,
}

impl SimulationHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self {
            tx,
            subscribers: Mutex::new(HashSet::new()),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_EVENTS_CAP)),
        }
    }

    /// Join the simulation group. The returned receiver sees every event
    /// published after this call.
    pub fn join(&self) -> Subscription {
        let id = Uuid::new_v4();
        let rx = self.tx.subscribe();
        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.insert(id);
            subscribers.len()
        };
        info!(subscriber = %id, count, "subscriber joined simulation group");
        Subscription { id, rx }
    }

    pub fn leave(&self, id: Uuid) {
        let count = {
            let mut subscribers = self.subscribers.lock();
            subscribers.remove(&id);
            subscribers.len()
        };
        info!(subscriber = %id, count, "subscriber left simulation group");
    }

    pub fn active_subscribers(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Fan out to every current subscriber, fire-and-forget. A membership
    /// change racing this call only affects whether that subscriber's
    /// receiver was already registered; no cross-step ordering is promised
    /// to a leaving subscriber.
    pub fn publish(&self, event: WsServerEvent) {
        if let WsServerEvent::PredictionUpdate(prediction) = &event {
            let mut recent = self.recent.lock();
            if recent.len() == RECENT_EVENTS_CAP {
                recent.pop_front();
            }
            recent.push_back(prediction.clone());
        }

        if self.tx.send(event).is_err() {
            debug!("event published with no live receivers");
        }
    }

    /// Recent prediction events for late joiners, oldest first.
    pub fn recent_events(&self) -> Vec<PredictionEvent> {
        self.recent.lock().iter().cloned().collect()
    }

    /// Drops the late-joiner ring; used when the simulation state is reset.
    pub fn clear_recent(&self) {
        self.recent.lock().clear();
    }
}
