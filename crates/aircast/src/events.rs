//! Streamer event broadcasting
//!
//! `EventBus` broadcasts discrete `StreamerEvent`s to subscribers. Hosts
//! subscribe for state transitions and the one-shot bitrate notification.

use std::sync::Mutex;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::streamer::State;

/// Discrete events broadcast to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum StreamerEvent {
    /// The streamer transitioned to a new lifecycle state
    StatusChanged(State),
    /// The bitrate estimate became usable (posted at most once per session),
    /// in bits per second
    BitrateReady(f64),
}

/// Broadcast mechanism for streamer events
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<StreamerEvent>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a new event bus with no subscribers
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to events. Returns a receiver that will get all future events.
    pub fn subscribe(&self) -> Receiver<StreamerEvent> {
        let (tx, rx) = unbounded();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Emit an event to all subscribers. Removes disconnected subscribers.
    pub fn emit(&self, event: StreamerEvent) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }
}
