//! Lifecycle events and the typed pub/sub emitter
//!
//! Observability hooks for a channel's lifecycle: pairing, inbound traffic,
//! deadline expiry, rate limiting, and teardown. Listeners are registered
//! per event kind and invoked synchronously at the emit site, outside the
//! registry lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::envelope::Envelope;

// ----------------------------------------------------------------------------
// Event Types
// ----------------------------------------------------------------------------

/// Discriminant used to register listeners for one class of event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Pairing completed; the channel is ready to transmit
    Ready,
    /// A validated inbound envelope was accepted
    MessageReceived,
    /// An outbound envelope was handed to the transport
    MessageSent,
    /// A correlated request elapsed its deadline
    Timeout,
    /// An outbound send was dropped by the rate limiter
    RateLimited,
    /// A recoverable anomaly (rejected inbound, overwritten subscription)
    Warning,
    /// A handler or transport failure
    Error,
    /// The channel was destroyed
    Destroy,
}

/// A lifecycle event with its payload
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Ready {
        peer_key: String,
    },
    MessageReceived {
        envelope: Envelope,
    },
    MessageSent {
        envelope: Envelope,
    },
    Timeout {
        request_id: String,
        cmdname: String,
    },
    RateLimited {
        cmdname: String,
    },
    Warning {
        message: String,
    },
    Error {
        message: String,
    },
    Destroy,
}

impl ChannelEvent {
    /// The kind listeners register under
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::Ready { .. } => EventKind::Ready,
            ChannelEvent::MessageReceived { .. } => EventKind::MessageReceived,
            ChannelEvent::MessageSent { .. } => EventKind::MessageSent,
            ChannelEvent::Timeout { .. } => EventKind::Timeout,
            ChannelEvent::RateLimited { .. } => EventKind::RateLimited,
            ChannelEvent::Warning { .. } => EventKind::Warning,
            ChannelEvent::Error { .. } => EventKind::Error,
            ChannelEvent::Destroy => EventKind::Destroy,
        }
    }
}

// ----------------------------------------------------------------------------
// Event Emitter
// ----------------------------------------------------------------------------

/// Listener callback for lifecycle events
pub type EventListener = Arc<dyn Fn(&ChannelEvent) + Send + Sync>;

/// Handle for unregistering a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

#[derive(Default)]
struct EmitterState {
    listeners: HashMap<EventKind, Vec<(ListenerId, EventListener)>>,
    next_id: u64,
}

/// Typed pub/sub registry for lifecycle events
#[derive(Default)]
pub struct EventEmitter {
    state: Mutex<EmitterState>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one event kind
    pub fn on(
        &self,
        kind: EventKind,
        listener: impl Fn(&ChannelEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let mut state = self.state.lock().expect("emitter state poisoned");
        state.next_id += 1;
        let id = ListenerId(state.next_id);
        state
            .listeners
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Unregister a listener; `false` if it was not registered
    pub fn off(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut state = self.state.lock().expect("emitter state poisoned");
        let Some(listeners) = state.listeners.get_mut(&kind) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Invoke every listener registered for the event's kind
    pub fn emit(&self, event: &ChannelEvent) {
        let listeners: Vec<EventListener> = {
            let state = self.state.lock().expect("emitter state poisoned");
            state
                .listeners
                .get(&event.kind())
                .map(|l| l.iter().map(|(_, f)| Arc::clone(f)).collect())
                .unwrap_or_default()
        };
        for listener in listeners {
            listener(event);
        }
    }

    /// Number of listeners registered for a kind
    pub fn listener_count(&self, kind: EventKind) -> usize {
        let state = self.state.lock().expect("emitter state poisoned");
        state.listeners.get(&kind).map_or(0, Vec::len)
    }

    /// Drop every listener
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("emitter state poisoned");
        state.listeners.clear();
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
