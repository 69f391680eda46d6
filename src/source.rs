//! Entitlement source interface.
//!
//! The source is the purchase-verification collaborator. It pushes verified
//! events; the engine never polls it. A source must offer:
//! - a live stream of events (`subscribe`)
//! - a replay of the currently active entitlements (`current_entitlements`)
//! - a forced fresh replay delivered on the stream (`restore`)
//!
//! [`ChannelSource`] is an in-process implementation backed by channels. Store
//! adapters feed it from their own callbacks; tests drive it directly.

use crate::error::{GateError, Result};
use crate::types::{EntitlementEvent, ProductId};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;

/// Messages delivered on a source stream.
#[derive(Clone, Debug)]
pub enum SourceMessage {
    /// A decoded entitlement change.
    Event(EntitlementEvent),

    /// A JSON-encoded event as received from the provider. May be malformed.
    Encoded(Vec<u8>),

    /// Authoritative replay of every currently active entitlement.
    Snapshot(Vec<EntitlementEvent>),

    /// The provider connection ended. The stream will not deliver more.
    Disconnected(String),
}

/// External purchase-verification source.
pub trait EntitlementSource: Send + Sync {
    /// Open a live stream. Dropping the receiver cancels the subscription.
    fn subscribe(&self) -> Result<Receiver<SourceMessage>>;

    /// Replay of the entitlements active right now.
    fn current_entitlements(&self) -> Result<Vec<EntitlementEvent>>;

    /// Ask the provider for a fresh replay, delivered as
    /// [`SourceMessage::Snapshot`] on open streams.
    fn restore(&self) -> Result<()>;
}

struct ChannelState {
    active: BTreeMap<ProductId, EntitlementEvent>,
    subscribers: Vec<Sender<SourceMessage>>,
    available: bool,
    subscribe_calls: usize,
}

impl ChannelState {
    /// Send to every live subscriber, forgetting the ones that hung up.
    fn broadcast(&mut self, message: SourceMessage) {
        self.subscribers.retain(|tx| tx.send(message.clone()).is_ok());
    }
}

/// In-process entitlement source.
pub struct ChannelSource {
    state: Mutex<ChannelState>,
}

impl ChannelSource {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ChannelState {
                active: BTreeMap::new(),
                subscribers: Vec::new(),
                available: true,
                subscribe_calls: 0,
            }),
        }
    }

    /// Source that starts with `events` already active.
    pub fn with_active(events: impl IntoIterator<Item = EntitlementEvent>) -> Self {
        let source = Self::new();
        {
            let mut state = source.state.lock();
            for event in events {
                if event.kind.grants() {
                    state.active.insert(event.product_id.clone(), event);
                }
            }
        }
        source
    }

    /// Record an entitlement change and push it to subscribers.
    pub fn push(&self, event: EntitlementEvent) {
        let mut state = self.state.lock();
        if event.kind.grants() {
            state.active.insert(event.product_id.clone(), event.clone());
        } else {
            state.active.remove(&event.product_id);
        }
        state.broadcast(SourceMessage::Event(event));
    }

    /// Deliver raw provider bytes without touching the replay set.
    pub fn push_encoded(&self, bytes: Vec<u8>) {
        self.state.lock().broadcast(SourceMessage::Encoded(bytes));
    }

    /// Make `subscribe` and `current_entitlements` fail while unavailable.
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// End every open stream.
    pub fn disconnect_all(&self, reason: &str) {
        let mut state = self.state.lock();
        for tx in state.subscribers.drain(..) {
            let _ = tx.send(SourceMessage::Disconnected(reason.to_string()));
        }
    }

    /// Open streams as of the last delivery. Streams whose receiver was
    /// dropped are forgotten on the next push.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Total `subscribe` calls, successful or not.
    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().subscribe_calls
    }

    pub fn active_products(&self) -> Vec<ProductId> {
        self.state.lock().active.keys().cloned().collect()
    }
}

impl Default for ChannelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EntitlementSource for ChannelSource {
    fn subscribe(&self) -> Result<Receiver<SourceMessage>> {
        let mut state = self.state.lock();
        state.subscribe_calls += 1;
        if !state.available {
            return Err(GateError::SourceUnavailable("channel source offline".into()));
        }
        let (tx, rx) = unbounded();
        state.subscribers.push(tx);
        debug!(subscribers = state.subscribers.len(), "entitlement stream opened");
        Ok(rx)
    }

    fn current_entitlements(&self) -> Result<Vec<EntitlementEvent>> {
        let state = self.state.lock();
        if !state.available {
            return Err(GateError::SourceUnavailable("channel source offline".into()));
        }
        Ok(state.active.values().cloned().collect())
    }

    fn restore(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.available {
            return Err(GateError::SourceUnavailable("channel source offline".into()));
        }
        let snapshot: Vec<_> = state.active.values().cloned().collect();
        state.broadcast(SourceMessage::Snapshot(snapshot));
        Ok(())
    }
}
