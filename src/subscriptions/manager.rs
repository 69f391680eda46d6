//! Observer registry for broadcasting tier changes.

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::types::{DropReason, ObserverId, TierChange, TierEvent, TierSubscription};

type Callback = Arc<dyn Fn(&TierChange) + Send + Sync>;

enum Sink {
    Channel(Sender<TierEvent>),
    Callback(Callback),
}

/// Registered observers, by ID.
pub struct ObserverRegistry {
    observers: RwLock<HashMap<ObserverId, Sink>>,
    next_id: AtomicU64,
    /// Changes a channel subscription may hold unread. The channel has one
    /// more slot, kept free for the final `Dropped` notice.
    buffer_size: usize,
}

impl ObserverRegistry {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        }
    }

    fn next_id(&self) -> ObserverId {
        ObserverId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Open a bounded channel subscription.
    pub fn subscribe(&self) -> TierSubscription {
        let id = self.next_id();
        let (sender, receiver) = bounded(self.buffer_size + 1);
        self.observers.write().insert(id, Sink::Channel(sender));
        TierSubscription { id, receiver }
    }

    /// Register a callback run synchronously on every transition.
    ///
    /// Callbacks run on the thread committing the transition and must not
    /// apply entitlement events themselves.
    pub fn on_change<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&TierChange) + Send + Sync + 'static,
    {
        let id = self.next_id();
        self.observers.write().insert(id, Sink::Callback(Arc::new(callback)));
        id
    }

    /// Remove an observer.
    pub fn unsubscribe(&self, id: ObserverId) {
        if let Some(Sink::Channel(sender)) = self.observers.write().remove(&id) {
            // Send dropped event (best effort)
            let _ = sender.try_send(TierEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.read().len()
    }

    /// Deliver `change` to every observer. Drops channels that are full or closed.
    pub fn publish(&self, change: &TierChange) {
        let mut callbacks = Vec::new();
        let mut to_remove = Vec::new();

        {
            let observers = self.observers.read();
            for (id, sink) in observers.iter() {
                match sink {
                    Sink::Callback(cb) => callbacks.push(Arc::clone(cb)),
                    Sink::Channel(sender) if sender.len() >= self.buffer_size => to_remove.push(*id),
                    Sink::Channel(sender) => {
                        match sender.try_send(TierEvent::Changed(change.clone())) {
                            Ok(()) => {}
                            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                                to_remove.push(*id)
                            }
                        }
                    }
                }
            }
        }

        // Remove dropped subscriptions
        if !to_remove.is_empty() {
            let mut observers = self.observers.write();
            for id in to_remove {
                if let Some(Sink::Channel(sender)) = observers.remove(&id) {
                    debug!(observer = id.0, "dropping slow tier subscriber");
                    let _ = sender.try_send(TierEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }

        // Outside the lock so callbacks may register or remove observers.
        for cb in callbacks {
            cb(change);
        }
    }

    /// Tell channel subscribers the engine is gone and forget everyone.
    pub fn close_all(&self) {
        let mut observers = self.observers.write();
        for (_, sink) in observers.drain() {
            if let Sink::Channel(sender) = sink {
                let _ = sender.try_send(TierEvent::Dropped {
                    reason: DropReason::Shutdown,
                });
            }
        }
    }
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new(64)
    }
}
