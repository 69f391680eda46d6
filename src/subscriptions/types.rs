//! Observer types for tier changes.

use crate::types::{Tier, TierState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A committed tier transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierChange {
    pub previous: TierState,
    pub current: Tier,
    /// Whether premium-only state was demoted as part of this transition.
    pub demoted: bool,
    pub at: DateTime<Utc>,
}

impl TierChange {
    pub fn is_upgrade(&self) -> bool {
        self.current == Tier::Premium && self.previous != TierState::Premium
    }

    pub fn is_downgrade(&self) -> bool {
        self.current == Tier::Free && self.previous == TierState::Premium
    }
}

/// Events delivered to channel subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TierEvent {
    /// The tier changed.
    Changed(TierChange),

    /// Subscription was dropped. No further events follow.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The engine shut down.
    Shutdown,
}

/// Unique identifier for an observer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObserverId(pub u64);

/// Handle to a channel subscription.
pub struct TierSubscription {
    pub id: ObserverId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<TierEvent>,
}

impl TierSubscription {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<TierEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<TierEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<TierEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
