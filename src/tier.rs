//! Shared, lock-free view of the authoritative tier.

use crate::types::{Tier, TierState};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU8, Ordering};

const UNINITIALIZED: u8 = 0;
const FREE: u8 = 1;
const PREMIUM: u8 = 2;

/// Tier slot written only by the reconciler and read by everyone else.
///
/// Reads are a single atomic load and never block. Writers and
/// `try_set_premium_preference` serialize on the transition lock so a
/// downgrade's demotions and the tier flip are observed as one step.
#[derive(Debug)]
pub struct TierCell {
    state: AtomicU8,
    transition: Mutex<()>,
}

impl TierCell {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINITIALIZED),
            transition: Mutex::new(()),
        }
    }

    pub fn state(&self) -> TierState {
        match self.state.load(Ordering::Acquire) {
            PREMIUM => TierState::Premium,
            FREE => TierState::Free,
            _ => TierState::Uninitialized,
        }
    }

    /// Effective tier; `Free` until the first reconciliation.
    pub fn current(&self) -> Tier {
        self.state().tier()
    }

    pub(crate) fn store(&self, state: TierState) {
        let raw = match state {
            TierState::Uninitialized => UNINITIALIZED,
            TierState::Free => FREE,
            TierState::Premium => PREMIUM,
        };
        self.state.store(raw, Ordering::Release);
    }

    pub(crate) fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.transition.lock()
    }
}

impl Default for TierCell {
    fn default() -> Self {
        Self::new()
    }
}
