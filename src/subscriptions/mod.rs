//! Tier change notifications.
//!
//! Two ways to observe the authoritative tier:
//! - callbacks registered with `on_change`, run synchronously on the thread
//!   that applied the transition
//! - bounded channel subscriptions, where a subscriber that stops draining is
//!   dropped instead of blocking the reconciler
//!
//! # Example
//!
//! ```ignore
//! let registry = ObserverRegistry::new(16);
//! let sub = registry.subscribe();
//!
//! loop {
//!     match sub.recv() {
//!         Ok(TierEvent::Changed(change)) => println!("now {}", change.current),
//!         Ok(TierEvent::Dropped { .. }) | Err(_) => break,
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::ObserverRegistry;
pub use types::{DropReason, ObserverId, TierChange, TierEvent, TierSubscription};
