//! Per-product entitlement state and the tier it implies.

use crate::catalog::ProductCatalog;
use crate::types::{EntitlementEvent, EventKind, ProductId, Tier};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

/// Latest known state of one product.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ProductState {
    pub active: bool,
    pub last_kind: EventKind,
    pub event_time: DateTime<Utc>,
}

/// Membership per product. Each product is set or unset by the latest event
/// seen for it, so duplicates and replays are no-ops.
///
/// An event older than the product's recorded state is stale and ignored.
/// Ties go to the later arrival.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    products: HashMap<ProductId, ProductState>,
    pub last_reconciled: Option<DateTime<Utc>>,
}

impl Ledger {
    /// Apply one event. Returns whether the product's membership changed.
    pub fn apply(&mut self, event: &EntitlementEvent) -> bool {
        if let Some(current) = self.products.get(&event.product_id) {
            if event.timestamp < current.event_time {
                debug!(
                    product = %event.product_id,
                    kind = ?event.kind,
                    event_time = %event.timestamp,
                    known_time = %current.event_time,
                    "ignoring stale entitlement event"
                );
                return false;
            }
        }

        let active = event.kind.grants();
        let next = ProductState {
            active,
            last_kind: event.kind,
            event_time: event.timestamp,
        };
        match self.products.insert(event.product_id.clone(), next) {
            Some(previous) => previous.active != active,
            None => active,
        }
    }

    /// Replace membership with an authoritative replay taken at `as_of`.
    ///
    /// Products missing from the replay are no longer entitled. Every product
    /// the replay touches is recorded as of `as_of` (or the entry's own time
    /// when later), so events stamped before the replay cannot undo it.
    pub fn replace(&mut self, snapshot: &[EntitlementEvent], as_of: Option<DateTime<Utc>>) -> bool {
        let replayed: HashMap<&ProductId, &EntitlementEvent> =
            snapshot.iter().map(|e| (&e.product_id, e)).collect();

        let mut changed = false;
        for (id, state) in self.products.iter_mut() {
            if replayed.contains_key(id) {
                continue;
            }
            if state.active {
                state.active = false;
                state.last_kind = EventKind::Expired;
                changed = true;
            }
            if let Some(as_of) = as_of {
                state.event_time = state.event_time.max(as_of);
            }
        }

        for event in replayed.values() {
            let active = event.kind.grants();
            let event_time = as_of.map_or(event.timestamp, |t| event.timestamp.max(t));
            let next = ProductState {
                active,
                last_kind: event.kind,
                event_time,
            };
            changed |= match self.products.insert(event.product_id.clone(), next) {
                Some(previous) => previous.active != active,
                None => active,
            };
        }
        changed
    }

    /// Premium iff an active product maps to Premium in the catalog.
    pub fn derive(&self, catalog: &ProductCatalog) -> Tier {
        let premium = self
            .products
            .iter()
            .any(|(id, state)| state.active && catalog.tier_for(id) == Some(Tier::Premium));
        if premium {
            Tier::Premium
        } else {
            Tier::Free
        }
    }

    pub fn active_products(&self) -> Vec<ProductId> {
        let mut ids: Vec<_> = self
            .products
            .iter()
            .filter(|(_, s)| s.active)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub fn product(&self, id: &str) -> Option<&ProductState> {
        self.products.get(&ProductId::from(id))
    }
}
