//! Tier-aware feature checks.
//!
//! Every check is a pure function of the current tier, the configured free
//! caps and, for quotas, the usage counters or the host's list count. None
//! of them block on the entitlement source.

use crate::config::LimitsConfig;
use crate::tier::TierCell;
use crate::types::{Category, CounterKind, Decision, Feature, Limit, Tier, Unit};
use crate::usage::UsageCounterStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Host-owned list storage. Only the count is needed.
pub trait ListStore: Send + Sync {
    fn list_count(&self) -> usize;
}

impl<F> ListStore for F
where
    F: Fn() -> usize + Send + Sync,
{
    fn list_count(&self) -> usize {
        self()
    }
}

/// Caps in effect for a tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureLimits {
    pub tier: Tier,
    pub max_lists: Limit,
    pub max_notifications_per_day: Limit,
    pub available_categories: Vec<Category>,
    pub available_units: Vec<Unit>,
}

impl FeatureLimits {
    /// Premium lifts every numeric cap and unlocks every category and unit.
    pub fn for_tier(tier: Tier, limits: &LimitsConfig) -> Self {
        match tier {
            Tier::Premium => Self {
                tier,
                max_lists: Limit::Unbounded,
                max_notifications_per_day: Limit::Unbounded,
                available_categories: Category::ALL.to_vec(),
                available_units: Unit::ALL.to_vec(),
            },
            Tier::Free => Self {
                tier,
                max_lists: Limit::Capped(limits.max_free_lists),
                max_notifications_per_day: Limit::Capped(limits.max_free_notifications_per_day),
                available_categories: limits.free_categories.clone(),
                available_units: limits.free_units.clone(),
            },
        }
    }
}

pub struct FeatureGate {
    tier: Arc<TierCell>,
    usage: Arc<UsageCounterStore>,
    lists: Arc<dyn ListStore>,
    limits: LimitsConfig,
}

impl FeatureGate {
    pub fn new(
        tier: Arc<TierCell>,
        usage: Arc<UsageCounterStore>,
        lists: Arc<dyn ListStore>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            tier,
            usage,
            lists,
            limits,
        }
    }

    fn tier(&self) -> Tier {
        self.tier.current()
    }

    pub fn can_use(&self, feature: Feature) -> Decision {
        Decision::from_bool(feature.available_at(self.tier()))
    }

    pub fn can_use_category(&self, category: Category) -> Decision {
        Decision::from_bool(self.tier().is_premium() || self.limits.free_categories.contains(&category))
    }

    pub fn can_use_unit(&self, unit: Unit) -> Decision {
        Decision::from_bool(self.tier().is_premium() || self.limits.free_units.contains(&unit))
    }

    /// Whether one more list may be created given the lists that exist now.
    pub fn can_create_list(&self) -> Decision {
        let limit = self.list_limit();
        let count = self.lists.list_count() as u64;
        let decision = Decision::from_bool(limit.permits(count));
        if !decision.is_allowed() {
            debug!(count, %limit, "list creation capped");
        }
        decision
    }

    pub fn can_send_notification(&self) -> Decision {
        let limit = self.notification_limit();
        if limit.is_unbounded() {
            return Decision::Allowed;
        }
        let sent = self.usage.get_today(CounterKind::NotificationsSent);
        let decision = Decision::from_bool(limit.permits(sent));
        if !decision.is_allowed() {
            debug!(sent, %limit, "notification quota reached");
        }
        decision
    }

    /// Count one scheduled notification against today. Premium usage is
    /// counted too, so a downgrade mid-day sees the real total.
    pub fn record_notification_sent(&self) -> u64 {
        self.usage.increment(CounterKind::NotificationsSent)
    }

    pub fn remaining_notifications_today(&self) -> Limit {
        let limit = self.notification_limit();
        if limit.is_unbounded() {
            return limit;
        }
        limit.remaining(self.usage.get_today(CounterKind::NotificationsSent))
    }

    pub fn limits_snapshot(&self) -> FeatureLimits {
        FeatureLimits::for_tier(self.tier(), &self.limits)
    }

    fn list_limit(&self) -> Limit {
        match self.tier() {
            Tier::Premium => Limit::Unbounded,
            Tier::Free => Limit::Capped(self.limits.max_free_lists),
        }
    }

    fn notification_limit(&self) -> Limit {
        match self.tier() {
            Tier::Premium => Limit::Unbounded,
            Tier::Free => Limit::Capped(self.limits.max_free_notifications_per_day),
        }
    }
}
