//! The surface UI and business logic depend on.

use crate::config::LimitsConfig;
use crate::gate::{FeatureGate, FeatureLimits};
use crate::reconciler::EntitlementReconciler;
use crate::settings::{PremiumPreference, SettingsReconciler};
use crate::subscriptions::ObserverId;
use crate::types::{Category, Decision, Feature, Limit, Tier, Unit};
use std::sync::Arc;

/// Aggregates gate checks, premium preferences and change notification.
///
/// Cheap to clone; clones share the same engine.
#[derive(Clone)]
pub struct GateFacade {
    gate: Arc<FeatureGate>,
    settings: Arc<SettingsReconciler>,
    reconciler: Arc<EntitlementReconciler>,
    limits: LimitsConfig,
}

impl GateFacade {
    pub fn new(
        gate: Arc<FeatureGate>,
        settings: Arc<SettingsReconciler>,
        reconciler: Arc<EntitlementReconciler>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            gate,
            settings,
            reconciler,
            limits,
        }
    }

    pub fn current_tier(&self) -> Tier {
        self.reconciler.current_tier()
    }

    pub fn can_use(&self, feature: Feature) -> Decision {
        self.gate.can_use(feature)
    }

    pub fn can_use_category(&self, category: Category) -> Decision {
        self.gate.can_use_category(category)
    }

    pub fn can_use_unit(&self, unit: Unit) -> Decision {
        self.gate.can_use_unit(unit)
    }

    pub fn can_create_list(&self) -> Decision {
        self.gate.can_create_list()
    }

    pub fn can_send_notification(&self) -> Decision {
        self.gate.can_send_notification()
    }

    /// Call once per notification actually scheduled.
    pub fn record_notification_sent(&self) -> u64 {
        self.gate.record_notification_sent()
    }

    pub fn remaining_notifications_today(&self) -> Limit {
        self.gate.remaining_notifications_today()
    }

    pub fn limits_snapshot(&self) -> FeatureLimits {
        self.gate.limits_snapshot()
    }

    pub fn premium_preference(&self, pref: PremiumPreference) -> bool {
        self.settings.premium_preference(pref)
    }

    pub fn try_set_premium_preference(&self, pref: PremiumPreference, value: bool) -> bool {
        self.settings.try_set_premium_preference(pref, value)
    }

    /// Run `callback` with the new limits after every tier transition.
    pub fn on_limits_changed<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&FeatureLimits) + Send + Sync + 'static,
    {
        let limits = self.limits.clone();
        self.reconciler
            .on_tier_changed(move |change| callback(&FeatureLimits::for_tier(change.current, &limits)))
    }

    /// Copy shown when `feature` is denied.
    pub fn upgrade_prompt_text(feature: Feature) -> &'static str {
        match feature {
            Feature::UnlimitedLists => "Upgrade to Premium to create unlimited shopping lists.",
            Feature::AllCategories => "Upgrade to Premium to unlock every item category.",
            Feature::AllUnits => "Upgrade to Premium to use every measurement unit.",
            Feature::LocationReminders => "Upgrade to Premium to get reminders when you arrive at a store.",
            Feature::UnlimitedNotifications => "You've used today's free reminders. Upgrade to Premium for unlimited reminders.",
            Feature::Widgets => "Upgrade to Premium to add shopping list widgets to your home screen.",
            Feature::AppShortcuts => "Upgrade to Premium to use app shortcuts.",
            Feature::Templates => "Upgrade to Premium to save lists as reusable templates.",
            Feature::BudgetTracking => "Upgrade to Premium to track prices and stay on budget.",
            Feature::ItemImages => "Upgrade to Premium to add photos to your items.",
            Feature::ExportImport => "Upgrade to Premium to export and import your lists.",
            Feature::DataSharing => "Upgrade to Premium to share lists with family and friends.",
            Feature::PrioritySupport => "Upgrade to Premium for priority support.",
        }
    }
}
