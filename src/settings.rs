//! Premium-only preferences and their demotion on downgrade.

use crate::prefs::{set_with_retry, PrefValue, PreferenceStore};
use crate::reconciler::DowngradeHandler;
use crate::tier::TierCell;
use crate::types::Tier;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Boolean preferences that may only be on while Premium.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PremiumPreference {
    ShowItemImagesByDefault,
}

impl PremiumPreference {
    pub const ALL: [PremiumPreference; 1] = [PremiumPreference::ShowItemImagesByDefault];

    pub fn storage_key(self) -> &'static str {
        match self {
            PremiumPreference::ShowItemImagesByDefault => "settings.show_item_images_by_default",
        }
    }

    /// Free-tier value.
    pub fn free_default(self) -> bool {
        false
    }
}

/// Keeps premium-only preferences consistent with the tier.
pub struct SettingsReconciler {
    prefs: Arc<dyn PreferenceStore>,
    tier: Arc<TierCell>,
    /// In-memory values; authoritative even when a write was lost.
    values: RwLock<HashMap<PremiumPreference, bool>>,
}

impl SettingsReconciler {
    pub fn new(prefs: Arc<dyn PreferenceStore>, tier: Arc<TierCell>) -> Self {
        Self {
            prefs,
            tier,
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Effective value of `pref`.
    ///
    /// Reads as the free default whenever the tier is not Premium, so a stored
    /// `true` is never observable together with `Free`.
    pub fn premium_preference(&self, pref: PremiumPreference) -> bool {
        if self.tier.current() != Tier::Premium {
            return pref.free_default();
        }
        self.stored(pref)
    }

    /// Set `pref`. Enabling it requires Premium; otherwise nothing changes and
    /// `false` is returned.
    pub fn try_set_premium_preference(&self, pref: PremiumPreference, value: bool) -> bool {
        let _transition = self.tier.lock_transition();
        if value && self.tier.current() != Tier::Premium {
            debug!(?pref, "refusing to enable premium preference without Premium");
            return false;
        }
        self.write(pref, value);
        true
    }

    /// Force every premium preference back to its free default.
    ///
    /// Returns how many preferences were switched off.
    pub fn on_downgrade(&self) -> usize {
        let mut demoted = 0;
        for pref in PremiumPreference::ALL {
            if self.stored(pref) != pref.free_default() {
                self.write(pref, pref.free_default());
                demoted += 1;
            }
        }
        if demoted > 0 {
            info!(demoted, "premium preferences reset to free defaults");
        }
        demoted
    }

    fn stored(&self, pref: PremiumPreference) -> bool {
        if let Some(value) = self.values.read().get(&pref) {
            return *value;
        }

        let value = match self.prefs.get(pref.storage_key()) {
            Ok(Some(v)) => v.as_bool().unwrap_or_else(|| {
                warn!(key = pref.storage_key(), "ignoring non-boolean preference");
                pref.free_default()
            }),
            Ok(None) => pref.free_default(),
            Err(e) => {
                warn!(error = %e, key = pref.storage_key(), "could not read preference");
                pref.free_default()
            }
        };

        *self.values.write().entry(pref).or_insert(value)
    }

    fn write(&self, pref: PremiumPreference, value: bool) {
        self.values.write().insert(pref, value);
        if let Err(e) = set_with_retry(self.prefs.as_ref(), pref.storage_key(), PrefValue::Bool(value)) {
            warn!(error = %e, ?pref, value, "preference change kept in memory only");
        }
    }
}

impl DowngradeHandler for SettingsReconciler {
    fn on_downgrade(&self) {
        SettingsReconciler::on_downgrade(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::MemoryPreferenceStore;
    use crate::types::TierState;

    fn setup(state: TierState) -> (Arc<MemoryPreferenceStore>, Arc<TierCell>, SettingsReconciler) {
        let prefs = Arc::new(MemoryPreferenceStore::new());
        let tier = Arc::new(TierCell::new());
        tier.store(state);
        let settings = SettingsReconciler::new(prefs.clone(), tier.clone());
        (prefs, tier, settings)
    }

    #[test]
    fn test_free_user_cannot_enable() {
        let (prefs, _tier, settings) = setup(TierState::Free);
        assert!(!settings.try_set_premium_preference(PremiumPreference::ShowItemImagesByDefault, true));
        assert!(prefs.is_empty());
    }

    #[test]
    fn test_free_user_may_disable() {
        let (_prefs, _tier, settings) = setup(TierState::Free);
        assert!(settings.try_set_premium_preference(PremiumPreference::ShowItemImagesByDefault, false));
    }

    #[test]
    fn test_uninitialized_counts_as_free() {
        let (_prefs, _tier, settings) = setup(TierState::Uninitialized);
        assert!(!settings.try_set_premium_preference(PremiumPreference::ShowItemImagesByDefault, true));
    }

    #[test]
    fn test_downgrade_demotes_and_persists() {
        let (prefs, tier, settings) = setup(TierState::Premium);
        let pref = PremiumPreference::ShowItemImagesByDefault;
        assert!(settings.try_set_premium_preference(pref, true));
        assert!(settings.premium_preference(pref));

        assert_eq!(settings.on_downgrade(), 1);
        tier.store(TierState::Free);

        assert!(!settings.premium_preference(pref));
        assert_eq!(prefs.get(pref.storage_key()).unwrap(), Some(PrefValue::Bool(false)));
        assert_eq!(settings.on_downgrade(), 0);
    }

    #[test]
    fn test_demotes_value_only_on_disk() {
        let (prefs, _tier, settings) = setup(TierState::Premium);
        let pref = PremiumPreference::ShowItemImagesByDefault;
        prefs.set(pref.storage_key(), PrefValue::Bool(true)).unwrap();

        assert_eq!(settings.on_downgrade(), 1);
        assert_eq!(prefs.get(pref.storage_key()).unwrap(), Some(PrefValue::Bool(false)));
    }

    #[test]
    fn test_stored_true_reads_false_while_free() {
        let (prefs, _tier, settings) = setup(TierState::Free);
        let pref = PremiumPreference::ShowItemImagesByDefault;
        prefs.set(pref.storage_key(), PrefValue::Bool(true)).unwrap();
        assert!(!settings.premium_preference(pref));
    }
}
