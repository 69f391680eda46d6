//! # Entitlement Gate
//!
//! Decides what a shopping-list user may do based on verified purchases.
//!
//! ## Core Concepts
//!
//! - **Reconciler**: Folds purchase events into per-product state and owns the tier
//! - **Gate**: Answers feature, category, unit and quota checks for the current tier
//! - **Usage counters**: Date-bucketed quotas that reset at local midnight
//! - **Settings**: Premium-only preferences, switched off inside a downgrade
//! - **Preference store**: Append-only, checksummed key-value log on disk
//!
//! ## Example
//!
//! ```ignore
//! use entitlement_gate::{ChannelSource, Engine, EngineConfig, EntitlementEvent, ProductCatalog};
//! use std::sync::Arc;
//!
//! let source = Arc::new(ChannelSource::new());
//! let engine = Engine::open(
//!     EngineConfig { data_dir: "./entitlements".into(), ..Default::default() },
//!     source.clone(),
//!     Arc::new(|| lists.len()),
//! )?;
//! engine.start()?;
//!
//! let gate = engine.facade();
//! if !gate.can_create_list().is_allowed() {
//!     show_paywall(GateFacade::upgrade_prompt_text(Feature::UnlimitedLists));
//! }
//!
//! // Purchase verified by the store adapter
//! source.push(EntitlementEvent::verified(ProductCatalog::MONTHLY));
//! ```

pub mod catalog;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod gate;
pub mod prefs;
pub mod reconciler;
pub mod settings;
pub mod source;
pub mod subscriptions;
pub mod tier;
pub mod types;
pub mod usage;

// Re-exports
pub use catalog::{PremiumPlan, ProductCatalog};
pub use clock::{Clock, LocalClock, ManualClock};
pub use config::{BackoffPolicy, EngineConfig, LimitsConfig, MAX_FREE_LISTS, MAX_FREE_NOTIFICATIONS_PER_DAY};
pub use engine::Engine;
pub use error::{GateError, Result};
pub use facade::GateFacade;
pub use gate::{FeatureGate, FeatureLimits, ListStore};
pub use prefs::{FilePreferenceStore, FileStoreConfig, MemoryPreferenceStore, PrefValue, PreferenceStore};
pub use reconciler::{DowngradeHandler, EntitlementReconciler, EntitlementStatus, TIER_CACHE_KEY};
pub use settings::{PremiumPreference, SettingsReconciler};
pub use source::{ChannelSource, EntitlementSource, SourceMessage};
pub use subscriptions::{DropReason, ObserverId, TierChange, TierEvent, TierSubscription};
pub use tier::TierCell;
pub use types::*;
pub use usage::{CounterKey, UsageCounterStore, DEFAULT_RETENTION_DAYS};
