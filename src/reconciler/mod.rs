//! Entitlement reconciliation.
//!
//! The reconciler is the only writer of the tier. It folds verified purchase
//! events from an [`EntitlementSource`] into per-product state, derives the
//! tier from the product catalog, and commits transitions:
//!
//! ```text
//! source ──▶ worker ──▶ ledger.apply / ledger.replace
//!                            │
//!                            ▼
//!                 derive(catalog) ─▶ transition lock
//!                                      ├─ downgrade handlers (Premium → Free)
//!                                      └─ TierCell::store
//!                            │
//!                            ▼
//!                 tier cache ─▶ ready ─▶ observers
//! ```
//!
//! A transition is fully committed, demotions included, before any observer
//! hears of it. Readers of the tier never block.

mod ledger;
mod worker;

use crate::catalog::ProductCatalog;
use crate::config::{BackoffPolicy, EngineConfig};
use crate::error::Result;
use crate::prefs::{set_with_retry, PrefValue, PreferenceStore};
use crate::source::EntitlementSource;
use crate::subscriptions::{ObserverId, ObserverRegistry, TierChange, TierSubscription};
use crate::tier::TierCell;
use crate::types::{EntitlementEvent, ProductId, Tier, TierState};
use chrono::{DateTime, Utc};
use ledger::Ledger;
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use worker::Worker;

/// Preference key of the last committed tier.
pub const TIER_CACHE_KEY: &str = "entitlement.tier_cache";

/// Work that must finish inside a Premium → Free transition.
///
/// Handlers run synchronously while the transition lock is held, before the
/// new tier becomes visible. They must not call back into the reconciler.
pub trait DowngradeHandler: Send + Sync {
    fn on_downgrade(&self);
}

/// Point-in-time view of the reconciler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EntitlementStatus {
    pub state: TierState,
    pub tier: Tier,
    /// Recognized products currently entitled, sorted.
    pub active_products: Vec<ProductId>,
    pub last_reconciled: Option<DateTime<Utc>>,
    /// Whether a source stream is open.
    pub connected: bool,
    pub consecutive_failures: u32,
    pub malformed_events: u64,
    /// Tier found in the cache at startup. Never used to grant Premium.
    pub cached_tier: Option<Tier>,
}

/// State shared between the reconciler handle and its worker thread.
pub(crate) struct ReconcilerCore {
    catalog: ProductCatalog,
    pub(crate) tier: Arc<TierCell>,
    prefs: Arc<dyn PreferenceStore>,
    observers: ObserverRegistry,
    handlers: RwLock<Vec<Arc<dyn DowngradeHandler>>>,
    ledger: Mutex<Ledger>,
    cached: Option<Tier>,
    ready: Mutex<bool>,
    ready_cv: Condvar,
    failures: AtomicU32,
    connected: AtomicBool,
    malformed: AtomicU64,
}

impl ReconcilerCore {
    fn new(
        catalog: ProductCatalog,
        tier: Arc<TierCell>,
        prefs: Arc<dyn PreferenceStore>,
        observer_buffer_size: usize,
    ) -> Self {
        let cached = load_cached_tier(prefs.as_ref());
        Self {
            catalog,
            tier,
            prefs,
            observers: ObserverRegistry::new(observer_buffer_size),
            handlers: RwLock::new(Vec::new()),
            ledger: Mutex::new(Ledger::default()),
            cached,
            ready: Mutex::new(false),
            ready_cv: Condvar::new(),
            failures: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            malformed: AtomicU64::new(0),
        }
    }

    /// Fold one event in. Returns whether the tier changed.
    pub(crate) fn apply_event(&self, event: &EntitlementEvent) -> bool {
        let Some(plan) = self.catalog.plan_for(&event.product_id) else {
            debug!(product = %event.product_id, "ignoring unknown product");
            return false;
        };

        let mut ledger = self.ledger.lock();
        let changed = ledger.apply(event);
        ledger.last_reconciled = Some(Utc::now());
        debug!(product = %event.product_id, ?plan, kind = ?event.kind, changed, "entitlement event applied");
        self.commit(&ledger)
    }

    /// Replace state with an authoritative replay. Returns whether the tier changed.
    ///
    /// With `as_of`, events stamped before that instant no longer apply to
    /// any product afterwards.
    pub(crate) fn apply_snapshot(&self, snapshot: &[EntitlementEvent], as_of: Option<DateTime<Utc>>) -> bool {
        let known: Vec<EntitlementEvent> = snapshot
            .iter()
            .filter(|e| {
                let known = self.catalog.contains(&e.product_id);
                if !known {
                    debug!(product = %e.product_id, "ignoring unknown product in replay");
                }
                known
            })
            .cloned()
            .collect();

        let mut ledger = self.ledger.lock();
        ledger.replace(&known, as_of);
        ledger.last_reconciled = Some(Utc::now());
        self.commit(&ledger)
    }

    /// Derive the tier from `ledger` and commit it if it moved.
    ///
    /// The caller holds the ledger lock for the whole commit, so transitions
    /// are published in the order they were committed.
    fn commit(&self, ledger: &Ledger) -> bool {
        let next = ledger.derive(&self.catalog);

        let transition = self.tier.lock_transition();
        let previous = self.tier.state();
        if previous == TierState::from(next) {
            drop(transition);
            self.mark_ready();
            return false;
        }

        // A cached Premium is treated as Premium for demotion only.
        let was_premium = previous == TierState::Premium
            || (previous == TierState::Uninitialized && self.cached == Some(Tier::Premium));
        let demoted = next == Tier::Free && was_premium;
        if demoted {
            for handler in self.handlers.read().iter() {
                handler.on_downgrade();
            }
        }
        self.tier.store(next.into());
        drop(transition);

        info!(from = ?previous, to = %next, demoted, "tier changed");
        self.persist_tier(next);
        self.mark_ready();

        let change = TierChange {
            previous,
            current: next,
            demoted,
            at: Utc::now(),
        };
        self.observers.publish(&change);
        true
    }

    fn persist_tier(&self, tier: Tier) {
        let value = PrefValue::Str(tier.as_str().to_string());
        if let Err(e) = set_with_retry(self.prefs.as_ref(), TIER_CACHE_KEY, value) {
            warn!(error = %e, %tier, "tier cache not persisted");
        }
    }

    fn mark_ready(&self) {
        let mut ready = self.ready.lock();
        if !*ready {
            *ready = true;
            self.ready_cv.notify_all();
        }
    }

    fn wait_until_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ready = self.ready.lock();
        while !*ready {
            if self.ready_cv.wait_until(&mut ready, deadline).timed_out() {
                return *ready;
            }
        }
        true
    }

    /// Count a failed connection attempt. Returns the consecutive total.
    pub(crate) fn record_failure(&self) -> u32 {
        self.failures.fetch_add(1, Ordering::SeqCst).saturating_add(1)
    }

    pub(crate) fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        if connected {
            self.failures.store(0, Ordering::SeqCst);
        }
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn status(&self) -> EntitlementStatus {
        let (active_products, last_reconciled) = {
            let ledger = self.ledger.lock();
            (ledger.active_products(), ledger.last_reconciled)
        };
        let state = self.tier.state();
        EntitlementStatus {
            state,
            tier: state.tier(),
            active_products,
            last_reconciled,
            connected: self.connected.load(Ordering::SeqCst),
            consecutive_failures: self.failures.load(Ordering::SeqCst),
            malformed_events: self.malformed.load(Ordering::Relaxed),
            cached_tier: self.cached,
        }
    }
}

fn load_cached_tier(prefs: &dyn PreferenceStore) -> Option<Tier> {
    match prefs.get(TIER_CACHE_KEY) {
        Ok(Some(value)) => {
            let tier = value.as_str().and_then(Tier::parse);
            if tier.is_none() {
                warn!(?value, "ignoring unreadable tier cache");
            }
            tier
        }
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "could not read tier cache");
            None
        }
    }
}

/// Owner of the tier.
///
/// Consumes an [`EntitlementSource`] on a background worker once
/// [`start`](Self::start)ed. Events can also be applied directly with
/// [`apply_event`](Self::apply_event), which is what store adapters without a
/// stream of their own do.
pub struct EntitlementReconciler {
    core: Arc<ReconcilerCore>,
    source: Arc<dyn EntitlementSource>,
    backoff: BackoffPolicy,
    worker: Mutex<Option<Worker>>,
}

impl EntitlementReconciler {
    pub fn new(
        config: &EngineConfig,
        tier: Arc<TierCell>,
        prefs: Arc<dyn PreferenceStore>,
        source: Arc<dyn EntitlementSource>,
    ) -> Self {
        let core = ReconcilerCore::new(config.catalog.clone(), tier, prefs, config.observer_buffer_size);
        Self {
            core: Arc::new(core),
            source,
            backoff: config.backoff.clone(),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the worker: subscribe, replay, then follow the stream.
    ///
    /// Calling `start` while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        *worker = Some(Worker::spawn(
            Arc::clone(&self.core),
            Arc::clone(&self.source),
            self.backoff.clone(),
        )?);
        info!("entitlement reconciler started");
        Ok(())
    }

    /// Cancel the subscription and any pending reconnect and join the worker.
    /// The tier keeps its last value.
    pub fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop();
            info!("entitlement reconciler stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Ask the source for a fresh replay.
    ///
    /// While running the replay arrives on the stream. Otherwise it is fetched
    /// and applied on the calling thread.
    pub fn restore(&self) -> Result<()> {
        if self.is_running() {
            return self.source.restore();
        }
        let as_of = Utc::now();
        let snapshot = self.source.current_entitlements()?;
        self.core.apply_snapshot(&snapshot, Some(as_of));
        Ok(())
    }

    /// Apply one event. Returns whether the tier changed.
    pub fn apply_event(&self, event: &EntitlementEvent) -> bool {
        self.core.apply_event(event)
    }

    /// Apply an authoritative replay. Returns whether the tier changed.
    pub fn apply_snapshot(&self, snapshot: &[EntitlementEvent]) -> bool {
        self.core.apply_snapshot(snapshot, None)
    }

    /// Effective tier. Never blocks.
    pub fn current_tier(&self) -> Tier {
        self.core.tier.current()
    }

    pub fn state(&self) -> TierState {
        self.core.tier.state()
    }

    pub fn tier_cell(&self) -> Arc<TierCell> {
        Arc::clone(&self.core.tier)
    }

    /// Block until the first reconciliation or `timeout`. Returns whether
    /// the reconciler is ready.
    pub fn wait_until_ready(&self, timeout: Duration) -> bool {
        self.core.wait_until_ready(timeout)
    }

    /// Run `callback` after every committed transition.
    pub fn on_tier_changed<F>(&self, callback: F) -> ObserverId
    where
        F: Fn(&TierChange) + Send + Sync + 'static,
    {
        self.core.observers.on_change(callback)
    }

    pub fn subscribe(&self) -> TierSubscription {
        self.core.observers.subscribe()
    }

    pub fn unsubscribe(&self, id: ObserverId) {
        self.core.observers.unsubscribe(id);
    }

    /// Tell channel subscribers the reconciler is going away and forget
    /// every observer, callbacks included.
    pub fn disconnect_observers(&self) {
        self.core.observers.close_all();
    }

    pub fn add_downgrade_handler(&self, handler: Arc<dyn DowngradeHandler>) {
        self.core.handlers.write().push(handler);
    }

    pub fn status(&self) -> EntitlementStatus {
        self.core.status()
    }
}

impl Drop for EntitlementReconciler {
    fn drop(&mut self) {
        self.stop();
        self.disconnect_observers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ProductCatalog;
    use crate::prefs::MemoryPreferenceStore;
    use crate::settings::{PremiumPreference, SettingsReconciler};
    use crate::source::{ChannelSource, SourceMessage};
    use crate::subscriptions::TierEvent;
    use crate::types::EventKind;
    use crossbeam_channel::{unbounded, Sender};
    use std::sync::atomic::AtomicUsize;

    const MONTHLY: &str = ProductCatalog::MONTHLY;
    const LIFETIME: &str = ProductCatalog::LIFETIME;
    const YEARLY: &str = ProductCatalog::YEARLY;

    struct Fixture {
        prefs: Arc<MemoryPreferenceStore>,
        source: Arc<ChannelSource>,
        settings: Arc<SettingsReconciler>,
        reconciler: EntitlementReconciler,
    }

    fn fixture_with(prefs: Arc<MemoryPreferenceStore>, source: ChannelSource) -> Fixture {
        let mut config = EngineConfig::default();
        config.backoff.initial_delay_ms = 5;
        config.backoff.max_delay_ms = 20;

        let source = Arc::new(source);
        let tier = Arc::new(TierCell::new());
        let settings = Arc::new(SettingsReconciler::new(prefs.clone(), tier.clone()));
        let reconciler = EntitlementReconciler::new(&config, tier, prefs.clone(), source.clone());
        reconciler.add_downgrade_handler(settings.clone());
        Fixture {
            prefs,
            source,
            settings,
            reconciler,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Arc::new(MemoryPreferenceStore::new()), ChannelSource::new())
    }

    #[test]
    fn test_starts_uninitialized_as_free() {
        let f = fixture();
        assert_eq!(f.reconciler.state(), TierState::Uninitialized);
        assert_eq!(f.reconciler.current_tier(), Tier::Free);
        assert!(!f.reconciler.wait_until_ready(Duration::from_millis(10)));
    }

    #[test]
    fn test_verified_then_revoked() {
        let f = fixture();
        assert!(f.reconciler.apply_event(&EntitlementEvent::verified(MONTHLY)));
        assert_eq!(f.reconciler.current_tier(), Tier::Premium);
        assert!(f.reconciler.wait_until_ready(Duration::ZERO));

        assert!(f.reconciler.apply_event(&EntitlementEvent::revoked(MONTHLY)));
        assert_eq!(f.reconciler.state(), TierState::Free);
    }

    #[test]
    fn test_unknown_product_ignored() {
        let f = fixture();
        assert!(!f.reconciler.apply_event(&EntitlementEvent::verified("coins.pack.100")));
        assert_eq!(f.reconciler.state(), TierState::Uninitialized);
        assert!(f.reconciler.status().active_products.is_empty());
    }

    #[test]
    fn test_premium_kept_while_any_product_active() {
        let f = fixture();
        f.reconciler.apply_event(&EntitlementEvent::verified(MONTHLY));
        f.reconciler.apply_event(&EntitlementEvent::verified(LIFETIME));
        assert!(!f.reconciler.apply_event(&EntitlementEvent::expired(MONTHLY)));
        assert_eq!(f.reconciler.current_tier(), Tier::Premium);
        assert_eq!(f.reconciler.status().active_products, vec![ProductId::from(LIFETIME)]);
    }

    #[test]
    fn test_downgrade_demotes_before_observers_run() {
        let f = fixture();
        let pref = PremiumPreference::ShowItemImagesByDefault;
        f.reconciler.apply_event(&EntitlementEvent::verified(MONTHLY));
        assert!(f.settings.try_set_premium_preference(pref, true));

        let settings = f.settings.clone();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_in_cb = seen.clone();
        f.reconciler.on_tier_changed(move |change| {
            assert!(change.demoted);
            assert!(!settings.premium_preference(pref));
            seen_in_cb.fetch_add(1, Ordering::SeqCst);
        });

        f.reconciler.apply_event(&EntitlementEvent::revoked(MONTHLY));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.prefs.get(pref.storage_key()).unwrap(),
            Some(PrefValue::Bool(false))
        );
    }

    #[test]
    fn test_tier_cache_persisted() {
        let f = fixture();
        f.reconciler.apply_event(&EntitlementEvent::verified(MONTHLY));
        assert_eq!(
            f.prefs.get(TIER_CACHE_KEY).unwrap(),
            Some(PrefValue::Str("premium".into()))
        );
    }

    #[test]
    fn test_cached_premium_never_grants() {
        let prefs = Arc::new(MemoryPreferenceStore::new());
        prefs.set(TIER_CACHE_KEY, PrefValue::Str("premium".into())).unwrap();
        let f = fixture_with(prefs, ChannelSource::new());

        assert_eq!(f.reconciler.current_tier(), Tier::Free);
        assert_eq!(f.reconciler.status().cached_tier, Some(Tier::Premium));
    }

    #[test]
    fn test_cached_premium_demotes_on_first_free_replay() {
        let prefs = Arc::new(MemoryPreferenceStore::new());
        let pref = PremiumPreference::ShowItemImagesByDefault;
        prefs.set(TIER_CACHE_KEY, PrefValue::Str("premium".into())).unwrap();
        prefs.set(pref.storage_key(), PrefValue::Bool(true)).unwrap();
        let f = fixture_with(prefs, ChannelSource::new());

        let sub = f.reconciler.subscribe();
        f.reconciler.restore().unwrap();

        match sub.try_recv().unwrap() {
            TierEvent::Changed(change) => {
                assert_eq!(change.previous, TierState::Uninitialized);
                assert!(change.demoted);
            }
            other => panic!("Expected Changed event, got {:?}", other),
        }
        assert_eq!(
            f.prefs.get(pref.storage_key()).unwrap(),
            Some(PrefValue::Bool(false))
        );
    }

    #[test]
    fn test_worker_applies_replay_and_stream() {
        let source = ChannelSource::with_active([EntitlementEvent::verified(YEARLY)]);
        let f = fixture_with(Arc::new(MemoryPreferenceStore::new()), source);
        let sub = f.reconciler.subscribe();

        f.reconciler.start().unwrap();
        f.reconciler.start().unwrap();
        assert!(f.reconciler.wait_until_ready(Duration::from_secs(5)));
        assert_eq!(f.reconciler.current_tier(), Tier::Premium);
        assert_eq!(f.source.subscribe_calls(), 1);

        f.source.push(EntitlementEvent::new(YEARLY, EventKind::Refunded));
        loop {
            match sub.recv_timeout(Duration::from_secs(5)).unwrap() {
                TierEvent::Changed(c) if c.current == Tier::Free => break,
                TierEvent::Changed(_) => continue,
                other => panic!("Expected Changed event, got {:?}", other),
            }
        }

        f.reconciler.stop();
        assert!(!f.reconciler.is_running());
        assert_eq!(f.reconciler.current_tier(), Tier::Free);
    }

    /// Source whose stream already holds messages when it is opened.
    struct QueuedSource {
        queued: Vec<SourceMessage>,
        replay: Vec<EntitlementEvent>,
        open: Mutex<Vec<Sender<SourceMessage>>>,
    }

    impl EntitlementSource for QueuedSource {
        fn subscribe(&self) -> Result<crossbeam_channel::Receiver<SourceMessage>> {
            let (tx, rx) = unbounded();
            for message in &self.queued {
                let _ = tx.send(message.clone());
            }
            self.open.lock().push(tx);
            Ok(rx)
        }

        fn current_entitlements(&self) -> Result<Vec<EntitlementEvent>> {
            Ok(self.replay.clone())
        }

        fn restore(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_events_queued_before_replay_do_not_demote() {
        let prefs = Arc::new(MemoryPreferenceStore::new());
        let pref = PremiumPreference::ShowItemImagesByDefault;

        // Renewal raced the subscription: revoked, then verified again.
        let revoked = EntitlementEvent::revoked(MONTHLY);
        let renewed = EntitlementEvent::verified(MONTHLY);
        let source = Arc::new(QueuedSource {
            queued: vec![
                SourceMessage::Event(revoked),
                SourceMessage::Event(renewed.clone()),
                SourceMessage::Encoded(b"end of backlog".to_vec()),
            ],
            replay: vec![renewed],
            open: Mutex::new(Vec::new()),
        });

        let tier = Arc::new(TierCell::new());
        let settings = Arc::new(SettingsReconciler::new(prefs.clone(), tier.clone()));
        let reconciler = EntitlementReconciler::new(&EngineConfig::default(), tier, prefs.clone(), source);
        reconciler.add_downgrade_handler(settings.clone());

        reconciler.apply_event(&EntitlementEvent::verified(MONTHLY));
        assert!(settings.try_set_premium_preference(pref, true));

        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = transitions.clone();
        reconciler.on_tier_changed(move |change| seen.lock().push((change.current, change.demoted)));

        reconciler.start().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while reconciler.status().malformed_events == 0 {
            assert!(Instant::now() < deadline, "backlog never drained");
            std::thread::sleep(Duration::from_millis(5));
        }
        reconciler.stop();

        assert!(transitions.lock().is_empty());
        assert_eq!(reconciler.current_tier(), Tier::Premium);
        assert!(settings.premium_preference(pref));
        assert_eq!(
            prefs.get(pref.storage_key()).unwrap(),
            Some(PrefValue::Bool(true))
        );
    }
}
