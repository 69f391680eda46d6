//! End-to-end tests through the engine and its facade.

use chrono::NaiveDate;
use entitlement_gate::{
    Category, ChannelSource, Decision, Engine, EngineConfig, EntitlementEvent, EventKind, Feature,
    FilePreferenceStore, FileStoreConfig, GateFacade, Limit, ManualClock, PreferenceStore,
    PremiumPreference, ProductCatalog, Tier, TierEvent, TierState, Unit,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

const MONTHLY: &str = ProductCatalog::MONTHLY;
const LIFETIME: &str = ProductCatalog::LIFETIME;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig {
        data_dir: dir.path().join("entitlements"),
        ..Default::default()
    };
    config.backoff.initial_delay_ms = 5;
    config.backoff.max_delay_ms = 50;
    config
}

fn march(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
}

struct Harness {
    source: Arc<ChannelSource>,
    clock: Arc<ManualClock>,
    lists: Arc<AtomicUsize>,
    engine: Engine,
}

impl Harness {
    fn open(dir: &TempDir, source: ChannelSource) -> Self {
        init_tracing();
        let config = config(dir);
        let store = FilePreferenceStore::open(FileStoreConfig::at(config.data_dir.clone())).unwrap();
        let source = Arc::new(source);
        let clock = Arc::new(ManualClock::new(march(7)));
        let lists = Arc::new(AtomicUsize::new(0));
        let count = lists.clone();
        let engine = Engine::with_store(
            config,
            Arc::new(store),
            clock.clone(),
            source.clone(),
            Arc::new(move || count.load(Ordering::SeqCst)),
        )
        .unwrap();
        Self {
            source,
            clock,
            lists,
            engine,
        }
    }

    fn gate(&self) -> GateFacade {
        self.engine.facade()
    }

    /// Start the worker and wait for the first replay.
    fn start(&self) {
        self.engine.start().unwrap();
        assert!(self.engine.reconciler().wait_until_ready(Duration::from_secs(5)));
    }

    /// Push `event` and wait for the resulting transition to commit.
    fn push_and_wait(&self, event: EntitlementEvent, expected: Tier) {
        let sub = self.engine.reconciler().subscribe();
        self.source.push(event);
        loop {
            match sub.recv_timeout(Duration::from_secs(5)).unwrap() {
                TierEvent::Changed(change) if change.current == expected => break,
                TierEvent::Changed(_) => continue,
                other => panic!("Expected Changed event, got {:?}", other),
            }
        }
        self.engine.reconciler().unsubscribe(sub.id);
    }
}

// --- Scenarios ---

#[test]
fn test_list_cap_lifted_by_purchase() {
    let dir = TempDir::new().unwrap();
    let h = Harness::open(&dir, ChannelSource::new());
    h.start();
    let gate = h.gate();

    assert_eq!(gate.current_tier(), Tier::Free);
    for _ in 0..3 {
        assert_eq!(gate.can_create_list(), Decision::Allowed);
        h.lists.fetch_add(1, Ordering::SeqCst);
    }
    assert_eq!(gate.can_create_list(), Decision::DeniedNeedsUpgrade);

    h.push_and_wait(EntitlementEvent::verified(MONTHLY), Tier::Premium);
    assert_eq!(gate.can_create_list(), Decision::Allowed);
    assert_eq!(gate.limits_snapshot().max_lists, Limit::Unbounded);
}

#[test]
fn test_revoke_turns_off_item_images() {
    let dir = TempDir::new().unwrap();
    let h = Harness::open(&dir, ChannelSource::with_active([EntitlementEvent::verified(MONTHLY)]));
    h.start();
    let gate = h.gate();
    let pref = PremiumPreference::ShowItemImagesByDefault;

    assert_eq!(gate.current_tier(), Tier::Premium);
    assert!(gate.try_set_premium_preference(pref, true));
    assert!(gate.premium_preference(pref));

    // Observed from the committing thread: never `true` together with Free.
    let violations = Arc::new(AtomicUsize::new(0));
    let seen = violations.clone();
    let observer = gate.clone();
    h.engine.reconciler().on_tier_changed(move |change| {
        if change.current == Tier::Free && observer.premium_preference(pref) {
            seen.fetch_add(1, Ordering::SeqCst);
        }
    });

    // Concurrent reader polling through the facade while the revoke commits.
    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let gate = gate.clone();
        let stop = stop.clone();
        let violations = violations.clone();
        thread::spawn(move || {
            let mut reads = 0usize;
            while !stop.load(Ordering::SeqCst) {
                if gate.current_tier() == Tier::Free && gate.premium_preference(pref) {
                    violations.fetch_add(1, Ordering::SeqCst);
                }
                reads += 1;
            }
            reads
        })
    };

    h.push_and_wait(EntitlementEvent::revoked(MONTHLY), Tier::Free);
    thread::sleep(Duration::from_millis(10));
    stop.store(true, Ordering::SeqCst);
    assert!(reader.join().unwrap() > 0);

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(!gate.premium_preference(pref));
    assert!(!gate.try_set_premium_preference(pref, true));
}

#[test]
fn test_notification_quota_across_midnight() {
    let dir = TempDir::new().unwrap();
    let h = Harness::open(&dir, ChannelSource::new());
    let gate = h.gate();

    for _ in 0..5 {
        assert_eq!(gate.can_send_notification(), Decision::Allowed);
        gate.record_notification_sent();
    }
    assert_eq!(gate.can_send_notification(), Decision::DeniedNeedsUpgrade);
    assert_eq!(gate.remaining_notifications_today(), Limit::Capped(0));

    h.clock.advance_days(1);
    assert_eq!(gate.can_send_notification(), Decision::Allowed);
    assert_eq!(gate.remaining_notifications_today(), Limit::Capped(5));
}

#[test]
fn test_free_catalogue_of_categories_and_units() {
    let dir = TempDir::new().unwrap();
    let h = Harness::open(&dir, ChannelSource::new());
    let gate = h.gate();

    let free = gate.limits_snapshot();
    for category in Category::ALL {
        assert_eq!(
            gate.can_use_category(category).is_allowed(),
            free.available_categories.contains(&category)
        );
    }
    for unit in Unit::ALL {
        assert_eq!(gate.can_use_unit(unit).is_allowed(), free.available_units.contains(&unit));
    }
    assert_eq!(gate.can_use(Feature::Widgets), Decision::DeniedNeedsUpgrade);
}

#[test]
fn test_limits_observer() {
    let dir = TempDir::new().unwrap();
    let h = Harness::open(&dir, ChannelSource::new());
    let gate = h.gate();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    gate.on_limits_changed(move |limits| sink.lock().unwrap().push(limits.max_notifications_per_day));

    h.engine.reconciler().apply_event(&EntitlementEvent::verified(LIFETIME));
    h.engine.reconciler().apply_event(&EntitlementEvent::new(LIFETIME, EventKind::Refunded));

    assert_eq!(*seen.lock().unwrap(), vec![Limit::Unbounded, Limit::Capped(5)]);
}

#[test]
fn test_restore_replays_purchases() {
    let dir = TempDir::new().unwrap();
    let h = Harness::open(&dir, ChannelSource::with_active([EntitlementEvent::verified(LIFETIME)]));

    // Not started: restore fetches and applies on the calling thread.
    assert_eq!(h.engine.reconciler().state(), TierState::Uninitialized);
    h.engine.restore().unwrap();
    assert_eq!(h.gate().current_tier(), Tier::Premium);

    let status = h.engine.status();
    assert_eq!(status.active_products.len(), 1);
    assert!(status.last_reconciled.is_some());
}

// --- Restart ---

#[test]
fn test_counters_and_preferences_survive_restart() {
    let dir = TempDir::new().unwrap();
    let pref = PremiumPreference::ShowItemImagesByDefault;

    {
        let h = Harness::open(&dir, ChannelSource::new());
        let gate = h.gate();
        h.engine.reconciler().apply_event(&EntitlementEvent::verified(MONTHLY));
        assert!(gate.try_set_premium_preference(pref, true));
        for _ in 0..3 {
            gate.record_notification_sent();
        }
        h.engine.shutdown().unwrap();
    }

    let h = Harness::open(&dir, ChannelSource::with_active([EntitlementEvent::verified(MONTHLY)]));
    let gate = h.gate();

    // Quota is shared across restarts; Premium is not granted until verified.
    assert_eq!(gate.current_tier(), Tier::Free);
    assert!(!gate.premium_preference(pref));
    assert_eq!(h.engine.status().cached_tier, Some(Tier::Premium));
    assert_eq!(gate.remaining_notifications_today(), Limit::Capped(2));

    h.start();
    assert_eq!(gate.current_tier(), Tier::Premium);
    assert!(gate.premium_preference(pref));
}

#[test]
fn test_lapsed_subscription_demoted_on_restart() {
    let dir = TempDir::new().unwrap();
    let pref = PremiumPreference::ShowItemImagesByDefault;

    {
        let h = Harness::open(&dir, ChannelSource::new());
        h.engine.reconciler().apply_event(&EntitlementEvent::verified(MONTHLY));
        assert!(h.gate().try_set_premium_preference(pref, true));
    }

    // Expired while the app was closed.
    let h = Harness::open(&dir, ChannelSource::new());
    h.start();
    assert_eq!(h.gate().current_tier(), Tier::Free);

    h.engine.shutdown().unwrap();
    drop(h);
    let store = FilePreferenceStore::open(FileStoreConfig::at(dir.path().join("entitlements"))).unwrap();
    assert_eq!(
        store.get(pref.storage_key()).unwrap().and_then(|v| v.as_bool()),
        Some(false)
    );
}
