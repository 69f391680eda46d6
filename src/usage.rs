//! Date-bucketed usage counters.
//!
//! Counters are keyed by (kind, local calendar day). Only the current day's
//! bucket is ever incremented; earlier buckets are frozen once the day ends
//! and are garbage-collected after the retention window.
//!
//! Increments go through a single mutex so concurrent callers never lose an
//! update. The in-memory count is authoritative for the running process; a
//! write that fails twice is logged and the count is kept.

use crate::clock::Clock;
use crate::prefs::{remove_with_retry, set_with_retry, PrefValue, PreferenceStore};
use crate::types::CounterKind;
use chrono::{Days, NaiveDate};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Key namespace for persisted counters.
const KEY_PREFIX: &str = "usage.";

/// Date format used in counter keys.
const BUCKET_FORMAT: &str = "%Y-%m-%d";

/// Default number of past days kept on disk.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Identifies one counter bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub kind: CounterKind,
    pub bucket: NaiveDate,
}

impl CounterKey {
    pub fn storage_key(&self) -> String {
        format!(
            "{KEY_PREFIX}{}.{}",
            self.kind.as_str(),
            self.bucket.format(BUCKET_FORMAT)
        )
    }

    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(KEY_PREFIX)?;
        let (kind, date) = rest.split_once('.')?;
        Some(Self {
            kind: CounterKind::parse(kind)?,
            bucket: NaiveDate::parse_from_str(date, BUCKET_FORMAT).ok()?,
        })
    }
}

#[derive(Default)]
struct CounterCache {
    counts: HashMap<CounterKey, u64>,
    /// Day the last retention sweep ran for.
    swept_for: Option<NaiveDate>,
}

/// Persisted, date-bucketed counters.
pub struct UsageCounterStore {
    prefs: Arc<dyn PreferenceStore>,
    clock: Arc<dyn Clock>,
    retention_days: u32,
    cache: Mutex<CounterCache>,
}

impl UsageCounterStore {
    pub fn new(prefs: Arc<dyn PreferenceStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_retention(prefs, clock, DEFAULT_RETENTION_DAYS)
    }

    pub fn with_retention(
        prefs: Arc<dyn PreferenceStore>,
        clock: Arc<dyn Clock>,
        retention_days: u32,
    ) -> Self {
        Self {
            prefs,
            clock,
            retention_days,
            cache: Mutex::new(CounterCache::default()),
        }
    }

    /// The bucket writes and "today" reads resolve to right now.
    pub fn current_bucket(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Count recorded for `kind` on `bucket`.
    pub fn get(&self, kind: CounterKind, bucket: NaiveDate) -> u64 {
        let key = CounterKey { kind, bucket };
        let mut cache = self.cache.lock();
        self.load(&mut cache, key)
    }

    /// Count recorded for `kind` on the current local day.
    pub fn get_today(&self, kind: CounterKind) -> u64 {
        self.get(kind, self.current_bucket())
    }

    /// Atomically add one to today's bucket and return the new count.
    pub fn increment(&self, kind: CounterKind) -> u64 {
        // The day is read under the lock so a bucket never moves backwards.
        let mut cache = self.cache.lock();
        let bucket = self.current_bucket();
        let key = CounterKey { kind, bucket };

        if cache.swept_for != Some(bucket) {
            cache.swept_for = Some(bucket);
            self.sweep(&mut cache, bucket);
        }

        let count = self.load(&mut cache, key).saturating_add(1);
        cache.counts.insert(key, count);

        let stored = i64::try_from(count).unwrap_or(i64::MAX);
        if let Err(e) = set_with_retry(self.prefs.as_ref(), &key.storage_key(), PrefValue::Int(stored)) {
            warn!(error = %e, kind = kind.as_str(), count, "usage counter not persisted");
        }

        debug!(kind = kind.as_str(), %bucket, count, "usage recorded");
        count
    }

    /// Drop buckets older than the retention window. Returns how many went.
    pub fn prune(&self) -> usize {
        let today = self.current_bucket();
        let mut cache = self.cache.lock();
        cache.swept_for = Some(today);
        self.sweep(&mut cache, today)
    }

    fn sweep(&self, cache: &mut CounterCache, today: NaiveDate) -> usize {
        let Some(cutoff) = today.checked_sub_days(Days::new(u64::from(self.retention_days))) else {
            return 0;
        };

        cache.counts.retain(|key, _| key.bucket >= cutoff);

        let keys = match self.prefs.keys_with_prefix(KEY_PREFIX) {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "could not list usage counters for pruning");
                return 0;
            }
        };

        let mut removed = 0;
        for raw in keys {
            let expired = CounterKey::parse(&raw).map_or(false, |k| k.bucket < cutoff);
            if expired {
                match remove_with_retry(self.prefs.as_ref(), &raw) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(error = %e, key = %raw, "could not prune usage counter"),
                }
            }
        }

        if removed > 0 {
            debug!(removed, %cutoff, "pruned usage counters");
        }
        removed
    }

    fn load(&self, cache: &mut CounterCache, key: CounterKey) -> u64 {
        if let Some(count) = cache.counts.get(&key) {
            return *count;
        }

        let count = match self.prefs.get(&key.storage_key()) {
            Ok(Some(value)) => value
                .as_int()
                .and_then(|n| u64::try_from(n).ok())
                .unwrap_or_else(|| {
                    warn!(key = %key.storage_key(), ?value, "ignoring non-integer usage counter");
                    0
                }),
            Ok(None) => 0,
            Err(e) => {
                warn!(error = %e, key = %key.storage_key(), "could not read usage counter");
                0
            }
        };

        cache.counts.insert(key, count);
        count
    }
}
