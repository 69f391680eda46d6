//! Calendar source for date-bucketed counters.

use chrono::{Days, Local, NaiveDate};
use parking_lot::RwLock;

/// Supplies the current local calendar day.
///
/// Implementations are read on every call so a long-lived process rolls over
/// at local midnight without restarting.
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Wall clock in the host's local time zone.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Manually driven clock.
#[derive(Debug)]
pub struct ManualClock {
    today: RwLock<NaiveDate>,
}

impl ManualClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today: RwLock::new(today),
        }
    }

    pub fn set(&self, day: NaiveDate) {
        *self.today.write() = day;
    }

    /// Move forward by `days` calendar days.
    pub fn advance_days(&self, days: u64) {
        let mut today = self.today.write();
        if let Some(next) = today.checked_add_days(Days::new(days)) {
            *today = next;
        }
    }
}

impl Clock for ManualClock {
    fn today(&self) -> NaiveDate {
        *self.today.read()
    }
}
