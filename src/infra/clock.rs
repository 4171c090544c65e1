//! Wall-clock source
//!
//! The schedule engine and the audit trail read time through `Clock` so tests
//! can pin the date and time instead of racing the real one.

use chrono::{DateTime, Duration, Local, NaiveDateTime, TimeZone};
use parking_lot::Mutex;
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

/// Real local time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Manually driven clock for tests and simulations
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Local>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Local>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    /// Start at a naive local date-time; ambiguous DST instants take the earlier offset
    pub fn at(naive: NaiveDateTime) -> Self {
        let start = Local
            .from_local_datetime(&naive)
            .earliest()
            .unwrap_or_else(|| Local.from_utc_datetime(&naive));
        Self::new(start)
    }

    pub fn set(&self, to: DateTime<Local>) {
        *self.now.lock() = to;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock()
    }
}
