//! Max-age vocabulary and the clock used to stamp cached entries.
//!
//! An entry saved at `saved_at` is fresh at `now` iff `now - saved_at <= max_age`.
//! Two sentinels short-circuit the comparison: [`CacheDuration::AlwaysReturned`]
//! and [`CacheDuration::AlwaysExpired`].

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sync::lock;

/// How old a cached entry may be before it is treated as absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheDuration {
    /// Return the cached value whatever its age.
    AlwaysReturned,
    /// Never return a cached value; always recompute.
    AlwaysExpired,
    /// Return the cached value if it is no older than this.
    Within(Duration),
}

impl CacheDuration {
    pub const ONE_SECOND: CacheDuration = CacheDuration::Within(Duration::from_secs(1));
    pub const ONE_MINUTE: CacheDuration = CacheDuration::Within(Duration::from_secs(60));
    pub const ONE_HOUR: CacheDuration = CacheDuration::Within(Duration::from_secs(60 * 60));
    pub const ONE_DAY: CacheDuration = CacheDuration::Within(Duration::from_secs(24 * 60 * 60));
    pub const ONE_WEEK: CacheDuration =
        CacheDuration::Within(Duration::from_secs(7 * 24 * 60 * 60));

    pub fn within(max_age: Duration) -> CacheDuration {
        CacheDuration::Within(max_age)
    }

    /// true if an entry written at `saved_at` may still be returned at `now`
    pub fn is_fresh(&self, saved_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self {
            CacheDuration::AlwaysReturned => true,
            CacheDuration::AlwaysExpired => false,
            CacheDuration::Within(max_age) => match chrono::Duration::from_std(*max_age) {
                Ok(max_age) => now.signed_duration_since(saved_at) <= max_age,
                // larger than chrono can represent, nothing is that old
                Err(_) => true,
            },
        }
    }

    /// false when a cached value can never satisfy this duration
    pub fn reads_cache(&self) -> bool {
        !matches!(self, CacheDuration::AlwaysExpired)
    }
}

impl Default for CacheDuration {
    fn default() -> Self {
        CacheDuration::ONE_MINUTE
    }
}

/// Source of "now" for entry timestamps and expiry checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to; used to test expiry at exact offsets.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> ManualClock {
        ManualClock {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *lock(&self.now) = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        if let Ok(by) = chrono::Duration::from_std(by) {
            *now += by;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        ManualClock::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}
