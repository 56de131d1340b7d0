//! Second-resolution time sources.
//!
//! All times inside the cache are `u32` seconds. An expiration of `0` means
//! "never"; relative expirations are converted to absolute times through
//! [`Clock::to_absolute`].

use std::sync::atomic::{AtomicU32, Ordering};

/// A source of the current time in whole seconds.
pub trait Clock: Send + Sync {
    /// Current time in seconds.
    fn now(&self) -> u32;

    /// Convert a relative expiration into an absolute one.
    ///
    /// `0` stays `0` (never expires); anything else is `now + relative`,
    /// saturating at `u32::MAX`.
    fn to_absolute(&self, relative: u32) -> u32 {
        absolute(self.now(), relative)
    }
}

/// Absolute expiration for a relative one seen at `now`; `0` stays `0`.
#[inline]
pub fn absolute(now: u32, relative: u32) -> u32 {
    if relative == 0 {
        0
    } else {
        deadline(now, relative)
    }
}

/// `now + interval`, saturating at `u32::MAX`.
#[inline]
pub fn deadline(now: u32, interval: u32) -> u32 {
    now.saturating_add(interval)
}

/// Seconds remaining until `expire_time`, or `0` for never/elapsed.
#[inline]
pub fn remaining(now: u32, expire_time: u32) -> u32 {
    if expire_time == 0 {
        0
    } else {
        expire_time.saturating_sub(now)
    }
}

/// Wall clock backed by the coarse unix clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> u32 {
        clocksource::coarse::UnixInstant::now()
            .duration_since(clocksource::coarse::UnixInstant::EPOCH)
            .as_secs()
    }
}

/// A clock that only moves when told to. Used to drive expiration in tests.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU32,
}

impl ManualClock {
    /// Create a clock reading `start` seconds.
    pub fn new(start: u32) -> Self {
        Self {
            now: AtomicU32::new(start),
        }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: u32) {
        let _ = self
            .now
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |now| {
                Some(now.saturating_add(secs))
            });
    }

    /// Set the clock to an absolute reading.
    pub fn set(&self, secs: u32) {
        self.now.store(secs, Ordering::Release);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(1)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u32 {
        self.now.load(Ordering::Acquire)
    }
}
