//! Injectable time source.
//!
//! Engine components never read system time directly; they ask a [`Clock`].
//! Production code uses [`SystemClock`], tests drive a [`ManualClock`] forward
//! explicitly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{CoreError, CoreResult};

/// Source of "now".
pub trait Clock: Send + Sync + core::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock shared between the engine's components.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Fixed clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward.
    pub fn add_time(&self, delta: Duration) -> CoreResult<DateTime<Utc>> {
        let delta = chrono::Duration::from_std(delta)
            .map_err(|e| CoreError::duration_out_of_range(e.to_string()))?;
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now = now
            .checked_add_signed(delta)
            .ok_or_else(|| CoreError::duration_out_of_range(format!("{now} + {delta}")))?;
        Ok(*now)
    }

    /// Jump to an absolute instant (may move backwards).
    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = instant;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_now()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Add a std duration to an instant, saturating at the end of the timeline.
pub fn instant_after(instant: DateTime<Utc>, delta: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delta)
        .ok()
        .and_then(|d| instant.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn epoch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn manual_clock_stays_put_until_advanced() {
        let clock = ManualClock::new(epoch());
        assert_eq!(clock.now(), epoch());
        assert_eq!(clock.now(), epoch());

        clock.add_time(Duration::from_secs(5)).unwrap();
        assert_eq!(clock.now(), epoch() + chrono::Duration::seconds(5));
    }

    #[test]
    fn manual_clock_can_be_set_backwards() {
        let clock = ManualClock::new(epoch());
        clock.add_time(Duration::from_secs(60)).unwrap();
        clock.set(epoch());
        assert_eq!(clock.now(), epoch());
    }

    #[test]
    fn instant_after_saturates() {
        let far = DateTime::<Utc>::MAX_UTC - chrono::Duration::seconds(1);
        assert_eq!(
            instant_after(far, Duration::from_secs(3600)),
            DateTime::<Utc>::MAX_UTC
        );
    }

    proptest! {
        /// Advancing in steps lands on the same instant as advancing once by the sum.
        #[test]
        fn advancing_is_additive(steps in prop::collection::vec(0u64..10_000, 0..20)) {
            let stepped = ManualClock::new(epoch());
            for ms in &steps {
                stepped.add_time(Duration::from_millis(*ms)).unwrap();
            }

            let total: u64 = steps.iter().sum();
            let once = ManualClock::new(epoch());
            once.add_time(Duration::from_millis(total)).unwrap();

            prop_assert_eq!(stepped.now(), once.now());
        }
    }
}
