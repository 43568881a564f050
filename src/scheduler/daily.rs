//! Once-per-calendar-day trigger.
//!
//! The trigger remembers the date of its last successful run instead of
//! counting down, so checking it on every tick is idempotent and a late or
//! skipped tick only delays the run. A failed run is retried once
//! `retry_pause` has passed.

use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};

/// True when `now` is at or past `at` and nothing ran yet on `now`'s date.
pub fn should_fire(now: NaiveDateTime, at: NaiveTime, last_run: Option<NaiveDate>) -> bool {
    now.time() >= at && last_run != Some(now.date())
}

/// Daily trigger state, evaluated in local time.
#[derive(Debug, Clone)]
pub struct DailyTrigger {
    at: NaiveTime,
    last_run: Option<NaiveDate>,
    retry_pause: Duration,
    last_failure: Option<NaiveDateTime>,
}

impl DailyTrigger {
    pub fn new(at: NaiveTime) -> Self {
        Self {
            at,
            last_run: None,
            retry_pause: Duration::zero(),
            last_failure: None,
        }
    }

    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    pub fn at(&self) -> NaiveTime {
        self.at
    }

    pub fn last_run(&self) -> Option<NaiveDate> {
        self.last_run
    }

    pub fn is_due(&self, now: NaiveDateTime) -> bool {
        should_fire(now, self.at, self.last_run)
            && self
                .last_failure
                .and_then(|failed| failed.checked_add_signed(self.retry_pause))
                .is_none_or(|retry_at| now >= retry_at)
    }

    /// Record a successful run.
    pub fn mark_ran(&mut self, date: NaiveDate) {
        self.last_run = Some(date);
        self.last_failure = None;
    }

    /// Record a failed attempt. The date stays open; the next attempt waits
    /// for the retry pause.
    pub fn mark_failed(&mut self, now: NaiveDateTime) {
        self.last_failure = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn fires_once_after_threshold() {
        let mut trigger = DailyTrigger::new(at(3, 0));

        assert!(!trigger.is_due(day(1).and_time(at(2, 59))));
        assert!(trigger.is_due(day(1).and_time(at(3, 0))));

        trigger.mark_ran(day(1));
        assert!(!trigger.is_due(day(1).and_time(at(3, 0))));
        assert!(!trigger.is_due(day(1).and_time(at(23, 59))));

        assert!(!trigger.is_due(day(2).and_time(at(0, 30))));
        assert!(trigger.is_due(day(2).and_time(at(4, 0))));
    }

    #[test]
    fn missed_threshold_still_fires_later_that_day() {
        let trigger = DailyTrigger::new(at(0, 0));
        assert!(trigger.is_due(day(5).and_time(at(17, 45))));
    }

    #[test]
    fn unrecorded_failure_fires_again() {
        let trigger = DailyTrigger::new(at(1, 0));
        let now = day(1).and_time(at(1, 5));
        assert!(trigger.is_due(now));
        assert!(trigger.is_due(now));
        assert_eq!(trigger.last_run(), None);
    }

    #[test]
    fn failure_waits_for_retry_pause() {
        let mut trigger = DailyTrigger::new(at(1, 0)).with_retry_pause(Duration::minutes(15));
        let failed_at = day(1).and_time(at(1, 5));
        trigger.mark_failed(failed_at);

        assert!(!trigger.is_due(failed_at));
        assert!(!trigger.is_due(day(1).and_time(at(1, 19))));
        assert!(trigger.is_due(day(1).and_time(at(1, 20))));

        trigger.mark_ran(day(1));
        assert!(!trigger.is_due(day(1).and_time(at(2, 0))));
        assert!(trigger.is_due(day(2).and_time(at(1, 0))));
    }
}
