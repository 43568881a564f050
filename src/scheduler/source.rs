//! Polling sources and due-time computation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a polling source.
pub type SourceId = i64;

/// Default polling interval in minutes.
pub const DEFAULT_FETCH_INTERVAL_MINUTES: i64 = 60;

/// Longest accepted polling interval: one year.
pub const MAX_FETCH_INTERVAL_MINUTES: i64 = 366 * 24 * 60;

/// A polling target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub name: String,
    /// Feed address.
    pub url: String,
    pub category: Option<String>,
    pub language: String,
    pub is_active: bool,
    pub fetch_interval_minutes: i64,
    /// Set when a dispatched fetch finishes, whether it succeeded or not.
    pub last_fetch_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    /// Polling interval as a chrono duration, `None` if out of range.
    pub fn interval(&self) -> Option<Duration> {
        Duration::try_minutes(self.fetch_interval_minutes)
    }

    /// Earliest instant the next fetch may start, `None` if never fetched.
    ///
    /// An interval that overflows the calendar pushes the next fetch to
    /// `DateTime::MAX_UTC`, so the source is never due again on its own.
    pub fn next_fetch_at(&self) -> Option<DateTime<Utc>> {
        let last = self.last_fetch_time?;
        Some(
            self.interval()
                .and_then(|interval| last.checked_add_signed(interval))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }
}

/// Check a polling interval before it is stored.
pub fn validate_interval(minutes: i64) -> Result<(), String> {
    if (1..=MAX_FETCH_INTERVAL_MINUTES).contains(&minutes) {
        Ok(())
    } else {
        Err(format!(
            "fetch interval must be between 1 and {MAX_FETCH_INTERVAL_MINUTES} minutes, got {minutes}"
        ))
    }
}

/// Fields needed to register a new source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSource {
    pub name: String,
    pub url: String,
    pub category: Option<String>,
    pub language: String,
    pub is_active: bool,
    pub fetch_interval_minutes: i64,
}

impl NewSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            category: None,
            language: "tr".to_string(),
            is_active: true,
            fetch_interval_minutes: DEFAULT_FETCH_INTERVAL_MINUTES,
        }
    }

    pub fn with_interval_minutes(mut self, minutes: i64) -> Self {
        self.fetch_interval_minutes = minutes;
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.is_active = false;
        self
    }
}

/// A source is due when it was never fetched or its interval has elapsed.
pub fn is_due(source: &Source, now: DateTime<Utc>) -> bool {
    match source.next_fetch_at() {
        None => true,
        Some(next) => now >= next,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(last_fetch: Option<DateTime<Utc>>) -> Source {
        let now = Utc::now();
        Source {
            id: 1,
            name: "wire".into(),
            url: "https://example.com/rss".into(),
            category: None,
            language: "tr".into(),
            is_active: true,
            fetch_interval_minutes: 60,
            last_fetch_time: last_fetch,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn never_fetched_is_due() {
        let s = source(None);
        assert!(is_due(&s, Utc::now()));
        assert!(is_due(&s, DateTime::<Utc>::MIN_UTC));
    }

    #[test]
    fn due_only_after_interval() {
        let now = Utc::now();
        assert!(!is_due(&source(Some(now - Duration::minutes(30))), now));
        assert!(!is_due(&source(Some(now - Duration::minutes(59))), now));
        assert!(is_due(&source(Some(now - Duration::minutes(61))), now));
    }

    #[test]
    fn due_exactly_at_boundary() {
        let now = Utc::now();
        assert!(is_due(&source(Some(now - Duration::minutes(60))), now));
    }

    #[test]
    fn huge_interval_is_never_due() {
        let now = Utc::now();
        let mut s = source(Some(now - Duration::days(400)));
        s.fetch_interval_minutes = i64::MAX;
        assert!(s.interval().is_none());
        assert_eq!(s.next_fetch_at(), Some(DateTime::<Utc>::MAX_UTC));
        assert!(!is_due(&s, now));

        // Fits a TimeDelta but not the calendar.
        s.fetch_interval_minutes = i64::MAX / 60_000;
        assert!(!is_due(&s, now));

        s.last_fetch_time = None;
        assert!(is_due(&s, now));
    }

    #[test]
    fn interval_bounds() {
        assert!(validate_interval(1).is_ok());
        assert!(validate_interval(DEFAULT_FETCH_INTERVAL_MINUTES).is_ok());
        assert!(validate_interval(MAX_FETCH_INTERVAL_MINUTES).is_ok());
        assert!(validate_interval(0).is_err());
        assert!(validate_interval(-5).is_err());
        assert!(validate_interval(MAX_FETCH_INTERVAL_MINUTES + 1).is_err());
        assert!(validate_interval(i64::MAX).is_err());
    }
}
