//! Configuration types.
//!
//! Everything is read from `FEEDFLOW_*` environment variables. Missing or
//! unparsable values fall back to the defaults below.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveTime;
use secrecy::SecretString;
use tracing::warn;

use crate::error::ConfigError;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Parse an `HH:MM` time of day.
pub fn parse_time_of_day(value: &str) -> Result<NaiveTime, ConfigError> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|e| ConfigError::InvalidValue {
        key: "time of day".to_string(),
        message: format!("expected HH:MM, got {value:?}: {e}"),
    })
}

/// Source scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on concurrently running fetch tasks.
    pub max_fetch_workers: usize,
    /// Loop granularity.
    pub tick: Duration,
    /// Due sources are evaluated once every this many ticks.
    pub eval_every_ticks: u32,
    /// Local time of day after which the daily maintenance task runs.
    pub maintenance_time: NaiveTime,
    /// Wait after a failed maintenance run before trying again.
    pub maintenance_retry: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_fetch_workers: 10,
            tick: Duration::from_secs(1),
            eval_every_ticks: 10,
            maintenance_time: NaiveTime::MIN,
            maintenance_retry: Duration::from_secs(15 * 60),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let maintenance_time = match env_nonempty("FEEDFLOW_MAINTENANCE_TIME") {
            Some(raw) => parse_time_of_day(&raw).unwrap_or_else(|e| {
                warn!("{e}; using 00:00");
                NaiveTime::MIN
            }),
            None => defaults.maintenance_time,
        };

        Self {
            max_fetch_workers: env_parse::<usize>("FEEDFLOW_MAX_FETCH_WORKERS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_fetch_workers),
            tick: env_parse::<u64>("FEEDFLOW_TICK_MS")
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.tick),
            eval_every_ticks: env_parse::<u32>("FEEDFLOW_EVAL_EVERY_TICKS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.eval_every_ticks),
            maintenance_time,
            maintenance_retry: env_parse::<u64>("FEEDFLOW_MAINTENANCE_RETRY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.maintenance_retry),
        }
    }
}

/// Retry and polling behaviour of one worker loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failed attempts after which an item is marked Failed.
    pub max_retries: u32,
    /// Pause between attempts on the same item.
    pub backoff: Duration,
    /// Pause after finding the queue empty.
    pub idle_poll: Duration,
    /// Upper bound on a single processing call.
    pub process_timeout: Duration,
    /// Processing items untouched for this long may be claimed again.
    pub stale_after: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_secs(5),
            idle_poll: Duration::from_secs(5),
            process_timeout: Duration::from_secs(300),
            stale_after: None,
        }
    }
}

impl RetryPolicy {
    /// Text summarization: long calls, slow retries.
    pub fn for_summarize() -> Self {
        Self::default()
    }

    /// Image analysis: shorter calls, quick retries, lazier polling.
    pub fn for_vision() -> Self {
        Self {
            backoff: Duration::from_secs(1),
            idle_poll: Duration::from_secs(10),
            process_timeout: Duration::from_secs(120),
            ..Self::default()
        }
    }

    /// Shortest stale window that cannot catch a live holder. A holder
    /// touches its item at least once per attempt plus backoff; the window
    /// is twice that to absorb store latency.
    pub fn min_stale_after(&self) -> Duration {
        (self.process_timeout + self.backoff) * 2
    }

    /// Raise `stale_after` to `min_stale_after()` when it is set lower.
    pub fn normalized(mut self) -> Self {
        if let Some(stale) = self.stale_after {
            let floor = self.min_stale_after();
            if stale < floor {
                warn!(
                    ?stale,
                    ?floor,
                    "stale_after is shorter than an attempt plus backoff, raising it"
                );
                self.stale_after = Some(floor);
            }
        }
        self
    }

    /// Apply `{prefix}_MAX_RETRIES`, `_BACKOFF_SECS`, `_IDLE_SECS`,
    /// `_TIMEOUT_SECS` and `_STALE_AFTER_SECS` overrides on top of `self`.
    pub fn with_env_overrides(self, prefix: &str) -> Self {
        let secs = |suffix: &str| env_parse::<u64>(&format!("{prefix}_{suffix}")).map(Duration::from_secs);

        Self {
            max_retries: env_parse(&format!("{prefix}_MAX_RETRIES")).unwrap_or(self.max_retries),
            backoff: secs("BACKOFF_SECS").unwrap_or(self.backoff),
            idle_poll: secs("IDLE_SECS").unwrap_or(self.idle_poll),
            process_timeout: secs("TIMEOUT_SECS")
                .filter(|d| !d.is_zero())
                .unwrap_or(self.process_timeout),
            stale_after: match secs("STALE_AFTER_SECS") {
                Some(d) if d.is_zero() => None,
                Some(d) => Some(d),
                None => self.stale_after,
            },
        }
    }
}

/// Process-wide configuration for the binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub scheduler: SchedulerConfig,
    pub summarize: RetryPolicy,
    pub vision: RetryPolicy,
    /// Summarization endpoint. Without it the summarize worker is not started.
    pub summarizer_url: Option<String>,
    /// Image analysis endpoint. Without it the vision worker is not started.
    pub vision_url: Option<String>,
    /// Daily maintenance hook. Without it no daily task is scheduled.
    pub maintenance_url: Option<String>,
    /// Bearer token sent to the processing endpoints.
    pub api_key: Option<SecretString>,
    /// Timeout of a single feed download.
    pub fetch_timeout: Duration,
    /// Pause between cycles of the sequential runner.
    pub sequential_pause: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("./data/feedflow.db"),
            scheduler: SchedulerConfig::default(),
            summarize: RetryPolicy::for_summarize(),
            vision: RetryPolicy::for_vision(),
            summarizer_url: None,
            vision_url: None,
            maintenance_url: None,
            api_key: None,
            fetch_timeout: Duration::from_secs(30),
            sequential_pause: Duration::from_secs(60),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            database_path: env_nonempty("FEEDFLOW_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            scheduler: SchedulerConfig::from_env(),
            summarize: RetryPolicy::for_summarize().with_env_overrides("FEEDFLOW_SUMMARIZE"),
            vision: RetryPolicy::for_vision().with_env_overrides("FEEDFLOW_ANALYZE_IMAGE"),
            summarizer_url: env_nonempty("FEEDFLOW_SUMMARIZER_URL"),
            vision_url: env_nonempty("FEEDFLOW_VISION_URL"),
            maintenance_url: env_nonempty("FEEDFLOW_MAINTENANCE_URL"),
            api_key: env_nonempty("FEEDFLOW_PROCESSOR_API_KEY").map(SecretString::from),
            fetch_timeout: env_parse::<u64>("FEEDFLOW_FETCH_TIMEOUT_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            sequential_pause: env_parse::<u64>("FEEDFLOW_SEQUENTIAL_PAUSE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.sequential_pause),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_of_day_parsing() {
        assert_eq!(
            parse_time_of_day("03:30").unwrap(),
            NaiveTime::from_hms_opt(3, 30, 0).unwrap()
        );
        assert_eq!(parse_time_of_day(" 23:59 ").unwrap().format("%H:%M").to_string(), "23:59");
        assert!(parse_time_of_day("25:00").is_err());
        assert!(parse_time_of_day("noon").is_err());
    }

    #[test]
    fn queue_policies_differ() {
        let summarize = RetryPolicy::for_summarize();
        let vision = RetryPolicy::for_vision();
        assert_eq!(summarize.max_retries, 3);
        assert_eq!(vision.max_retries, 3);
        assert_eq!(summarize.process_timeout, Duration::from_secs(300));
        assert_eq!(vision.backoff, Duration::from_secs(1));
        assert_eq!(vision.idle_poll, Duration::from_secs(10));
        assert!(summarize.stale_after.is_none());
    }

    #[test]
    fn retry_overrides_from_env() {
        // Prefix is unique to this test so parallel tests don't collide.
        unsafe {
            std::env::set_var("FEEDFLOW_TEST_OVERRIDE_MAX_RETRIES", "5");
            std::env::set_var("FEEDFLOW_TEST_OVERRIDE_STALE_AFTER_SECS", "600");
            std::env::set_var("FEEDFLOW_TEST_OVERRIDE_BACKOFF_SECS", "not-a-number");
        }
        let policy = RetryPolicy::default().with_env_overrides("FEEDFLOW_TEST_OVERRIDE");
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.stale_after, Some(Duration::from_secs(600)));
        assert_eq!(policy.backoff, Duration::from_secs(5));
    }

    #[test]
    fn short_stale_window_is_raised() {
        let policy = RetryPolicy {
            stale_after: Some(Duration::from_secs(60)),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.min_stale_after(), Duration::from_secs(610));
        assert_eq!(policy.normalized().stale_after, Some(Duration::from_secs(610)));

        let long = RetryPolicy {
            stale_after: Some(Duration::from_secs(3600)),
            ..RetryPolicy::default()
        };
        assert_eq!(long.normalized().stale_after, Some(Duration::from_secs(3600)));
        assert_eq!(RetryPolicy::default().normalized().stale_after, None);
    }

    #[test]
    fn scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_fetch_workers, 10);
        assert_eq!(config.tick, Duration::from_secs(1));
        assert_eq!(config.eval_every_ticks, 10);
        assert_eq!(config.maintenance_time, NaiveTime::MIN);
        assert_eq!(config.maintenance_retry, Duration::from_secs(900));
    }
}
