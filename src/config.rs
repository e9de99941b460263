use std::{str::FromStr, time::Duration};

use serde::Deserialize;

use crate::error::QueueError;

/// Settings shared by the stores, the producer and the dispatcher.
///
/// Deserializes with per-field defaults, so a host application can embed it
/// in its own configuration file and only override what it needs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Table (or collection) holding the jobs.
    pub queue_name: String,
    /// Jobs whose error count reaches this value are no longer claimed.
    pub max_error_count: u32,
    /// Upper bound for a single command execution.
    #[serde(with = "seconds")]
    pub timeout: Duration,
    /// Pause after a retryable failure before polling again.
    #[serde(with = "seconds")]
    pub error_delay: Duration,
    /// Substring a job's consumer name must contain to be claimed. Matching
    /// is case-sensitive.
    pub queue_filter: String,
    /// Locks older than this are released before each processing run.
    #[serde(with = "optional_seconds")]
    pub lock_timeout: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: "jobQueue".to_string(),
            max_error_count: 3,
            timeout: Duration::from_secs(30),
            error_delay: Duration::ZERO,
            queue_filter: String::new(),
            lock_timeout: None,
        }
    }
}

impl QueueConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                     | Default    |
    /// |-----------------------------|------------|
    /// | `JOBQUEUE_NAME`             | `jobQueue` |
    /// | `JOBQUEUE_MAX_ERROR_COUNT`  | `3`        |
    /// | `JOBQUEUE_TIMEOUT_SECS`     | `30`       |
    /// | `JOBQUEUE_ERROR_DELAY_SECS` | `0`        |
    /// | `JOBQUEUE_FILTER`           | (empty)    |
    /// | `JOBQUEUE_LOCK_TIMEOUT_SECS`| (unset)    |
    pub fn from_env() -> Result<Self, QueueError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, QueueError> {
        let defaults = Self::default();

        let queue_name = lookup("JOBQUEUE_NAME").unwrap_or(defaults.queue_name);
        if queue_name.trim().is_empty() {
            return Err(QueueError::MissingConfig(
                "JOBQUEUE_NAME must not be empty".to_string(),
            ));
        }

        let max_error_count =
            parse_var(&lookup, "JOBQUEUE_MAX_ERROR_COUNT")?.unwrap_or(defaults.max_error_count);
        let timeout = parse_var(&lookup, "JOBQUEUE_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);
        let error_delay = parse_var(&lookup, "JOBQUEUE_ERROR_DELAY_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.error_delay);
        let queue_filter = lookup("JOBQUEUE_FILTER").unwrap_or(defaults.queue_filter);
        let lock_timeout =
            parse_var(&lookup, "JOBQUEUE_LOCK_TIMEOUT_SECS")?.map(Duration::from_secs);

        Ok(Self {
            queue_name,
            max_error_count,
            timeout,
            error_delay,
            queue_filter,
            lock_timeout,
        })
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, QueueError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| QueueError::MissingConfig(format!("{key} must be a non-negative integer, got {raw:?}"))),
        None => Ok(None),
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod optional_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
