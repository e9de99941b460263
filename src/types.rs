use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::QueueError;

/// Storage assigned job identifier. Backends hand out ids starting at 1, so
/// the default (0) marks a job that was never persisted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    pub fn is_assigned(&self) -> bool {
        self.0 > 0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Only `New` and `Error` jobs can be claimed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    New,
    Error,
    Ok,
    Ignore,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::New => "new",
            JobStatus::Error => "error",
            JobStatus::Ok => "ok",
            JobStatus::Ignore => "ignore",
        }
    }

    pub fn is_claimable(&self) -> bool {
        matches!(self, JobStatus::New | JobStatus::Error)
    }
}

impl FromStr for JobStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(JobStatus::New),
            "error" => Ok(JobStatus::Error),
            "ok" => Ok(JobStatus::Ok),
            "ignore" => Ok(JobStatus::Ignore),
            other => Err(QueueError::MalformedJob(format!("invalid job status: {other}"))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub consumer_name: String,
    pub command: String,
    pub data: Value,
    pub status: JobStatus,
    pub locked_at: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub last_error: String,
    pub expire_date: Option<DateTime<Utc>>,
    pub date_created: DateTime<Utc>,
}

impl Job {
    pub fn is_locked(&self) -> bool {
        self.locked_at.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_date.is_some_and(|expire| expire < now)
    }

    /// Whether a poller filtering on `filter` may claim this job at `now`.
    pub fn is_claimable(&self, filter: &str, max_error_count: u32, now: DateTime<Utc>) -> bool {
        self.locked_at.is_none()
            && self.error_count < max_error_count
            && self.status.is_claimable()
            && self.expire_date.map_or(true, |expire| expire > now)
            && self.consumer_name.contains(filter)
    }
}

/// Everything a producer supplies when enqueueing. The store fills in the
/// rest of the row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub consumer_name: String,
    pub command: String,
    pub payload: Value,
    pub test_mode: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(consumer_name: impl Into<String>, command: impl Into<String>, payload: Value) -> Self {
        Self {
            consumer_name: consumer_name.into(),
            command: command.into(),
            payload,
            test_mode: false,
            expires_at: None,
        }
    }

    /// Test mode jobs are stored with status `ignore` and never claimed.
    pub fn test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub(crate) fn initial_status(&self) -> JobStatus {
        if self.test_mode {
            JobStatus::Ignore
        } else {
            JobStatus::New
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn job(consumer_name: &str) -> Job {
        Job {
            id: JobId(1),
            consumer_name: consumer_name.to_string(),
            command: "DoSomething".to_string(),
            data: json!({}),
            status: JobStatus::New,
            locked_at: None,
            error_count: 0,
            last_error: String::new(),
            expire_date: None,
            date_created: Utc::now(),
        }
    }

    #[test]
    fn status_round_trips_through_its_column_value() {
        for status in [JobStatus::New, JobStatus::Error, JobStatus::Ok, JobStatus::Ignore] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn claimability_follows_every_predicate() {
        let now = Utc::now();
        let base = job("Example");
        assert!(base.is_claimable("", 3, now));
        assert!(base.is_claimable("xam", 3, now));
        assert!(!base.is_claimable("xAm", 3, now));

        let locked = Job { locked_at: Some(now), ..base.clone() };
        assert!(!locked.is_claimable("", 3, now));

        let exhausted = Job { error_count: 3, ..base.clone() };
        assert!(!exhausted.is_claimable("", 3, now));

        let ignored = Job { status: JobStatus::Ignore, ..base.clone() };
        assert!(!ignored.is_claimable("", 3, now));

        let errored = Job { status: JobStatus::Error, ..base.clone() };
        assert!(errored.is_claimable("", 3, now));

        let expired = Job { expire_date: Some(now - Duration::seconds(1)), ..base.clone() };
        assert!(!expired.is_claimable("", 3, now));
        assert!(expired.is_expired(now));

        let fresh = Job { expire_date: Some(now + Duration::hours(1)), ..base };
        assert!(fresh.is_claimable("", 3, now));
    }

    #[test]
    fn default_job_id_is_unassigned() {
        assert!(!JobId::default().is_assigned());
        assert!(JobId(1).is_assigned());
    }
}
