use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::QueueError,
    types::{Job, JobId, JobStatus, NewJob},
};

/// Persistence for one named job collection.
///
/// `claim_next` is the only operation with cross-row coordination: it must
/// select and lock a job in one atomic step so two pollers never both win the
/// same row. Every other mutation is scoped to a single row and succeeds
/// silently when that row no longer exists.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert a job and return its storage assigned id.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError>;

    /// Atomically claim the most recently created claimable job whose
    /// consumer name contains `filter`. An empty filter matches every job.
    async fn claim_next(&self, filter: &str) -> Result<Option<Job>, QueueError>;

    /// Set (or refresh) the lock timestamp.
    async fn lock(&self, job_id: JobId) -> Result<(), QueueError>;

    async fn unlock(&self, job_id: JobId) -> Result<(), QueueError>;

    async fn mark_status(&self, job_id: JobId, status: JobStatus) -> Result<(), QueueError>;

    /// Record a failed attempt. `last_error` always takes `message`; the
    /// error count grows by one, or is pushed past the maximum when `final_`
    /// is set so the job is never claimed again.
    async fn increase_error(
        &self,
        job_id: JobId,
        message: &str,
        final_: bool,
    ) -> Result<(), QueueError>;

    async fn remove(&self, job_id: JobId) -> Result<(), QueueError>;

    async fn error_count(&self, job_id: JobId) -> Result<u32, QueueError>;

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError>;

    async fn list_all(&self) -> Result<Vec<Job>, QueueError>;

    async fn list_by_consumer(&self, consumer_name: &str) -> Result<Vec<Job>, QueueError>;

    async fn list_by_command(&self, command: &str) -> Result<Vec<Job>, QueueError>;

    async fn update_payload(&self, job_id: JobId, payload: Value) -> Result<(), QueueError>;

    /// Delete every job whose expire date lies in the past, locked or not.
    /// Returns the number of removed rows.
    async fn garbage_collect(&self) -> Result<u64, QueueError>;

    /// Unlock jobs locked longer than `older_than` ago, left behind by a
    /// poller that died mid-job. Returns the number of released rows.
    async fn release_stale_locks(&self, older_than: Duration) -> Result<u64, QueueError>;

    /// Error count at which a job stops being claimable.
    fn max_error_count(&self) -> u32;
}

/// Oldest lock timestamp that still counts as live.
pub(crate) fn stale_lock_cutoff(
    older_than: Duration,
) -> Result<chrono::DateTime<chrono::Utc>, QueueError> {
    let older_than = chrono::Duration::from_std(older_than)
        .map_err(|e| QueueError::MissingConfig(format!("lock timeout out of range: {e}")))?;
    Ok(chrono::Utc::now() - older_than)
}

/// Error count stored by a final failure: past the maximum, never lower
/// than before.
pub(crate) fn final_error_count(current: u32, max_error_count: u32) -> u32 {
    current
        .saturating_add(1)
        .max(max_error_count.saturating_add(1))
}
