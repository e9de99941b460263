use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::{
    config::QueueConfig,
    error::QueueError,
    store::{final_error_count, stale_lock_cutoff, QueueStore},
    types::{Job, JobId, JobStatus, NewJob},
};

/// In-process queue. Claims happen under the map's write lock, which makes
/// select-and-lock a single atomic step for every poller sharing the queue.
#[derive(Clone)]
pub struct MemoryQueue {
    jobs: Arc<RwLock<HashMap<JobId, Job>>>,
    next_id: Arc<AtomicI64>,
    max_error_count: u32,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_max_error_count(QueueConfig::default().max_error_count)
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::with_max_error_count(config.max_error_count)
    }

    pub fn with_max_error_count(max_error_count: u32) -> Self {
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicI64::new(1)),
            max_error_count,
        }
    }

    /// Newest first, ties broken by the higher id.
    fn sorted(mut jobs: Vec<Job>) -> Vec<Job> {
        jobs.sort_by(|a, b| {
            b.date_created
                .cmp(&a.date_created)
                .then_with(|| b.id.cmp(&a.id))
        });
        jobs
    }

    async fn update<F>(&self, job_id: JobId, f: F)
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&job_id) {
            f(job);
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for MemoryQueue {
    #[instrument(skip_all, err, ret, fields(consumer = %job.consumer_name, command = %job.command))]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, QueueError> {
        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let status = job.initial_status();

        let mut jobs = self.jobs.write().await;
        jobs.insert(
            id,
            Job {
                id,
                consumer_name: job.consumer_name,
                command: job.command,
                data: job.payload,
                status,
                locked_at: None,
                error_count: 0,
                last_error: String::new(),
                expire_date: job.expires_at,
                date_created: Utc::now(),
            },
        );

        Ok(id)
    }

    #[instrument(skip_all, err, fields(filter = %filter))]
    async fn claim_next(&self, filter: &str) -> Result<Option<Job>, QueueError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;

        let job = jobs
            .values_mut()
            .filter(|j| j.is_claimable(filter, self.max_error_count, now))
            .max_by(|a, b| {
                a.date_created
                    .cmp(&b.date_created)
                    .then_with(|| a.id.cmp(&b.id))
            });

        if let Some(job) = job {
            job.locked_at = Some(now);
            Ok(Some(job.clone()))
        } else {
            Ok(None)
        }
    }

    #[instrument(skip_all, err, fields(job_id = %job_id))]
    async fn lock(&self, job_id: JobId) -> Result<(), QueueError> {
        self.update(job_id, |job| job.locked_at = Some(Utc::now()))
            .await;
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %job_id))]
    async fn unlock(&self, job_id: JobId) -> Result<(), QueueError> {
        self.update(job_id, |job| job.locked_at = None).await;
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %job_id, status = %status))]
    async fn mark_status(&self, job_id: JobId, status: JobStatus) -> Result<(), QueueError> {
        self.update(job_id, |job| job.status = status).await;
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %job_id, final_ = final_))]
    async fn increase_error(
        &self,
        job_id: JobId,
        message: &str,
        final_: bool,
    ) -> Result<(), QueueError> {
        let max_error_count = self.max_error_count;
        self.update(job_id, |job| {
            job.error_count = if final_ {
                final_error_count(job.error_count, max_error_count)
            } else {
                job.error_count.saturating_add(1)
            };
            job.last_error = message.to_string();
        })
        .await;
        Ok(())
    }

    #[instrument(skip_all, err, fields(job_id = %job_id))]
    async fn remove(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write().await;
        jobs.remove(&job_id);
        Ok(())
    }

    async fn error_count(&self, job_id: JobId) -> Result<u32, QueueError> {
        let jobs = self.jobs.read().await;
        jobs.get(&job_id)
            .map(|job| job.error_count)
            .ok_or(QueueError::JobNotFound(job_id))
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<Job>, QueueError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(&job_id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<Job>, QueueError> {
        let jobs = self.jobs.read().await;
        Ok(Self::sorted(jobs.values().cloned().collect()))
    }

    async fn list_by_consumer(&self, consumer_name: &str) -> Result<Vec<Job>, QueueError> {
        let jobs = self.jobs.read().await;
        Ok(Self::sorted(
            jobs.values()
                .filter(|j| j.consumer_name == consumer_name)
                .cloned()
                .collect(),
        ))
    }

    async fn list_by_command(&self, command: &str) -> Result<Vec<Job>, QueueError> {
        let jobs = self.jobs.read().await;
        Ok(Self::sorted(
            jobs.values()
                .filter(|j| j.command == command)
                .cloned()
                .collect(),
        ))
    }

    #[instrument(skip_all, err, fields(job_id = %job_id))]
    async fn update_payload(&self, job_id: JobId, payload: Value) -> Result<(), QueueError> {
        self.update(job_id, |job| job.data = payload).await;
        Ok(())
    }

    #[instrument(skip_all, err, ret)]
    async fn garbage_collect(&self) -> Result<u64, QueueError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| !job.is_expired(now));
        Ok((before - jobs.len()) as u64)
    }

    #[instrument(skip_all, err, ret)]
    async fn release_stale_locks(&self, older_than: Duration) -> Result<u64, QueueError> {
        let cutoff = stale_lock_cutoff(older_than)?;
        let mut jobs = self.jobs.write().await;

        let mut released = 0;
        for job in jobs.values_mut() {
            if job.locked_at.is_some_and(|locked_at| locked_at < cutoff) {
                job.locked_at = None;
                released += 1;
            }
        }

        Ok(released)
    }

    fn max_error_count(&self) -> u32 {
        self.max_error_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_spec;

    #[tokio::test]
    async fn memory_queue_satisfies_queue_spec() {
        let _ = tracing_subscriber::fmt::try_init();
        queue_spec::run_all(|| async { MemoryQueue::with_max_error_count(3) }).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn clones_share_the_same_jobs() {
        let queue = MemoryQueue::new();
        let other = queue.clone();
        let id = queue
            .enqueue(NewJob::new("Example", "DoSomething", Value::Null))
            .await
            .unwrap();

        let claimed = other.claim_next("").await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert!(queue.claim_next("").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_pollers_never_share_a_job() {
        let queue = MemoryQueue::new();
        for i in 0..50 {
            queue
                .enqueue(NewJob::new("Example", "DoSomething", Value::from(i)))
                .await
                .unwrap();
        }

        let mut pollers = Vec::new();
        for _ in 0..8 {
            let queue = queue.clone();
            pollers.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = queue.claim_next("").await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for poller in pollers {
            all.extend(poller.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 50);
    }
}
