use std::sync::Arc;

use serde_json::Value;

use crate::{
    error::QueueError,
    store::QueueStore,
    types::{Job, JobId, JobStatus},
};

/// A claimed job together with the store it came from. Consuming finalizers
/// make sure a job is settled exactly once.
pub struct JobHandle {
    store: Arc<dyn QueueStore>,
    job: Job,
}

impl JobHandle {
    pub(crate) fn new(store: Arc<dyn QueueStore>, job: Job) -> Self {
        Self { store, job }
    }

    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn consumer_name(&self) -> &str {
        &self.job.consumer_name
    }

    pub fn command(&self) -> &str {
        &self.job.command
    }

    pub fn payload(&self) -> &Value {
        &self.job.data
    }

    pub fn error_count(&self) -> u32 {
        self.job.error_count
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Refresh the lock before running the job.
    pub async fn lock(&self) -> Result<(), QueueError> {
        self.store.lock(self.job.id).await
    }

    /// Mark the job as done and drop it from the queue.
    pub async fn complete(self) -> Result<(), QueueError> {
        self.store.mark_status(self.job.id, JobStatus::Ok).await?;
        self.store.remove(self.job.id).await
    }

    /// Release the job for another attempt, counting one error.
    pub async fn fail(self, message: &str) -> Result<(), QueueError> {
        self.store.unlock(self.job.id).await?;
        self.store.increase_error(self.job.id, message, false).await
    }

    /// Release the job but exhaust its error budget. The row stays for
    /// inspection and is never claimed again.
    pub async fn abandon(self, message: &str) -> Result<(), QueueError> {
        self.store.unlock(self.job.id).await?;
        self.store.increase_error(self.job.id, message, true).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{queue::MemoryQueue, types::NewJob};

    async fn claimed() -> (Arc<dyn QueueStore>, JobHandle) {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryQueue::new());
        store
            .enqueue(NewJob::new("Example", "DoSomething", json!({"foo": "bar"})))
            .await
            .unwrap();
        let job = store.claim_next("").await.unwrap().unwrap();
        (Arc::clone(&store), JobHandle::new(store, job))
    }

    #[tokio::test]
    async fn complete_removes_the_job() {
        let (store, handle) = claimed().await;
        let id = handle.id();
        assert_eq!(handle.payload(), &json!({"foo": "bar"}));
        handle.complete().await.unwrap();
        assert!(store.get_job(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_unlocks_and_counts_one_error() {
        let (store, handle) = claimed().await;
        let id = handle.id();
        handle.fail("boom").await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert!(!job.is_locked());
        assert_eq!(job.error_count, 1);
        assert_eq!(job.last_error, "boom");
    }

    #[tokio::test]
    async fn abandon_exhausts_the_error_budget() {
        let (store, handle) = claimed().await;
        let id = handle.id();
        handle.abandon("gone").await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert!(!job.is_locked());
        assert_eq!(job.error_count, store.max_error_count() + 1);
        assert!(store.claim_next("").await.unwrap().is_none());
    }
}
