use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::{
    error::QueueError,
    store::QueueStore,
    types::{JobId, NewJob},
};

/// Enqueues jobs. A producer without a store is a configuration mistake the
/// caller can detect: every add returns `Ok(None)`.
#[derive(Clone, Default)]
pub struct JobProducer {
    store: Option<Arc<dyn QueueStore>>,
}

impl JobProducer {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store: Some(store) }
    }

    pub fn is_configured(&self) -> bool {
        self.store.is_some()
    }

    pub async fn add_job<T: Serialize>(
        &self,
        consumer_name: &str,
        command: &str,
        payload: T,
        test_mode: bool,
    ) -> Result<Option<JobId>, QueueError> {
        let payload = serde_json::to_value(payload)?;
        self.add(NewJob::new(consumer_name, command, payload).test_mode(test_mode))
            .await
    }

    pub async fn add(&self, job: NewJob) -> Result<Option<JobId>, QueueError> {
        let Some(store) = &self.store else {
            warn!(
                consumer = %job.consumer_name,
                command = %job.command,
                "no job storage configured, job dropped"
            );
            return Ok(None);
        };

        store.enqueue(job).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use serde::Serialize;
    use serde_json::json;

    use super::*;
    use crate::{queue::MemoryQueue, types::JobStatus};

    #[derive(Serialize)]
    struct Greeting {
        to: String,
    }

    #[tokio::test]
    async fn add_job_stores_a_new_job() {
        let store = Arc::new(MemoryQueue::new());
        let producer = JobProducer::new(store.clone());

        let id = producer
            .add_job("Example", "DoSomething", Greeting { to: "world".into() }, false)
            .await
            .unwrap()
            .unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::New);
        assert_eq!(job.data, json!({"to": "world"}));
    }

    #[tokio::test]
    async fn test_mode_jobs_are_ignored() {
        let store = Arc::new(MemoryQueue::new());
        let producer = JobProducer::new(store.clone());

        let id = producer
            .add_job("Example", "DoSomething", json!({}), true)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.get_job(id).await.unwrap().unwrap().status, JobStatus::Ignore);
        assert!(store.claim_next("").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expiring_jobs_carry_their_expire_date() {
        let store = Arc::new(MemoryQueue::new());
        let producer = JobProducer::new(store.clone());
        let expires = Utc::now() + Duration::days(1);

        let id = producer
            .add(NewJob::new("Example", "DoSomething", json!({})).expires_at(expires))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(store.get_job(id).await.unwrap().unwrap().expire_date, Some(expires));
    }

    #[tokio::test]
    async fn producer_without_store_returns_none() {
        let producer = JobProducer::default();
        assert!(!producer.is_configured());
        assert_eq!(
            producer
                .add_job("Example", "DoSomething", json!({}), false)
                .await
                .unwrap(),
            None
        );
    }
}
