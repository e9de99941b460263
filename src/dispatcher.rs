use std::{sync::Arc, time::Duration};

use serde_json::Value;
use tracing::{error, info, instrument, warn};

use crate::{
    config::QueueConfig,
    error::QueueError,
    job_handle::JobHandle,
    registry::CommandRegistry,
    store::QueueStore,
    types::{Job, JobId},
};

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// The command succeeded and the job was removed.
    Completed { job_id: JobId, result: Value },
    /// The command failed; the job was unlocked for a later retry.
    Failed { job_id: JobId, error: String },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProcessSummary {
    pub completed: usize,
    pub failed: usize,
}

/// Single threaded polling loop. Run several of them, in one process or many,
/// against the same store to scale out; the store's atomic claim keeps them
/// from sharing a job.
pub struct JobConsumer {
    store: Arc<dyn QueueStore>,
    registry: Arc<CommandRegistry>,
    config: QueueConfig,
}

impl JobConsumer {
    pub fn new(
        store: Arc<dyn QueueStore>,
        registry: Arc<CommandRegistry>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    pub fn error_delay(&self) -> Duration {
        self.config.error_delay
    }

    /// Work through the queue until no job matching the configured filter
    /// can be claimed.
    ///
    /// Only fatal errors surface: a missing consumer or command, a job
    /// without id, or a failing store. Every other failure is recorded on
    /// the job and the loop moves on.
    pub async fn process_elements(&self) -> Result<ProcessSummary, QueueError> {
        if let Some(lock_timeout) = self.config.lock_timeout {
            let released = self.store.release_stale_locks(lock_timeout).await?;
            if released > 0 {
                warn!(released, ?lock_timeout, "released stale job locks");
            }
        }

        let mut summary = ProcessSummary::default();
        while let Some(outcome) = self.process_element(None).await? {
            match outcome {
                JobOutcome::Completed { .. } => summary.completed += 1,
                JobOutcome::Failed { .. } => summary.failed += 1,
            }
        }

        info!(completed = summary.completed, failed = summary.failed, "queue drained");
        Ok(summary)
    }

    /// Process `job`, or the next claimable one when `None` is given.
    /// Returns `None` once the queue is drained.
    #[instrument(skip_all, err, fields(job_id, consumer, command))]
    pub async fn process_element(&self, job: Option<Job>) -> Result<Option<JobOutcome>, QueueError> {
        let job = match job {
            Some(job) => job,
            None => match self.store.claim_next(&self.config.queue_filter).await? {
                Some(job) => job,
                None => return Ok(None),
            },
        };

        if !job.id.is_assigned() {
            return Err(QueueError::MalformedJob("no id in job".to_string()));
        }

        let span = tracing::Span::current();
        span.record("job_id", job.id.0);
        span.record("consumer", job.consumer_name.as_str());
        span.record("command", job.command.as_str());

        let handle = JobHandle::new(Arc::clone(&self.store), job);
        handle.lock().await?;

        let job_id = handle.id();
        match self.execute(&handle).await {
            Ok(result) => {
                handle.complete().await?;
                info!("job completed");
                Ok(Some(JobOutcome::Completed { job_id, result }))
            }
            Err(err) if err.is_not_found() => {
                error!(error = %err, "job cannot be run, giving up on it");
                handle.abandon(&err.to_string()).await?;
                Err(err)
            }
            Err(err) => {
                let message = err.to_string();
                warn!(error = %message, attempt = handle.error_count() + 1, "job failed");
                handle.fail(&message).await?;
                if !self.config.error_delay.is_zero() {
                    tokio::time::sleep(self.config.error_delay).await;
                }
                Ok(Some(JobOutcome::Failed {
                    job_id,
                    error: message,
                }))
            }
        }
    }

    async fn execute(&self, handle: &JobHandle) -> Result<Value, QueueError> {
        let consumer = self.registry.consumer(handle.consumer_name())?;
        let run = consumer.dispatch(handle.command(), handle.payload().clone());

        tokio::time::timeout(self.config.timeout, run)
            .await
            .map_err(|_| QueueError::Timeout(self.config.timeout))?
    }

    /// Drop expired jobs from the store.
    pub async fn collect_garbage(&self) -> Result<u64, QueueError> {
        self.store.garbage_collect().await
    }
}
