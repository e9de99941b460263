use std::time::Duration;

use thiserror::Error;

use crate::types::JobId;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("could not (de)serialize payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("could not load consumer {0}")]
    ConsumerNotFound(String),

    #[error("could not load command {command} of consumer {consumer}")]
    CommandNotFound { consumer: String, command: String },

    #[error("unknown command {command} for consumer {consumer}")]
    UnknownCommand { consumer: String, command: String },

    #[error("recursion detected: {consumer}/{command} is already loaded")]
    RecursionDetected { consumer: String, command: String },

    #[error("malformed job: {0}")]
    MalformedJob(String),

    #[error("job execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Execution(String),

    #[error("missing configuration: {0}")]
    MissingConfig(String),
}

impl QueueError {
    /// Shorthand for command implementations reporting a retryable failure.
    pub fn execution(message: impl Into<String>) -> Self {
        QueueError::Execution(message.into())
    }

    /// Consumer or command could not be located. Retrying cannot help, so
    /// the dispatcher exhausts the job's error budget and halts.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            QueueError::ConsumerNotFound(_) | QueueError::CommandNotFound { .. }
        )
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(value: sqlx::Error) -> Self {
        QueueError::Storage(value.to_string())
    }
}
