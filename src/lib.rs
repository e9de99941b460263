//! A durable job queue without a broker process.
//!
//! Producers store jobs addressed to a consumer and one of its commands.
//! Workers running a [`JobConsumer`](dispatcher::JobConsumer) poll the shared
//! store, claim one job at a time, run the command through a
//! [`CommandRegistry`](registry::CommandRegistry) and either remove the job or
//! record the failure for a later retry. Delivery is at least once, so
//! commands should be idempotent.

pub mod command;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod job_handle;
pub mod producer;
pub mod queue;
pub mod registry;
pub mod sqlite;
pub mod store;
pub mod types;

/// Shared test specifications for [`QueueStore`](store::QueueStore) backends.
/// Enable the `testing` feature to run them against an outside backend.
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod queue_spec;

/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::{
        command::Command,
        config::QueueConfig,
        dispatcher::{JobConsumer, JobOutcome, ProcessSummary},
        error::QueueError,
        job_handle::JobHandle,
        producer::JobProducer,
        queue::MemoryQueue,
        registry::{CommandRegistry, Consumer, ConsumerDefinition},
        sqlite::SqliteQueue,
        store::QueueStore,
        types::{Job, JobId, JobStatus, NewJob},
    };
    pub use serde_json::Value;
}
