use async_trait::async_trait;
use serde_json::Value;

use crate::error::QueueError;

/// A unit of work a consumer exposes.
///
/// Instances are built by the factory registered for their
/// `(consumer, command)` pair, receiving their init parameters and a
/// [`Consumer`](crate::registry::Consumer) handle. Through that handle a
/// command may run another command synchronously with
/// [`Consumer::invoke`](crate::registry::Consumer::invoke).
#[async_trait]
pub trait Command: Send + Sync {
    /// `remote_call` is set when another command triggered this one through
    /// [`Consumer::invoke`](crate::registry::Consumer::invoke) rather than
    /// the dispatcher running it for a job.
    async fn execute(&self, parameter: Value, remote_call: bool) -> Result<Value, QueueError>;
}
