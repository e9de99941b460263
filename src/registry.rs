//! Explicit command registration and dispatch.
//!
//! A [`CommandRegistry`] is built once at startup from
//! [`ConsumerDefinition`]s, each mapping command names to factories and
//! declaring which of them the consumer exposes. For every job the dispatcher
//! asks the registry for a fresh [`Consumer`], whose loaded-command set spans
//! the whole chain of remote calls made while running that job.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::{command::Command, error::QueueError};

pub type CommandFactory = Arc<dyn Fn(Value, Consumer) -> Box<dyn Command> + Send + Sync>;

type CommandKey = (String, String);

/// Commands one consumer knows how to build, and the subset it exposes.
#[derive(Clone)]
pub struct ConsumerDefinition {
    name: String,
    allowed: BTreeSet<String>,
    factories: HashMap<String, CommandFactory>,
}

impl ConsumerDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            allowed: BTreeSet::new(),
            factories: HashMap::new(),
        }
    }

    /// Add command names to the allow-list. Names outside it are rejected
    /// with [`QueueError::UnknownCommand`] before any lookup happens.
    pub fn allow<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed.extend(commands.into_iter().map(Into::into));
        self
    }

    /// Register the factory building `command`. Registration alone does not
    /// expose the command; see [`allow`](Self::allow).
    pub fn command<F, C>(mut self, command: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Value, Consumer) -> C + Send + Sync + 'static,
        C: Command + 'static,
    {
        let factory: CommandFactory =
            Arc::new(move |init, consumer| Box::new(factory(init, consumer)) as Box<dyn Command>);
        self.factories.insert(command.into(), factory);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allows(&self, command: &str) -> bool {
        self.allowed.contains(command)
    }

    pub fn allowed_commands(&self) -> impl Iterator<Item = &str> {
        self.allowed.iter().map(String::as_str)
    }
}

impl fmt::Debug for ConsumerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerDefinition")
            .field("name", &self.name)
            .field("allowed", &self.allowed)
            .field("factories", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Every consumer the process can run, plus read-only values shared with
/// all commands (correlation ids and the like).
#[derive(Debug, Default)]
pub struct CommandRegistry {
    consumers: HashMap<String, ConsumerDefinition>,
    globals: HashMap<String, Value>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, definition: ConsumerDefinition) -> Self {
        self.consumers
            .insert(definition.name.clone(), definition);
        self
    }

    pub fn with_global(mut self, key: impl Into<String>, value: Value) -> Self {
        self.globals.insert(key.into(), value);
        self
    }

    pub fn definition(&self, consumer_name: &str) -> Option<&ConsumerDefinition> {
        self.consumers.get(consumer_name)
    }

    pub fn consumer_names(&self) -> impl Iterator<Item = &str> {
        self.consumers.keys().map(String::as_str)
    }

    /// Instantiate `consumer_name` with an empty loaded-command set.
    pub fn consumer(self: &Arc<Self>, consumer_name: &str) -> Result<Consumer, QueueError> {
        if !self.consumers.contains_key(consumer_name) {
            return Err(QueueError::ConsumerNotFound(consumer_name.to_string()));
        }

        Ok(Consumer {
            inner: Arc::new(ConsumerState {
                name: consumer_name.to_string(),
                registry: Arc::clone(self),
                loaded: Mutex::new(HashSet::new()),
            }),
        })
    }
}

/// A live consumer instance. Cheap to clone; clones share the loaded-command
/// set, which is how recursion is caught across nested remote calls.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerState>,
}

struct ConsumerState {
    name: String,
    registry: Arc<CommandRegistry>,
    loaded: Mutex<HashSet<CommandKey>>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl Consumer {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn global(&self, key: &str) -> Option<&Value> {
        self.inner.registry.globals.get(key)
    }

    pub async fn is_loaded(&self, consumer_name: &str, command: &str) -> bool {
        let loaded = self.inner.loaded.lock().await;
        loaded.contains(&(consumer_name.to_string(), command.to_string()))
    }

    /// Build `command` of `consumer_name` and mark the pair as loaded. Fails
    /// with [`QueueError::RecursionDetected`] while the pair is still loaded.
    pub async fn resolve(
        &self,
        consumer_name: &str,
        command: &str,
        init: Value,
    ) -> Result<Box<dyn Command>, QueueError> {
        let registry = &self.inner.registry;
        let factory = registry
            .consumers
            .get(consumer_name)
            .ok_or_else(|| QueueError::ConsumerNotFound(consumer_name.to_string()))?
            .factories
            .get(command)
            .ok_or_else(|| QueueError::CommandNotFound {
                consumer: consumer_name.to_string(),
                command: command.to_string(),
            })?;

        let key = (consumer_name.to_string(), command.to_string());
        let mut loaded = self.inner.loaded.lock().await;
        if loaded.contains(&key) {
            return Err(QueueError::RecursionDetected {
                consumer: key.0,
                command: key.1,
            });
        }
        loaded.insert(key);
        drop(loaded);

        debug!(consumer = consumer_name, command, "loaded command");
        Ok(factory(init, self.clone()))
    }

    pub async fn evict(&self, consumer_name: &str, command: &str) {
        let mut loaded = self.inner.loaded.lock().await;
        loaded.remove(&(consumer_name.to_string(), command.to_string()));
    }

    /// Run `command` of this consumer for a job.
    #[instrument(skip_all, err, fields(consumer = %self.inner.name, command = %command))]
    pub async fn dispatch(&self, command: &str, payload: Value) -> Result<Value, QueueError> {
        let consumer_name = self.inner.name.clone();
        self.run(&consumer_name, command, payload, false).await
    }

    /// Synchronously run `command` of `consumer_name` on behalf of another
    /// command. The pair is evicted afterwards, so sequential calls to the
    /// same command succeed while a call back into a still running one fails.
    #[instrument(skip_all, err, fields(caller = %self.inner.name, consumer = %consumer_name, command = %command))]
    pub async fn invoke(
        &self,
        consumer_name: &str,
        command: &str,
        parameters: Value,
    ) -> Result<Value, QueueError> {
        self.run(consumer_name, command, parameters, true).await
    }

    async fn run(
        &self,
        consumer_name: &str,
        command: &str,
        parameters: Value,
        remote_call: bool,
    ) -> Result<Value, QueueError> {
        let definition = self
            .inner
            .registry
            .definition(consumer_name)
            .ok_or_else(|| QueueError::ConsumerNotFound(consumer_name.to_string()))?;
        if !definition.allows(command) {
            return Err(QueueError::UnknownCommand {
                consumer: consumer_name.to_string(),
                command: command.to_string(),
            });
        }

        let instance = self
            .resolve(consumer_name, command, parameters.clone())
            .await?;
        let result = instance.execute(parameters, remote_call).await;
        self.evict(consumer_name, command).await;
        result
    }
}
