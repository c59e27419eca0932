//! Plugin contracts.
//!
//! Every source, processor and sink adapter implements one of the traits of this module. The
//! orchestrator only ever depends on these traits, and concrete adapters are resolved once at
//! startup by the `PluginRegistry`.

mod registry;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::Span;

use crate::database::Database;
use crate::error::AppError;
use crate::models::{Message, StreamDefinition};
use crate::offsets::OffsetStore;
use crate::schema::{Schema, SchemaRegistry};

pub use registry::{PluginRegistry, ProcessorConstructor, SinkConstructor, SourceConstructor};

/// An individual event produced by a source.
///
/// An error on one event does not imply the event stream has ended.
pub type SourceEvent = Result<Message>;

/// The sending half of a channel over which plugins report fatal errors raised outside of any
/// orchestrator call, such as a failed background flush.
pub type FatalErrorTx = mpsc::UnboundedSender<anyhow::Error>;

/// The receiving half of a plugin fatal error channel, owned by the orchestrator.
pub type FatalErrorRx = mpsc::UnboundedReceiver<anyhow::Error>;

/// The shared context handed to every plugin constructor.
#[derive(Clone)]
pub struct PluginContext {
    /// The ID of the pipeline which owns the plugin.
    pub pipeline_id: u64,
    /// The span under which the plugin is to log.
    pub span: Span,
    /// The stream definitions declared for the pipeline's source.
    pub streams: Arc<Vec<StreamDefinition>>,
    /// The offset store available to polling sources.
    pub offsets: Arc<dyn OffsetStore>,
    /// The pipeline's embedded database, if storage is enabled.
    pub database: Option<Database>,
    /// A channel over which plugins report fatal background errors to the orchestrator.
    pub fatal_tx: FatalErrorTx,
    /// A channel used for triggering graceful shutdown.
    pub shutdown_tx: broadcast::Sender<()>,
}

impl PluginContext {
    /// Build a child span for the named component of this pipeline.
    pub fn component_span(&self, kind: &'static str, driver: &str) -> Span {
        tracing::info_span!(parent: &self.span, "plugin", kind, driver = %driver)
    }

    /// Get the declared definition of the named stream.
    pub fn stream(&self, name: &str) -> Option<&StreamDefinition> {
        self.streams.iter().find(|def| def.name == name)
    }
}

/// A source of change events.
#[async_trait]
pub trait Source: Send {
    /// Establish the source's connection to its upstream system.
    async fn connect(&mut self) -> Result<()>;

    /// Begin producing events.
    async fn start(&mut self) -> Result<()>;

    /// Take the source's event stream.
    ///
    /// The stream is continuously readable from `start` until `stop`, and may only be taken once.
    fn events(&mut self) -> Result<ReceiverStream<SourceEvent>>;

    /// Stop producing events.
    async fn stop(&mut self) -> Result<()>;
}

/// A transformation stage applied to every message in flight.
#[async_trait]
pub trait Processor: Send + Sync {
    /// The driver name of this processor.
    fn name(&self) -> &str;

    /// Declare this processor's schema changes.
    ///
    /// Called once per processor, in declared order, before any data flows. Every call must
    /// publish exactly one new version on the registry.
    fn evolve_schema(&mut self, registry: &mut SchemaRegistry) -> Result<()>;

    /// Process the given message.
    ///
    /// `Ok(None)` means the message was filtered out. Any error is fatal to the pipeline.
    async fn process(&self, msg: Message) -> Result<Option<Message>>;
}

/// The behavior the orchestrator applies when a sink write fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteFailurePolicy {
    /// Count the failure as a sink error and keep going.
    Continue,
    /// Terminate the pipeline.
    Fatal,
}

impl Default for WriteFailurePolicy {
    fn default() -> Self {
        Self::Continue
    }
}

/// A destination of change events.
#[async_trait]
pub trait Sink: Send {
    /// Establish the sink's connection to its downstream system.
    async fn connect(&mut self) -> Result<()>;

    /// Provision the sink for the given schema.
    ///
    /// Called exactly once, after schema evolution and before the first write.
    async fn set_expected_schema(&mut self, schema: Schema) -> Result<()>;

    /// Write the given message.
    ///
    /// Batching sinks must still return promptly, and surface flush failures on the call which
    /// triggered the flush.
    async fn write(&mut self, msg: Message) -> Result<()>;

    /// Stop the sink.
    async fn stop(&mut self) -> Result<()>;

    /// How the orchestrator is to treat a failed write on this sink.
    fn write_failure_policy(&self) -> WriteFailurePolicy {
        WriteFailurePolicy::Continue
    }
}

/// Decode a driver's config blob, using the config's default when no blob was given.
pub fn decode_config<T: DeserializeOwned + Default>(driver: &str, config: serde_yaml::Value) -> Result<T> {
    if config.is_null() {
        return Ok(T::default());
    }
    serde_yaml::from_value(config).map_err(|err| AppError::Config(format!("invalid config for driver {}: {}", driver, err)).into())
}
