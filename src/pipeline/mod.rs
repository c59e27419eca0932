//! Pipeline orchestrator.
//!
//! ## Lifecycle
//! A pipeline starts out `Starting`. Loading builds the schema registry from the declared
//! streams, lets every processor evolve it in declared order, connects the source and sink, and
//! hands the final schema to the sink, after which the pipeline is `Loaded`. Running starts the
//! source, at which point the pipeline is `Started`. Any fatal error moves it to `Failing`.
//!
//! ## Ordering
//! One task forwards source events into a bounded delivery queue, and the pipeline controller
//! drains that queue one message at a time through the processor chain and into the sink. No
//! stage reorders or parallelizes across messages, so every stream is written in source order.

#[cfg(test)]
mod mod_test;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tracing::Span;

use crate::error::AppError;
use crate::manifest::PipelineSpec;
use crate::metrics::PipelineMetrics;
use crate::models::{Message, StreamDefinition};
use crate::plugins::{FatalErrorRx, PluginContext, PluginRegistry, Processor, Sink, Source, SourceEvent, WriteFailurePolicy};
use crate::schema::SchemaRegistry;

/// The default capacity of the delivery queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// The lifecycle state of a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipelineState {
    Starting,
    Loaded,
    Started,
    Failing,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Loaded => "loaded",
            Self::Started => "started",
            Self::Failing => "failing",
        };
        f.write_str(name)
    }
}

/// A pipeline controller wiring a source through a processor chain into a sink.
pub struct Pipeline {
    /// The ID of this pipeline.
    id: u64,
    /// The span under which this pipeline logs.
    span: Span,
    /// The stream definitions declared for the source.
    streams: Vec<StreamDefinition>,

    source: Box<dyn Source>,
    processors: Vec<Box<dyn Processor>>,
    /// Per processor metric labels, formatted as `{index}_{name}`.
    labels: Vec<String>,
    sink: Box<dyn Sink>,
    metrics: Arc<dyn PipelineMetrics>,

    /// The schema registry, available once loaded.
    registry: Option<SchemaRegistry>,
    /// The current state of this pipeline.
    state: PipelineState,
    /// A channel publishing state transitions.
    state_tx: watch::Sender<PipelineState>,
    /// The capacity of the delivery queue.
    queue_capacity: usize,

    /// A channel of fatal errors raised by plugins outside of any pipeline call.
    fatal_rx: FatalErrorRx,
    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl Pipeline {
    /// Create a new instance.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64, span: Span, streams: Vec<StreamDefinition>, source: Box<dyn Source>, processors: Vec<Box<dyn Processor>>, sink: Box<dyn Sink>,
        metrics: Arc<dyn PipelineMetrics>, queue_capacity: usize, fatal_rx: FatalErrorRx, shutdown_tx: broadcast::Sender<()>,
    ) -> (Self, watch::Receiver<PipelineState>) {
        let (state_tx, state_rx) = watch::channel(PipelineState::Starting);
        let labels = processors.iter().enumerate().map(|(idx, proc)| format!("{}_{}", idx, proc.name())).collect();
        let pipeline = Self {
            id,
            span,
            streams,
            source,
            processors,
            labels,
            sink,
            metrics,
            registry: None,
            state: PipelineState::Starting,
            state_tx,
            queue_capacity: queue_capacity.max(1),
            fatal_rx,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
        };
        (pipeline, state_rx)
    }

    /// Build a pipeline from the given manifest, resolving all drivers through the given registry.
    ///
    /// The given fatal error channel must be the receiving half of the context's `fatal_tx`.
    pub fn from_spec(
        spec: &PipelineSpec, plugins: &PluginRegistry, ctx: &PluginContext, metrics: Arc<dyn PipelineMetrics>, queue_capacity: usize,
        fatal_rx: FatalErrorRx,
    ) -> Result<(Self, watch::Receiver<PipelineState>)> {
        let source = plugins.build_source(&spec.source, ctx).context("error building source")?;
        let processors = spec
            .processors
            .iter()
            .enumerate()
            .map(|(idx, proc)| plugins.build_processor(proc, ctx).with_context(|| format!("error building processor {}", idx)))
            .collect::<Result<Vec<_>>>()?;
        let sink = plugins.build_sink(&spec.sink, ctx).context("error building sink")?;
        Ok(Self::new(
            spec.service.pipeline_id,
            ctx.span.clone(),
            spec.service.stream_schema.clone(),
            source,
            processors,
            sink,
            metrics,
            queue_capacity,
            fatal_rx,
            ctx.shutdown_tx.clone(),
        ))
    }

    /// The current state of this pipeline.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// The schema registry of this pipeline, available once loaded.
    pub fn registry(&self) -> Option<&SchemaRegistry> {
        self.registry.as_ref()
    }

    /// Evolve the schema and connect the source and sink.
    ///
    /// Any error is fatal and leaves the pipeline `Failing`.
    pub async fn load(&mut self) -> Result<()> {
        if let Err(err) = self.try_load().await {
            tracing::error!(parent: &self.span, error = ?err, "error loading pipeline {}", self.id);
            self.set_state(PipelineState::Failing);
            return Err(err);
        }
        self.set_state(PipelineState::Loaded);
        Ok(())
    }

    async fn try_load(&mut self) -> Result<()> {
        let mut registry = SchemaRegistry::new(self.streams.clone(), self.span.clone());
        for (processor, label) in self.processors.iter_mut().zip(self.labels.iter()) {
            processor
                .evolve_schema(&mut registry)
                .with_context(|| format!("error evolving schema for processor {}", label))?;
        }
        self.source.connect().await.context("error connecting source")?;
        self.sink.connect().await.context("error connecting sink")?;
        self.sink
            .set_expected_schema(registry.current())
            .await
            .context("error setting sink expected schema")?;
        self.metrics.register_processors(&self.labels);
        tracing::debug!(parent: &self.span, version = registry.current_version(), "pipeline schema finalized");
        self.registry = Some(registry);
        Ok(())
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let loaded = match self.state {
            PipelineState::Starting => self.load().await,
            PipelineState::Failing => Err(anyhow!("pipeline {} failed to load", self.id)),
            PipelineState::Loaded | PipelineState::Started => Ok(()),
        };
        if let Err(err) = loaded {
            let _ = self.shutdown_tx.send(());
            return Err(err);
        }
        tracing::debug!(parent: &self.span, "pipeline {} has started", self.id);

        let res = self.run_loop().await;
        if let Err(err) = &res {
            tracing::error!(parent: &self.span, error = ?err, "pipeline {} failed", self.id);
            self.set_state(PipelineState::Failing);
        }

        // Begin shutdown routine.
        if let Err(err) = self.source.stop().await {
            tracing::error!(parent: &self.span, error = ?err, "error stopping source");
        }
        if let Err(err) = self.sink.stop().await {
            tracing::error!(parent: &self.span, error = ?err, "error stopping sink");
        }
        let _ = self.shutdown_tx.send(());
        tracing::debug!(parent: &self.span, "pipeline {} has shutdown", self.id);
        res
    }

    async fn run_loop(&mut self) -> Result<()> {
        let events = self.source.events().context("error taking source events")?;
        self.source.start().await.context("error starting source")?;
        let (queue_tx, queue_rx) = mpsc::channel(self.queue_capacity);
        let forwarder = tokio::spawn(forward_events(events, queue_tx));
        self.set_state(PipelineState::Started);

        let mut queue = ReceiverStream::new(queue_rx);
        let mut fatal_open = true;
        let res = loop {
            tokio::select! {
                event_opt = queue.next() => match event_opt {
                    Some(event) => {
                        if let Err(err) = self.handle_event(event).await {
                            break Err(err);
                        }
                    }
                    None => {
                        tracing::debug!(parent: &self.span, "source event stream closed");
                        break Ok(());
                    }
                },
                err_opt = self.fatal_rx.recv(), if fatal_open => match err_opt {
                    Some(err) => break Err(err.context("fatal error reported by plugin")),
                    None => fatal_open = false,
                },
                _ = self.shutdown_rx.next() => break Ok(()),
            }
        };
        forwarder.abort();
        res
    }

    /// Handle a single source event, taking it through the processor chain and into the sink.
    #[tracing::instrument(level = "trace", skip(self, event))]
    async fn handle_event(&mut self, event: SourceEvent) -> Result<()> {
        let mut msg = match event {
            Ok(msg) => msg,
            Err(err) => {
                self.metrics.increment_source_errors();
                tracing::warn!(parent: &self.span, error = ?err, "error event received from source");
                return Ok(());
            }
        };
        self.metrics.increment_received();

        for (processor, label) in self.processors.iter().zip(self.labels.iter()) {
            self.metrics.increment_processor_received(label);
            let start = Instant::now();
            let res = processor.process(msg).await;
            self.metrics.observe_processor_execution(label, start.elapsed());
            msg = match res {
                Ok(Some(next)) => {
                    self.metrics.increment_processor_sent(label);
                    next
                }
                Ok(None) => {
                    self.metrics.increment_processor_dropped(label);
                    return Ok(());
                }
                Err(source) => {
                    return Err(AppError::Processing {
                        processor: label.clone(),
                        source,
                    }
                    .into())
                }
            };
        }

        self.write(msg).await
    }

    async fn write(&mut self, msg: Message) -> Result<()> {
        let id = msg.id();
        match self.sink.write(msg).await {
            Ok(()) => {
                self.metrics.increment_sent();
                Ok(())
            }
            Err(err) => {
                self.metrics.increment_sink_errors();
                tracing::error!(parent: &self.span, error = ?err, %id, "error writing message to sink");
                // Errors outside of the write taxonomy, such as a lost connection, are always fatal.
                let fatal = err.downcast_ref::<AppError>().map(AppError::is_fatal).unwrap_or(false);
                match (fatal, self.sink.write_failure_policy()) {
                    (false, WriteFailurePolicy::Continue) => Ok(()),
                    _ => Err(err.context("fatal sink write failure")),
                }
            }
        }
    }

    fn set_state(&mut self, state: PipelineState) {
        if self.state == state {
            return;
        }
        tracing::info!(parent: &self.span, from = %self.state, to = %state, "pipeline {} state transition", self.id);
        self.state = state;
        let _ = self.state_tx.send(state);
    }
}

/// Forward source events into the delivery queue until either side closes.
async fn forward_events(mut events: ReceiverStream<SourceEvent>, queue_tx: mpsc::Sender<SourceEvent>) {
    while let Some(event) = events.next().await {
        if queue_tx.send(event).await.is_err() {
            break;
        }
    }
}
