use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::Span;

use crate::metrics::PipelineMetrics;
use crate::models::{Message, StreamDefinition};
use crate::offsets::InMemoryOffsetStore;
use crate::plugins::{PluginContext, Processor, Sink, Source, SourceEvent, WriteFailurePolicy};
use crate::schema::{Schema, SchemaRegistry};

/// Build a plugin context for the given streams, backed by in-memory offsets and no storage.
pub fn plugin_context(streams: Vec<StreamDefinition>) -> PluginContext {
    let (shutdown_tx, _) = broadcast::channel(1);
    let (fatal_tx, _) = mpsc::unbounded_channel();
    PluginContext {
        pipeline_id: 1,
        span: Span::none(),
        streams: Arc::new(streams),
        offsets: Arc::new(InMemoryOffsetStore::default()),
        database: None,
        fatal_tx,
        shutdown_tx,
    }
}

/// A source emitting a fixed set of events once started, then closing its event stream.
pub struct MockSource {
    events: Vec<SourceEvent>,
    tx: Option<mpsc::Sender<SourceEvent>>,
    rx: Option<mpsc::Receiver<SourceEvent>>,
    /// A sender kept once started, so the event stream stays open until stopped.
    held: Option<mpsc::Sender<SourceEvent>>,
    pub fail_connect: bool,
    /// Keep the event stream open after all events were emitted.
    pub hold_open: bool,
}

impl MockSource {
    pub fn new(events: Vec<SourceEvent>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        Self {
            events,
            tx: Some(tx),
            rx: Some(rx),
            held: None,
            fail_connect: false,
            hold_open: false,
        }
    }
}

#[async_trait]
impl Source for MockSource {
    async fn connect(&mut self) -> Result<()> {
        if self.fail_connect {
            bail!(crate::error::AppError::Connection("mock source connect failure".into()));
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or_else(|| anyhow!("mock source already started"))?;
        let events = std::mem::take(&mut self.events);
        if self.hold_open {
            self.held = Some(tx.clone());
        }
        tokio::spawn(async move {
            for event in events {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    fn events(&mut self) -> Result<ReceiverStream<SourceEvent>> {
        self.rx.take().map(ReceiverStream::new).ok_or_else(|| anyhow!("mock source events already taken"))
    }

    async fn stop(&mut self) -> Result<()> {
        self.held = None;
        Ok(())
    }
}

/// The observations of a mock sink.
#[derive(Default)]
pub struct SinkRecord {
    pub schema: Option<Schema>,
    pub writes: Vec<Message>,
    pub stopped: bool,
}

/// A sink recording everything it is handed.
pub struct MockSink {
    pub record: Arc<Mutex<SinkRecord>>,
    /// Fail writes of messages on this stream.
    pub fail_stream: Option<String>,
    pub policy: WriteFailurePolicy,
}

impl MockSink {
    pub fn recording() -> (Self, Arc<Mutex<SinkRecord>>) {
        let record = Arc::new(Mutex::new(SinkRecord::default()));
        let sink = Self {
            record: record.clone(),
            fail_stream: None,
            policy: WriteFailurePolicy::Continue,
        };
        (sink, record)
    }
}

#[async_trait]
impl Sink for MockSink {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn set_expected_schema(&mut self, schema: Schema) -> Result<()> {
        self.record.lock().map_err(|_| anyhow!("record lock poisoned"))?.schema = Some(schema);
        Ok(())
    }

    async fn write(&mut self, msg: Message) -> Result<()> {
        if self.fail_stream.as_deref() == Some(msg.stream()) {
            bail!(crate::error::AppError::Write("mock sink write failure".into()));
        }
        self.record.lock().map_err(|_| anyhow!("record lock poisoned"))?.writes.push(msg);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.record.lock().map_err(|_| anyhow!("record lock poisoned"))?.stopped = true;
        Ok(())
    }

    fn write_failure_policy(&self) -> WriteFailurePolicy {
        self.policy
    }
}

/// The runtime behavior of a mock processor.
#[derive(Clone, Debug)]
pub enum MockBehavior {
    /// Pass every message through.
    Pass,
    /// Drop messages whose stream has the given name.
    DropStream(String),
    /// Fail on messages whose stream has the given name.
    FailStream(String),
    /// Add a field to the given stream, both in the schema and on every message.
    AddField(String, String),
}

/// A processor with scripted behavior, recording the IDs of the messages it observes.
pub struct MockProcessor {
    pub behavior: MockBehavior,
    pub seen: Arc<Mutex<Vec<uuid::Uuid>>>,
}

impl MockProcessor {
    pub fn recording(behavior: MockBehavior) -> (Self, Arc<Mutex<Vec<uuid::Uuid>>>) {
        let seen = Arc::new(Mutex::new(vec![]));
        (Self { behavior, seen: seen.clone() }, seen)
    }
}

#[async_trait]
impl Processor for MockProcessor {
    fn name(&self) -> &str {
        "mock"
    }

    fn evolve_schema(&mut self, registry: &mut SchemaRegistry) -> Result<()> {
        match &self.behavior {
            MockBehavior::AddField(stream, name) => registry.add_field(stream, name, crate::models::LogicalType::String, None),
            _ => registry.fake_evolve(),
        };
        Ok(())
    }

    async fn process(&self, mut msg: Message) -> Result<Option<Message>> {
        self.seen.lock().map_err(|_| anyhow!("seen lock poisoned"))?.push(msg.id());
        match &self.behavior {
            MockBehavior::Pass => Ok(Some(msg)),
            MockBehavior::DropStream(stream) if stream == msg.stream() => Ok(None),
            MockBehavior::FailStream(stream) if stream == msg.stream() => bail!("mock processor failure"),
            MockBehavior::AddField(stream, name) if stream == msg.stream() => {
                msg.set_field(name, "mock");
                Ok(Some(msg))
            }
            _ => Ok(Some(msg)),
        }
    }
}

/// A metrics implementation recording counts in memory.
#[derive(Default)]
pub struct RecordingMetrics {
    counters: Mutex<HashMap<String, u64>>,
    registered: Mutex<Vec<String>>,
}

impl RecordingMetrics {
    /// Get the value of the named counter, optionally scoped to a processor.
    pub fn count(&self, name: &str, processor: Option<&str>) -> u64 {
        let key = Self::key(name, processor);
        self.counters.lock().map(|counters| counters.get(&key).copied().unwrap_or(0)).unwrap_or(0)
    }

    /// The processor labels registered at startup.
    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().map(|labels| labels.clone()).unwrap_or_default()
    }

    fn key(name: &str, processor: Option<&str>) -> String {
        match processor {
            Some(processor) => format!("{}/{}", name, processor),
            None => name.to_string(),
        }
    }

    fn incr(&self, name: &str, processor: Option<&str>) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(Self::key(name, processor)).or_default() += 1;
        }
    }
}

impl PipelineMetrics for RecordingMetrics {
    fn register_processors(&self, processors: &[String]) {
        if let Ok(mut registered) = self.registered.lock() {
            registered.extend(processors.iter().cloned());
        }
    }

    fn increment_received(&self) {
        self.incr("received", None);
    }

    fn increment_sent(&self) {
        self.incr("sent", None);
    }

    fn increment_source_errors(&self) {
        self.incr("source_errors", None);
    }

    fn increment_sink_errors(&self) {
        self.incr("sink_errors", None);
    }

    fn increment_processor_received(&self, processor: &str) {
        self.incr("processor_received", Some(processor));
    }

    fn increment_processor_sent(&self, processor: &str) {
        self.incr("processor_sent", Some(processor));
    }

    fn increment_processor_dropped(&self, processor: &str) {
        self.incr("processor_dropped", Some(processor));
    }

    fn observe_processor_execution(&self, processor: &str, _: Duration) {
        self.incr("processor_execution", Some(processor));
    }
}
