//! A source polling a JSON lines file.
//!
//! Every complete line of the file is one event. The byte offset just past the last handled
//! line is kept in the offset store, so a restarted source resumes where it left off, and every
//! poll only reads what was appended since. A trailing line without a newline is considered
//! incomplete and is picked up by a later poll.
//!
//! Values are decoded by the declared type of their column. A line with a value which does not
//! conform to its column, or without a value for a non-nullable column, is a source event error.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Span;

use crate::error::AppError;
use crate::models::{EventKind, Field, Message, StreamDefinition, Value};
use crate::offsets::OffsetStore;
use crate::plugins::{decode_config, PluginContext, Source, SourceEvent};
use crate::utils;

/// The JSON key naming the event kind of a line.
const EVENT_KEY: &str = "event";

/// Config of the jsonl source.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct JsonlConfig {
    /// The path of the file to poll.
    pub path: String,
    /// The stream to which all lines belong.
    pub stream: String,
    /// The interval in milliseconds between polls of the file.
    pub poll_interval_ms: u64,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            stream: String::new(),
            poll_interval_ms: 1000,
        }
    }
}

/// The jsonl source.
pub struct JsonlSource {
    config: JsonlConfig,
    span: Span,
    offset_key: String,
    offsets: Arc<dyn OffsetStore>,
    stream: Option<StreamDefinition>,
    events_tx: Option<mpsc::Sender<SourceEvent>>,
    events_rx: Option<mpsc::Receiver<SourceEvent>>,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl JsonlSource {
    /// Create a new instance.
    pub fn new(ctx: &PluginContext, config: serde_yaml::Value) -> Result<Self> {
        let config: JsonlConfig = decode_config("jsonl", config)?;
        if config.path.is_empty() || config.stream.is_empty() {
            bail!(AppError::Config("jsonl source requires both path and stream".into()));
        }
        if config.poll_interval_ms == 0 {
            bail!(AppError::Config("jsonl poll_interval_ms must be greater than 0".into()));
        }
        let (events_tx, events_rx) = mpsc::channel(100);
        Ok(Self {
            span: ctx.component_span("source", "jsonl"),
            offset_key: utils::offset_key(ctx.pipeline_id, &config.stream),
            offsets: ctx.offsets.clone(),
            stream: ctx.stream(&config.stream).cloned(),
            config,
            events_tx: Some(events_tx),
            events_rx: Some(events_rx),
            stop_tx: None,
            handle: None,
        })
    }
}

#[async_trait]
impl Source for JsonlSource {
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_none() {
            bail!(AppError::Config(format!("jsonl source stream {} is not declared", self.config.stream)));
        }
        tokio::fs::metadata(&self.config.path)
            .await
            .map_err(|err| AppError::Connection(format!("can not open {}: {}", self.config.path, err)))?;
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let (events_tx, stream) = match (self.events_tx.take(), self.stream.clone()) {
            (Some(events_tx), Some(stream)) => (events_tx, stream),
            _ => bail!("jsonl source must be connected and may only be started once"),
        };
        let offset = self.offsets.get(&self.offset_key).await.context("error fetching jsonl source offset")?.unwrap_or(0);
        tracing::debug!(parent: &self.span, offset, path = %self.config.path, "jsonl source resuming from offset");

        let (stop_tx, stop_rx) = oneshot::channel();
        let poller = Poller {
            config: self.config.clone(),
            span: self.span.clone(),
            stream,
            offset_key: self.offset_key.clone(),
            offsets: self.offsets.clone(),
            offset,
            events_tx,
        };
        self.stop_tx = Some(stop_tx);
        self.handle = Some(tokio::spawn(poller.run(stop_rx)));
        Ok(())
    }

    fn events(&mut self) -> Result<ReceiverStream<SourceEvent>> {
        match self.events_rx.take() {
            Some(rx) => Ok(ReceiverStream::new(rx)),
            None => bail!("jsonl source events have already been taken"),
        }
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _res = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _res = handle.await;
        }
        Ok(())
    }
}

/// The task polling the file.
struct Poller {
    config: JsonlConfig,
    span: Span,
    stream: StreamDefinition,
    offset_key: String,
    offsets: Arc<dyn OffsetStore>,
    /// The byte offset of the first unhandled line.
    offset: u64,
    events_tx: mpsc::Sender<SourceEvent>,
}

impl Poller {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.poll().await {
                        Ok(true) => (),
                        Ok(false) => break,
                        Err(err) => tracing::error!(parent: &self.span, error = ?err, "error polling jsonl source"),
                    }
                }
                _ = &mut stop_rx => break,
            }
        }
        tracing::debug!(parent: &self.span, offset = self.offset, "jsonl source has stopped");
    }

    /// Emit all complete lines past the current offset.
    ///
    /// Returns `false` once the event channel has closed.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn poll(&mut self) -> Result<bool> {
        let mut file = tokio::fs::File::open(&self.config.path)
            .await
            .with_context(|| format!("error opening {}", self.config.path))?;
        file.seek(SeekFrom::Start(self.offset)).await.context("error seeking to jsonl source offset")?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .await
            .with_context(|| format!("error reading {}", self.config.path))?;
        let complete = match buf.iter().rposition(|byte| *byte == b'\n') {
            Some(idx) => &buf[..=idx],
            None => return Ok(true),
        };

        for line in complete.split_inclusive(|byte| *byte == b'\n') {
            let event = match std::str::from_utf8(line) {
                Ok(text) if text.trim().is_empty() => None,
                Ok(text) => Some(self.decode_line(text)),
                Err(_) => Some(Err(AppError::SourceEvent(format!("line at offset {} is not valid UTF-8", self.offset)).into())),
            };
            if let Some(event) = event {
                if self.events_tx.send(event).await.is_err() {
                    return Ok(false);
                }
            }
            self.offset += line.len() as u64;
            self.offsets.set(&self.offset_key, self.offset).await.context("error recording jsonl source offset")?;
        }
        Ok(true)
    }

    /// Decode the line at the current offset into a message of the configured stream.
    fn decode_line(&self, line: &str) -> SourceEvent {
        let offset = self.offset;
        let mut doc = match serde_json::from_str::<serde_json::Value>(line) {
            Ok(serde_json::Value::Object(doc)) => doc,
            Ok(_) => bail!(AppError::SourceEvent(format!("line at offset {} is not a JSON object", offset))),
            Err(err) => bail!(AppError::SourceEvent(format!("line at offset {} is not valid JSON: {}", offset, err))),
        };
        let event = match doc.remove(EVENT_KEY) {
            None => EventKind::Insert,
            Some(val) => serde_json::from_value(val)
                .map_err(|err| AppError::SourceEvent(format!("line at offset {} has an invalid event kind: {}", offset, err)))?,
        };

        let mut fields = Vec::with_capacity(self.stream.columns.len());
        for col in self.stream.columns.iter() {
            let value = match doc.get(&col.name) {
                Some(json) => Value::from_json_typed(json, col.logical_type)
                    .map_err(|err| AppError::SourceEvent(format!("line at offset {} column {}: {:#}", offset, col.name, err)))?,
                None => Value::Null,
            };
            if value == Value::Null && !col.nullable {
                bail!(AppError::SourceEvent(format!("line at offset {} has no value for non-nullable column {}", offset, col.name)));
            }
            fields.push(Field::new(col.name.clone(), value));
        }
        let mut msg = Message::new(&self.stream.name, event, fields);
        msg.set_meta("offset", offset.to_string());
        Ok(msg)
    }
}
