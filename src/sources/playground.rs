//! A source generating synthetic rows for every declared stream.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::prelude::*;
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Span;

use crate::error::AppError;
use crate::models::{Column, EventKind, Field, LogicalType, Message, StreamDefinition, Value};
use crate::plugins::{decode_config, PluginContext, Source, SourceEvent};

const DESTINATIONS: [&str; 6] = ["SFO", "LAX", "JFK", "SEA", "ORD", "ATL"];

/// Config of the playground source.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PlaygroundConfig {
    /// The number of snapshot rows to emit per stream before live inserts begin.
    pub historical_batch: u64,
    /// The interval in milliseconds between live inserts.
    pub publish_interval_ms: u64,
    /// Stop after emitting this many live inserts.
    pub max_events: Option<u64>,
}

impl Default for PlaygroundConfig {
    fn default() -> Self {
        Self {
            historical_batch: 0,
            publish_interval_ms: 1000,
            max_events: None,
        }
    }
}

/// The playground source.
pub struct PlaygroundSource {
    config: PlaygroundConfig,
    span: Span,
    streams: Arc<Vec<StreamDefinition>>,
    events_tx: Option<mpsc::Sender<SourceEvent>>,
    events_rx: Option<mpsc::Receiver<SourceEvent>>,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PlaygroundSource {
    /// Create a new instance.
    pub fn new(ctx: &PluginContext, config: serde_yaml::Value) -> Result<Self> {
        let config: PlaygroundConfig = decode_config("playground", config)?;
        if config.publish_interval_ms == 0 {
            bail!(AppError::Config("playground publish_interval_ms must be greater than 0".into()));
        }
        let (events_tx, events_rx) = mpsc::channel(100);
        Ok(Self {
            config,
            span: ctx.component_span("source", "playground"),
            streams: ctx.streams.clone(),
            events_tx: Some(events_tx),
            events_rx: Some(events_rx),
            stop_tx: None,
            handle: None,
        })
    }
}

#[async_trait]
impl Source for PlaygroundSource {
    async fn connect(&mut self) -> Result<()> {
        if self.streams.is_empty() {
            bail!(AppError::Config("playground source requires at least one declared stream".into()));
        }
        Ok(())
    }

    async fn start(&mut self) -> Result<()> {
        let events_tx = match self.events_tx.take() {
            Some(events_tx) => events_tx,
            None => bail!("playground source has already been started"),
        };
        let (stop_tx, stop_rx) = oneshot::channel();
        let generator = Generator {
            config: self.config.clone(),
            span: self.span.clone(),
            streams: self.streams.clone(),
            events_tx,
            seq: 0,
        };
        self.stop_tx = Some(stop_tx);
        self.handle = Some(tokio::spawn(generator.run(stop_rx)));
        Ok(())
    }

    fn events(&mut self) -> Result<ReceiverStream<SourceEvent>> {
        match self.events_rx.take() {
            Some(rx) => Ok(ReceiverStream::new(rx)),
            None => bail!("playground source events have already been taken"),
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

/// The task generating rows.
struct Generator {
    config: PlaygroundConfig,
    span: Span,
    streams: Arc<Vec<StreamDefinition>>,
    events_tx: mpsc::Sender<SourceEvent>,
    /// A counter used for the values of integer primary keys.
    seq: i64,
}

impl Generator {
    async fn run(mut self, mut stop_rx: oneshot::Receiver<()>) {
        tracing::debug!(parent: &self.span, historical_batch = self.config.historical_batch, "playground source has started");
        let streams = self.streams.clone();
        if streams.is_empty() {
            return;
        }
        for def in streams.iter() {
            for _ in 0..self.config.historical_batch {
                let msg = self.generate(def, EventKind::Snapshot);
                if self.events_tx.send(Ok(msg)).await.is_err() {
                    return;
                }
            }
        }

        let mut interval = tokio::time::interval(Duration::from_millis(self.config.publish_interval_ms));
        interval.tick().await;
        let (mut emitted, mut stream_idx) = (0u64, 0usize);
        loop {
            if self.config.max_events.map(|max| emitted >= max).unwrap_or(false) {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    let def = &streams[stream_idx % streams.len()];
                    let msg = self.generate(def, EventKind::Insert);
                    if self.events_tx.send(Ok(msg)).await.is_err() {
                        break;
                    }
                    emitted += 1;
                    stream_idx += 1;
                }
                _ = &mut stop_rx => break,
            }
        }
        tracing::debug!(parent: &self.span, emitted, "playground source has stopped");
    }

    /// Generate a row conforming to the given stream definition.
    fn generate(&mut self, def: &StreamDefinition, event: EventKind) -> Message {
        self.seq += 1;
        let fields = def.columns.iter().map(|col| Field::new(col.name.clone(), self.generate_value(col))).collect();
        Message::new(&def.name, event, fields)
    }

    fn generate_value(&self, col: &Column) -> Value {
        let mut rng = rand::thread_rng();
        match col.logical_type {
            LogicalType::Int if col.is_primary_key => Value::Int(self.seq),
            LogicalType::String if col.is_primary_key => Value::String(format!("{}-{}", col.name, self.seq)),
            LogicalType::Bool => Value::Bool(rng.gen()),
            LogicalType::Int => Value::Int(rng.gen_range(0..10_000)),
            LogicalType::Float => Value::Float(rng.gen_range(0.0..1000.0)),
            LogicalType::String => Value::String(DESTINATIONS[rng.gen_range(0..DESTINATIONS.len())].into()),
            LogicalType::Binary => Value::Bytes((0..8).map(|_| rng.gen()).collect()),
            LogicalType::Date => Value::Date(OffsetDateTime::now_utc().date()),
            LogicalType::Timestamp => Value::Timestamp(OffsetDateTime::now_utc()),
            LogicalType::Nested => Value::Struct(vec![("seq".into(), Value::Int(self.seq))]),
            LogicalType::List => Value::List(vec![Value::Int(self.seq)]),
        }
    }
}

#[cfg(test)]
mod test {
    use futures::stream::StreamExt;

    use super::*;
    use crate::fixtures;

    #[tokio::test(start_paused = true)]
    async fn emits_snapshot_rows_then_inserts() -> Result<()> {
        let streams = vec![StreamDefinition::new(
            "flights",
            vec![Column::new("flight_id", LogicalType::Int).primary_key(), Column::new("destination", LogicalType::String)],
        )];
        let ctx = fixtures::plugin_context(streams.clone());
        let config = serde_yaml::from_str("{historical_batch: 2, publish_interval_ms: 10, max_events: 2}")?;
        let mut source = PlaygroundSource::new(&ctx, config)?;
        source.connect().await?;
        let events = source.events()?;

        source.start().await?;
        let msgs = events.collect::<Vec<_>>().await.into_iter().collect::<Result<Vec<_>>>();
        source.stop().await?;

        let msgs = msgs?;
        let kinds: Vec<_> = msgs.iter().map(|msg| msg.event()).collect();
        let ids: Vec<_> = msgs.iter().filter_map(|msg| msg.get("flight_id").cloned()).collect();
        assert!(
            kinds == vec![EventKind::Snapshot, EventKind::Snapshot, EventKind::Insert, EventKind::Insert],
            "unexpected event kinds {:?}",
            kinds
        );
        assert!(ids == (1..=4).map(Value::Int).collect::<Vec<_>>(), "unexpected primary keys {:?}", ids);
        assert!(
            msgs.iter().all(|msg| msg.fields().iter().zip(&streams[0].columns).all(|(field, col)| field.value.conforms_to(col.logical_type))),
            "generated values must conform to the declared column types"
        );
        Ok(())
    }
}
