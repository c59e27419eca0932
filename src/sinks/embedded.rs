//! A sink which materializes streams into the pipeline's embedded database.
//!
//! Each stream is stored in its own tree, keyed by the stream's primary key with the row's
//! fields encoded as a JSON object. Snapshot rows are bulk-loaded through the batch writer, and
//! each bulk load is applied as a single atomic batch.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::Span;

use crate::database::{Database, Tree};
use crate::error::AppError;
use crate::models::{EventKind, Message};
use crate::plugins::{decode_config, FatalErrorTx, PluginContext, Sink, WriteFailurePolicy};
use crate::schema::Schema;
use crate::sinks::batch::{BatchConfig, BatchTarget, BatchWriter};

const EVENT_KINDS: [EventKind; 4] = [EventKind::Insert, EventKind::Update, EventKind::Delete, EventKind::Snapshot];

/// Config of the sled sink.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SledSinkConfig {
    /// The number of buffered snapshot rows which triggers a bulk load.
    pub max_batch_size: usize,
    /// The maximum time in milliseconds a snapshot row may stay buffered.
    pub flush_interval_ms: u64,
    /// Treat a failed live row write as fatal to the pipeline.
    pub fail_on_write_error: bool,
}

impl Default for SledSinkConfig {
    fn default() -> Self {
        let batch = BatchConfig::default();
        Self {
            max_batch_size: batch.max_batch_size,
            flush_interval_ms: batch.flush_interval.as_millis() as u64,
            fail_on_write_error: false,
        }
    }
}

/// A pre-generated write statement of a stream and event kind.
#[derive(Clone)]
enum Statement {
    /// Insert or overwrite the row under its key.
    Upsert { tree: Tree, key_column: String },
    /// Remove the row under its key.
    Delete { tree: Tree, key_column: String },
}

impl Statement {
    fn tree(&self) -> &Tree {
        match self {
            Self::Upsert { tree, .. } | Self::Delete { tree, .. } => tree,
        }
    }

    fn key_column(&self) -> &str {
        match self {
            Self::Upsert { key_column, .. } | Self::Delete { key_column, .. } => key_column,
        }
    }
}

/// The sled sink.
pub struct SledSink {
    config: SledSinkConfig,
    span: Span,
    db: Option<Database>,
    fatal_tx: FatalErrorTx,
    shutdown_tx: broadcast::Sender<()>,
    writer: Option<BatchWriter>,
}

impl SledSink {
    /// Create a new instance.
    pub fn new(ctx: &PluginContext, config: serde_yaml::Value) -> Result<Self> {
        let config = decode_config("sled", config)?;
        Ok(Self {
            config,
            span: ctx.component_span("sink", "sled"),
            db: ctx.database.clone(),
            fatal_tx: ctx.fatal_tx.clone(),
            shutdown_tx: ctx.shutdown_tx.clone(),
            writer: None,
        })
    }

    /// Generate one statement per stream and event kind of the given schema.
    async fn generate_statements(db: &Database, schema: &Schema) -> Result<HashMap<(String, EventKind), Statement>> {
        let mut statements = HashMap::new();
        for def in schema.streams() {
            let key_column = match def.primary_key() {
                Some(col) => col.name.clone(),
                None => bail!(AppError::Schema(format!("stream {} has no primary key, which the sled sink requires", def.name))),
            };
            let tree = db.get_sink_tree(&def.name).await?;
            for event in EVENT_KINDS {
                let (tree, key_column) = (tree.clone(), key_column.clone());
                let stmt = match event {
                    EventKind::Delete => Statement::Delete { tree, key_column },
                    EventKind::Insert | EventKind::Update | EventKind::Snapshot => Statement::Upsert { tree, key_column },
                };
                statements.insert((def.name.clone(), event), stmt);
            }
        }
        Ok(statements)
    }
}

#[async_trait]
impl Sink for SledSink {
    async fn connect(&mut self) -> Result<()> {
        if self.db.is_none() {
            bail!(AppError::Connection("sled sink requires pipeline storage to be enabled".into()));
        }
        Ok(())
    }

    async fn set_expected_schema(&mut self, schema: Schema) -> Result<()> {
        let db = self
            .db
            .as_ref()
            .ok_or_else(|| AppError::Connection("sled sink is not connected".into()))?;
        let statements = Self::generate_statements(db, &schema).await?;
        tracing::debug!(parent: &self.span, version = schema.version(), statements = statements.len(), "sled sink statements prepared");

        let config = BatchConfig {
            max_batch_size: self.config.max_batch_size,
            flush_interval: Duration::from_millis(self.config.flush_interval_ms),
        };
        self.writer = Some(BatchWriter::new(SledTarget { statements }, config, self.span.clone(), self.fatal_tx.clone(), &self.shutdown_tx));
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn write(&mut self, msg: Message) -> Result<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| AppError::Write("sled sink received a write before its schema".into()))?;
        writer.write(msg).await.map_err(|err| AppError::Write(format!("{:#}", err)).into())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.stop().await?;
        }
        Ok(())
    }

    fn write_failure_policy(&self) -> WriteFailurePolicy {
        if self.config.fail_on_write_error {
            WriteFailurePolicy::Fatal
        } else {
            WriteFailurePolicy::Continue
        }
    }
}

/// The batch target of the sled sink.
struct SledTarget {
    statements: HashMap<(String, EventKind), Statement>,
}

impl SledTarget {
    fn statement(&self, stream: &str, event: EventKind) -> Result<&Statement> {
        self.statements
            .get(&(stream.to_string(), event))
            .ok_or_else(|| AppError::Write(format!("no statement for stream {} and event {}", stream, event)).into())
    }
}

/// Build the storage key of the given row.
fn row_key(key_column: &str, msg: &Message) -> Result<Vec<u8>> {
    match msg.get(key_column) {
        Some(val) if val.logical_type().is_some() => Ok(val.to_json().to_string().into_bytes()),
        _ => bail!(AppError::Write(format!("message {} is missing primary key {}", msg.id(), key_column))),
    }
}

/// Encode the fields of the given row.
fn row_value(msg: &Message) -> Result<Vec<u8>> {
    serde_json::to_vec(&msg.to_json()).context("error encoding row as JSON")
}

#[async_trait]
impl BatchTarget for SledTarget {
    async fn flush_snapshot(&mut self, stream: &str, rows: &[Message]) -> Result<()> {
        let stmt = self.statement(stream, EventKind::Snapshot)?;
        let mut batch = sled::Batch::default();
        for row in rows {
            batch.insert(row_key(stmt.key_column(), row)?, row_value(row)?);
        }
        let tree = stmt.tree().clone();
        Database::spawn_blocking(move || -> Result<()> {
            tree.apply_batch(batch).context("error applying snapshot batch")?;
            tree.flush().context("error flushing snapshot batch")?;
            Ok(())
        })
        .await?
    }

    async fn write_row(&mut self, msg: &Message) -> Result<()> {
        let stmt = self.statement(msg.stream(), msg.event())?.clone();
        let key = row_key(stmt.key_column(), msg)?;
        let value = match &stmt {
            Statement::Upsert { .. } => Some(row_value(msg)?),
            Statement::Delete { .. } => None,
        };
        Database::spawn_blocking(move || -> Result<()> {
            let tree = stmt.tree();
            match value {
                Some(value) => tree.insert(key, value).context("error upserting row")?,
                None => tree.remove(key).context("error deleting row")?,
            };
            tree.flush().context("error flushing row write")?;
            Ok(())
        })
        .await?
    }
}
