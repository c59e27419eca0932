//! Snapshot-aware batch writer.
//!
//! Sinks which bulk-load a backfill snapshot embed a `BatchWriter`. Snapshot rows are buffered
//! per stream and flushed in bulk when the batch is full, when the flush interval elapses, when a
//! different stream begins, or when live events begin. Live events bypass the buffer entirely.
//!
//! The writer is a single actor task which exclusively owns the buffer and the flush deadline.
//! Writes are commands answered over a oneshot channel, and the flush deadline is a branch of
//! the same select loop, so a size triggered flush and a timer triggered flush never overlap.
//!
//! A failed timer triggered flush has no caller to report to. It is reported to the orchestrator
//! over the plugin fatal error channel, and every later write or stop returns the same failure.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::{BroadcastStream, ReceiverStream};
use tracing::Span;

use crate::models::{EventKind, Message};
use crate::plugins::FatalErrorTx;

const DEFAULT_MAX_BATCH_SIZE: usize = 1000;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// The downstream target of a batch writer.
#[async_trait]
pub trait BatchTarget: Send + 'static {
    /// Write all of the given snapshot rows of the given stream in one bulk operation.
    async fn flush_snapshot(&mut self, stream: &str, rows: &[Message]) -> Result<()>;

    /// Write a single live event.
    async fn write_row(&mut self, msg: &Message) -> Result<()>;
}

/// Batch writer settings.
#[derive(Clone, Copy, Debug)]
pub struct BatchConfig {
    /// The number of buffered snapshot rows which triggers a flush.
    pub max_batch_size: usize,
    /// The maximum time a snapshot row may stay buffered.
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// A handle to a batch writer actor.
pub struct BatchWriter {
    tx: mpsc::Sender<BatchCommand>,
    handle: JoinHandle<Result<()>>,
}

impl BatchWriter {
    /// Spawn a new batch writer over the given target.
    pub fn new<T: BatchTarget>(target: T, config: BatchConfig, span: Span, fatal_tx: FatalErrorTx, shutdown_tx: &broadcast::Sender<()>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let ctl = BatchWriterCtl {
            target,
            config,
            span,
            buffer: Vec::with_capacity(config.max_batch_size),
            active_stream: None,
            last_event: None,
            deadline: None,
            failure: None,
            commands: ReceiverStream::new(rx),
            fatal_tx,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
        };
        let handle = tokio::spawn(ctl.run());
        Self { tx, handle }
    }

    /// Write the given message, returning once it has been buffered or written.
    ///
    /// If this write triggers a flush, the result of the flush is returned.
    pub async fn write(&self, msg: Message) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(BatchCommand::Write { msg, tx })
            .await
            .map_err(|_| anyhow!("batch writer has shut down"))?;
        rx.await.context("batch writer dropped write response")?
    }

    /// The number of snapshot rows currently buffered.
    pub async fn buffered(&self) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(BatchCommand::Buffered { tx })
            .await
            .map_err(|_| anyhow!("batch writer has shut down"))?;
        rx.await.context("batch writer dropped buffered response")
    }

    /// Stop the batch writer.
    ///
    /// Buffered rows are not flushed. If a timer triggered flush has failed, that failure is returned.
    pub async fn stop(self) -> Result<()> {
        drop(self.tx);
        self.handle.await.context("error joining batch writer")?
    }
}

enum BatchCommand {
    Write { msg: Message, tx: oneshot::Sender<Result<()>> },
    Buffered { tx: oneshot::Sender<usize> },
}

/// The batch writer actor.
struct BatchWriterCtl<T: BatchTarget> {
    target: T,
    config: BatchConfig,
    span: Span,

    /// Buffered snapshot rows, all of the active stream.
    buffer: Vec<Message>,
    /// The stream whose snapshot rows are being buffered.
    active_stream: Option<String>,
    /// The kind of the last event handled by this writer.
    last_event: Option<EventKind>,
    /// The time at which buffered rows are to be flushed.
    deadline: Option<Instant>,
    /// The failure of a timer triggered flush, after which no further writes are accepted.
    failure: Option<String>,

    /// A channel of inbound write commands.
    commands: ReceiverStream<BatchCommand>,
    /// A channel used for reporting fatal errors to the orchestrator.
    fatal_tx: FatalErrorTx,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,
}

impl<T: BatchTarget> BatchWriterCtl<T> {
    async fn run(mut self) -> Result<()> {
        tracing::debug!(parent: &self.span, "batch writer has started");
        loop {
            let deadline = self.deadline;
            tokio::select! {
                cmd_opt = self.commands.next() => match cmd_opt {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => self.handle_deadline().await,
                _ = self.shutdown_rx.next() => break,
            }
        }

        if !self.buffer.is_empty() {
            tracing::warn!(parent: &self.span, rows = self.buffer.len(), "batch writer stopped with unflushed snapshot rows");
        }
        tracing::debug!(parent: &self.span, "batch writer has shutdown");
        match self.failure {
            Some(failure) => bail!("batch writer stopped after a failed timer triggered flush: {}", failure),
            None => Ok(()),
        }
    }

    async fn handle_command(&mut self, cmd: BatchCommand) {
        match cmd {
            BatchCommand::Write { msg, tx } => {
                let res = self.handle_write(msg).await;
                let _res = tx.send(res);
            }
            BatchCommand::Buffered { tx } => {
                let _res = tx.send(self.buffer.len());
            }
        }
    }

    /// Flush buffered rows once the flush interval elapses.
    ///
    /// There is no caller to report a failure to, so a failed timer flush is reported as fatal.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn handle_deadline(&mut self) {
        self.deadline = None;
        if let Err(err) = self.flush().await {
            tracing::error!(parent: &self.span, error = ?err, "timer triggered snapshot flush failed");
            self.failure = Some(format!("{:#}", err));
            let _res = self.fatal_tx.send(err.context("timer triggered snapshot flush failed"));
        }
    }

    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn handle_write(&mut self, msg: Message) -> Result<()> {
        if let Some(failure) = &self.failure {
            bail!("batch writer failed on a timer triggered flush: {}", failure);
        }
        // A new stream can not begin accumulating until the previous stream's rows are written.
        if !self.buffer.is_empty() && self.active_stream.as_deref() != Some(msg.stream()) {
            self.flush().await.context("error performing boundary flush")?;
        }

        if msg.event() == EventKind::Snapshot {
            self.active_stream = Some(msg.stream().to_string());
            self.last_event = Some(EventKind::Snapshot);
            self.buffer.push(msg);
            if self.buffer.len() >= self.config.max_batch_size {
                return self.flush().await;
            }
            if self.deadline.is_none() {
                self.deadline = Some(Instant::now() + self.config.flush_interval);
            }
            return Ok(());
        }

        // Drain the backfill before any live event is applied.
        if self.last_event == Some(EventKind::Snapshot) {
            self.flush().await.context("error draining snapshot rows before live event")?;
        }
        self.last_event = Some(msg.event());
        self.target.write_row(&msg).await
    }

    /// Flush all buffered rows. On failure the buffer is kept intact.
    async fn flush(&mut self) -> Result<()> {
        self.deadline = None;
        let stream = match (&self.active_stream, self.buffer.is_empty()) {
            (Some(stream), false) => stream.clone(),
            _ => return Ok(()),
        };
        self.target.flush_snapshot(&stream, &self.buffer).await?;
        tracing::debug!(parent: &self.span, stream = %stream, rows = self.buffer.len(), "flushed snapshot rows");
        self.buffer.clear();
        Ok(())
    }
}
