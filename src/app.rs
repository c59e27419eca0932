use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::database::Database;
use crate::manifest::PipelineSpec;
use crate::metrics::{NoopMetrics, PipelineMetrics, PromMetrics};
use crate::offsets::SledOffsetStore;
use crate::pipeline::{Pipeline, PipelineState};
use crate::plugins::{PluginContext, PluginRegistry};
use crate::server::{get_metrics_recorder, spawn_prom_server};

/// The application object wiring a single pipeline together with its supporting tasks.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The pipeline's database system.
    _db: Database,
    /// A channel of the pipeline's state transitions.
    state_rx: watch::Receiver<PipelineState>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the pipeline controller.
    pipeline_handle: JoinHandle<Result<()>>,
    /// The join handle of the metrics server, if enabled.
    metrics_server: Option<JoinHandle<Result<()>>>,
}

impl App {
    /// Create a new instance.
    ///
    /// The pipeline is fully loaded before this returns, so any configuration, schema or
    /// connection error aborts startup here.
    pub async fn new(config: Arc<Config>, spec: PipelineSpec, shutdown_tx: broadcast::Sender<()>) -> Result<Self> {
        let pipeline_id = spec.service.pipeline_id;
        let span = tracing::info_span!("pipeline", id = pipeline_id);

        // Initialize this pipeline's storage.
        let db = Database::new(&config.storage_data_path, pipeline_id)
            .await
            .context("error opening database")?;
        let offsets = SledOffsetStore::new(&db).await.context("error opening offset store")?;

        let metrics: Arc<dyn PipelineMetrics> = match config.metrics_port {
            Some(_) => Arc::new(PromMetrics::new()),
            None => Arc::new(NoopMetrics),
        };
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let ctx = PluginContext {
            pipeline_id,
            span,
            streams: Arc::new(spec.service.stream_schema.clone()),
            offsets: Arc::new(offsets),
            database: Some(db.clone()),
            fatal_tx,
            shutdown_tx: shutdown_tx.clone(),
        };
        let plugins = PluginRegistry::default();
        let (mut pipeline, state_rx) =
            Pipeline::from_spec(&spec, &plugins, &ctx, metrics, config.queue_capacity, fatal_rx).context("error building pipeline")?;
        pipeline.load().await.context("error loading pipeline")?;

        let metrics_server = config
            .metrics_port
            .map(|port| spawn_prom_server(get_metrics_recorder(pipeline_id).handle(), port, shutdown_tx.subscribe()));
        let pipeline_handle = pipeline.spawn();

        Ok(Self {
            _config: config,
            _db: db,
            state_rx,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            pipeline_handle,
            metrics_server,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("Hadron Flow is shutting down");
        let res = self.pipeline_handle.await.context("error joining pipeline controller handle").and_then(|res| res);
        if let Err(err) = &res {
            tracing::error!(error = ?err, "error shutting down pipeline controller");
        }
        if let Some(handle) = self.metrics_server {
            if let Err(err) = handle.await.context("error joining metrics server handle").and_then(|res| res) {
                tracing::error!(error = ?err, "error shutting down metrics server");
            }
        }

        let state = *self.state_rx.borrow();
        tracing::debug!(%state, "Hadron Flow shutdown complete");
        res
    }
}
