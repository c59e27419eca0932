//! The Hadron Flow pipeline runtime.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing_subscriber::prelude::*;

use hadron_flow::manifest::{InMemorySecretStore, SecretStore};
use hadron_flow::{get_metrics_recorder, App, Config, PipelineSpec};

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(true)
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let cfg = Arc::new(Config::new()?);
    let secrets = match &cfg.secrets_path {
        Some(path) => Some(InMemorySecretStore::from_file(path).await.context("error loading secrets")?),
        None => None,
    };
    let spec = PipelineSpec::load(&cfg.pipeline_config, secrets.as_ref().map(|store| store as &dyn SecretStore))
        .await
        .context("error loading pipeline manifest")?;
    if cfg.metrics_port.is_some() {
        let recorder = get_metrics_recorder(spec.service.pipeline_id);
        metrics::set_recorder(recorder).context("error setting prometheus metrics recorder")?;
    }

    tracing::info!(
        pipeline_id = %spec.service.pipeline_id,
        pipeline_config = %cfg.pipeline_config,
        metrics_port = ?cfg.metrics_port,
        storage_data_path = %cfg.storage_data_path,
        "starting Hadron Flow",
    );
    let (shutdown_tx, _) = broadcast::channel(1);
    let res = match App::new(cfg, spec, shutdown_tx).await {
        Ok(app) => app.spawn().await.context("error joining app handle").and_then(|res| res),
        Err(err) => Err(err),
    };
    if let Err(err) = &res {
        tracing::error!(error = ?err);
    }

    // Ensure any pending output is flushed.
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();

    res
}
