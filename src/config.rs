//! Runtime configuration.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The logging config, which uses `tracing_subscriber::EnvFilter` directives.
    pub rust_log: String,
    /// The path to the YAML pipeline manifest.
    pub pipeline_config: String,
    /// The port which the Prometheus metrics endpoint is to use.
    ///
    /// The metrics server is only started when this is set.
    #[serde(default)]
    pub metrics_port: Option<u16>,
    /// The path to a YAML file of secrets referenced by the manifest as `#{secret.KEY}`.
    ///
    /// Secret references can not be resolved when this is unset.
    #[serde(default)]
    pub secrets_path: Option<String>,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,
    /// The capacity of the queue between the source and the processor chain.
    #[serde(default = "crate::config::default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Config {
    /// Create a new config instance.
    ///
    /// This parses the runtime environment only. The pipeline itself is described by the
    /// manifest found at `pipeline_config`.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }
}

fn default_queue_capacity() -> usize {
    crate::pipeline::DEFAULT_QUEUE_CAPACITY
}
