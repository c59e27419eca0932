use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::Span;

use crate::models::Message;
use crate::plugins::{decode_config, PluginContext, Sink};
use crate::schema::Schema;

/// Config of the stdout sink.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct StdoutSinkConfig {
    /// Include the message metadata in each line.
    pub include_meta: bool,
}

/// A sink which writes every message as a JSON line.
pub struct StdoutSink {
    config: StdoutSinkConfig,
    span: Span,
    out: Box<dyn AsyncWrite + Send + Unpin>,
}

impl StdoutSink {
    /// Create a new instance.
    pub fn new(ctx: &PluginContext, config: serde_yaml::Value) -> Result<Self> {
        let config = decode_config("stdout", config)?;
        Ok(Self {
            config,
            span: ctx.component_span("sink", "stdout"),
            out: Box::new(tokio::io::stdout()),
        })
    }

    /// Render the given message as a single JSON line.
    pub fn render(&self, msg: &Message) -> Result<Vec<u8>> {
        let mut doc = serde_json::json!({
            "id": msg.id().to_string(),
            "stream": msg.stream(),
            "event": msg.event(),
            "fields": msg.to_json(),
        });
        if self.config.include_meta {
            doc["meta"] = serde_json::json!(msg.meta());
        }
        let mut line = serde_json::to_vec(&doc).context("error encoding message as JSON")?;
        line.push(b'\n');
        Ok(line)
    }
}

#[async_trait]
impl Sink for StdoutSink {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn set_expected_schema(&mut self, schema: Schema) -> Result<()> {
        tracing::debug!(parent: &self.span, version = schema.version(), streams = schema.len(), "stdout sink received schema");
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self, msg))]
    async fn write(&mut self, msg: Message) -> Result<()> {
        let line = self.render(&msg)?;
        self.out.write_all(&line).await.context("error writing message to stdout")?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        self.out.flush().await.context("error flushing stdout")
    }
}
