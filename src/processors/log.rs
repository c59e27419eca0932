use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::Span;

use crate::models::Message;
use crate::plugins::{decode_config, PluginContext, Processor};
use crate::schema::SchemaRegistry;

/// The stream name matching every stream.
const ALL_STREAMS: &str = "*";

/// Config of the log processor.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// The stream whose messages are logged, or `*` for all streams.
    pub stream: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { stream: ALL_STREAMS.into() }
    }
}

/// A processor which logs every message it observes and passes it through unchanged.
pub struct LogProcessor {
    config: LogConfig,
    span: Span,
}

impl LogProcessor {
    /// Create a new instance.
    pub fn new(ctx: &PluginContext, config: serde_yaml::Value) -> Result<Self> {
        let config = decode_config("log", config)?;
        Ok(Self {
            config,
            span: ctx.component_span("processor", "log"),
        })
    }

    fn matches(&self, msg: &Message) -> bool {
        self.config.stream == ALL_STREAMS || self.config.stream == msg.stream()
    }
}

#[async_trait]
impl Processor for LogProcessor {
    fn name(&self) -> &str {
        "log"
    }

    fn evolve_schema(&mut self, registry: &mut SchemaRegistry) -> Result<()> {
        registry.fake_evolve();
        Ok(())
    }

    async fn process(&self, msg: Message) -> Result<Option<Message>> {
        if self.matches(&msg) {
            tracing::info!(
                parent: &self.span,
                id = %msg.id(),
                stream = msg.stream(),
                event = %msg.event(),
                fields = %msg.to_json(),
                "message observed"
            );
        }
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fixtures;
    use crate::models::{Column, EventKind, Field, LogicalType, StreamDefinition};

    #[tokio::test]
    async fn passes_messages_through_and_fake_evolves() -> Result<()> {
        let streams = vec![StreamDefinition::new("flights", vec![Column::new("flight_id", LogicalType::Int)])];
        let ctx = fixtures::plugin_context(streams.clone());
        let mut processor = LogProcessor::new(&ctx, serde_yaml::from_str("stream: flights")?)?;
        let mut registry = SchemaRegistry::new(streams, Span::none());
        let msg = Message::new("flights", EventKind::Insert, vec![Field::new("flight_id", 1)]);

        processor.evolve_schema(&mut registry)?;
        let out = processor.process(msg.clone()).await?;

        assert!(registry.current_version() == 1, "expected one version bump, got {}", registry.current_version());
        assert!(out.as_ref() == Some(&msg), "expected message to pass through unchanged, got {:?}", out);
        assert!(processor.matches(&msg), "expected configured stream to match");
        Ok(())
    }
}
