use std::collections::HashMap;

use anyhow::{bail, Result};

use crate::error::AppError;
use crate::manifest::{DriverSpec, ProcessorDriver, SinkDriver, SourceDriver};
use crate::plugins::{PluginContext, Processor, Sink, Source};
use crate::processors::{LogProcessor, SqlProcessor};
use crate::sinks::{SledSink, StdoutSink};
use crate::sources::{JsonlSource, PlaygroundSource};

/// A constructor of a source from its config blob.
pub type SourceConstructor = fn(&PluginContext, serde_yaml::Value) -> Result<Box<dyn Source>>;
/// A constructor of a processor from its config blob.
pub type ProcessorConstructor = fn(&PluginContext, serde_yaml::Value) -> Result<Box<dyn Processor>>;
/// A constructor of a sink from its config blob.
pub type SinkConstructor = fn(&PluginContext, serde_yaml::Value) -> Result<Box<dyn Sink>>;

/// A registry of plugin constructors keyed by driver.
pub struct PluginRegistry {
    sources: HashMap<SourceDriver, SourceConstructor>,
    processors: HashMap<ProcessorDriver, ProcessorConstructor>,
    sinks: HashMap<SinkDriver, SinkConstructor>,
}

impl Default for PluginRegistry {
    /// A registry holding all builtin plugins.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register_source(SourceDriver::Playground, |ctx, config| Ok(Box::new(PlaygroundSource::new(ctx, config)?)));
        registry.register_source(SourceDriver::Jsonl, |ctx, config| Ok(Box::new(JsonlSource::new(ctx, config)?)));
        registry.register_processor(ProcessorDriver::Sql, |ctx, config| Ok(Box::new(SqlProcessor::new(ctx, config)?)));
        registry.register_processor(ProcessorDriver::Log, |ctx, config| Ok(Box::new(LogProcessor::new(ctx, config)?)));
        registry.register_sink(SinkDriver::Stdout, |ctx, config| Ok(Box::new(StdoutSink::new(ctx, config)?)));
        registry.register_sink(SinkDriver::Sled, |ctx, config| Ok(Box::new(SledSink::new(ctx, config)?)));
        registry
    }
}

impl PluginRegistry {
    /// Create a registry with no registered plugins.
    pub fn empty() -> Self {
        Self {
            sources: Default::default(),
            processors: Default::default(),
            sinks: Default::default(),
        }
    }

    pub fn register_source(&mut self, driver: SourceDriver, ctor: SourceConstructor) {
        self.sources.insert(driver, ctor);
    }

    pub fn register_processor(&mut self, driver: ProcessorDriver, ctor: ProcessorConstructor) {
        self.processors.insert(driver, ctor);
    }

    pub fn register_sink(&mut self, driver: SinkDriver, ctor: SinkConstructor) {
        self.sinks.insert(driver, ctor);
    }

    /// Build the source declared by the given spec.
    pub fn build_source(&self, spec: &DriverSpec<SourceDriver>, ctx: &PluginContext) -> Result<Box<dyn Source>> {
        match self.sources.get(&spec.driver) {
            Some(ctor) => ctor(ctx, spec.config.clone()),
            None => bail!(AppError::Config(format!("no source registered for driver {:?}", spec.driver))),
        }
    }

    /// Build the processor declared by the given spec.
    pub fn build_processor(&self, spec: &DriverSpec<ProcessorDriver>, ctx: &PluginContext) -> Result<Box<dyn Processor>> {
        match self.processors.get(&spec.driver) {
            Some(ctor) => ctor(ctx, spec.config.clone()),
            None => bail!(AppError::Config(format!("no processor registered for driver {:?}", spec.driver))),
        }
    }

    /// Build the sink declared by the given spec.
    pub fn build_sink(&self, spec: &DriverSpec<SinkDriver>, ctx: &PluginContext) -> Result<Box<dyn Sink>> {
        match self.sinks.get(&spec.driver) {
            Some(ctor) => ctor(ctx, spec.config.clone()),
            None => bail!(AppError::Config(format!("no sink registered for driver {:?}", spec.driver))),
        }
    }
}
