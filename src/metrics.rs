//! Pipeline metrics.

use std::time::Duration;

pub(crate) const METRIC_RECEIVED: &str = "hadron_flow_messages_received";
pub(crate) const METRIC_SENT: &str = "hadron_flow_messages_sent";
pub(crate) const METRIC_SOURCE_ERRORS: &str = "hadron_flow_source_errors";
pub(crate) const METRIC_SINK_ERRORS: &str = "hadron_flow_sink_errors";
pub(crate) const METRIC_PROCESSOR_RECEIVED: &str = "hadron_flow_processor_messages_received";
pub(crate) const METRIC_PROCESSOR_SENT: &str = "hadron_flow_processor_messages_sent";
pub(crate) const METRIC_PROCESSOR_DROPPED: &str = "hadron_flow_processor_messages_dropped";
pub(crate) const METRIC_PROCESSOR_EXECUTION: &str = "hadron_flow_processor_execution_seconds";

/// The metrics interface used by a pipeline.
///
/// The pipeline calls these unconditionally, so implementations must be cheap and infallible.
pub trait PipelineMetrics: Send + Sync + 'static {
    /// Called once at startup with the names of all processors, in declared order.
    fn register_processors(&self, processors: &[String]);

    fn increment_received(&self);
    fn increment_sent(&self);
    fn increment_source_errors(&self);
    fn increment_sink_errors(&self);

    fn increment_processor_received(&self, processor: &str);
    fn increment_processor_sent(&self, processor: &str);
    fn increment_processor_dropped(&self, processor: &str);
    fn observe_processor_execution(&self, processor: &str, elapsed: Duration);
}

/// A metrics implementation which records nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl PipelineMetrics for NoopMetrics {
    fn register_processors(&self, _: &[String]) {}
    fn increment_received(&self) {}
    fn increment_sent(&self) {}
    fn increment_source_errors(&self) {}
    fn increment_sink_errors(&self) {}
    fn increment_processor_received(&self, _: &str) {}
    fn increment_processor_sent(&self, _: &str) {}
    fn increment_processor_dropped(&self, _: &str) {}
    fn observe_processor_execution(&self, _: &str, _: Duration) {}
}

/// A metrics implementation backed by the global `metrics` recorder.
///
/// When the Prometheus recorder is installed these are exported by the metrics server.
#[derive(Clone, Copy, Debug, Default)]
pub struct PromMetrics;

impl PromMetrics {
    /// Create a new instance, registering all pipeline level metrics.
    pub fn new() -> Self {
        metrics::register_counter!(METRIC_RECEIVED, metrics::Unit::Count, "messages received from the source");
        metrics::register_counter!(METRIC_SENT, metrics::Unit::Count, "messages written to the sink");
        metrics::register_counter!(METRIC_SOURCE_ERRORS, metrics::Unit::Count, "malformed events received from the source");
        metrics::register_counter!(METRIC_SINK_ERRORS, metrics::Unit::Count, "messages which the sink failed to write");
        metrics::register_counter!(METRIC_PROCESSOR_RECEIVED, metrics::Unit::Count, "messages received by a processor");
        metrics::register_counter!(METRIC_PROCESSOR_SENT, metrics::Unit::Count, "messages emitted by a processor");
        metrics::register_counter!(METRIC_PROCESSOR_DROPPED, metrics::Unit::Count, "messages filtered out by a processor");
        metrics::register_histogram!(METRIC_PROCESSOR_EXECUTION, metrics::Unit::Seconds, "processor execution time per message");
        Self
    }
}

impl PipelineMetrics for PromMetrics {
    fn register_processors(&self, processors: &[String]) {
        for processor in processors {
            metrics::counter!(METRIC_PROCESSOR_RECEIVED, 0, "processor" => processor.clone());
            metrics::counter!(METRIC_PROCESSOR_SENT, 0, "processor" => processor.clone());
            metrics::counter!(METRIC_PROCESSOR_DROPPED, 0, "processor" => processor.clone());
        }
    }

    fn increment_received(&self) {
        metrics::increment_counter!(METRIC_RECEIVED);
    }

    fn increment_sent(&self) {
        metrics::increment_counter!(METRIC_SENT);
    }

    fn increment_source_errors(&self) {
        metrics::increment_counter!(METRIC_SOURCE_ERRORS);
    }

    fn increment_sink_errors(&self) {
        metrics::increment_counter!(METRIC_SINK_ERRORS);
    }

    fn increment_processor_received(&self, processor: &str) {
        metrics::increment_counter!(METRIC_PROCESSOR_RECEIVED, "processor" => processor.to_string());
    }

    fn increment_processor_sent(&self, processor: &str) {
        metrics::increment_counter!(METRIC_PROCESSOR_SENT, "processor" => processor.to_string());
    }

    fn increment_processor_dropped(&self, processor: &str) {
        metrics::increment_counter!(METRIC_PROCESSOR_DROPPED, "processor" => processor.to_string());
    }

    fn observe_processor_execution(&self, processor: &str, elapsed: Duration) {
        metrics::histogram!(METRIC_PROCESSOR_EXECUTION, elapsed.as_secs_f64(), "processor" => processor.to_string());
    }
}
