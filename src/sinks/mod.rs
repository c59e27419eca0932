//! Builtin sinks.

pub mod batch;
mod embedded;
mod stdout;

pub use batch::{BatchConfig, BatchTarget, BatchWriter};
pub use embedded::{SledSink, SledSinkConfig};
pub use stdout::{StdoutSink, StdoutSinkConfig};
