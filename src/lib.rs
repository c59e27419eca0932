//! Hadron Flow, a change-data-capture pipeline runtime.
//!
//! A pipeline reads change events from one source, passes each through an ordered chain of
//! processors and writes the result to one sink. See the `pipeline` module for the lifecycle
//! and ordering guarantees.

mod app;
mod config;
pub mod database;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod manifest;
pub mod metrics;
pub mod models;
pub mod offsets;
pub mod pipeline;
pub mod plugins;
pub mod processors;
pub mod schema;
mod server;
pub mod sinks;
pub mod sources;
mod utils;

// Public exports for binaries.
pub use crate::app::App;
pub use crate::config::Config;
pub use crate::error::{AppError, ShutdownError};
pub use crate::manifest::PipelineSpec;
pub use crate::pipeline::{Pipeline, PipelineState};
pub use crate::server::get_metrics_recorder;
