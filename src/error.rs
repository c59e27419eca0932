//! Hadron Flow error abstractions.

use thiserror::Error;

/// Application error variants.
#[derive(Debug, Error)]
pub enum AppError {
    /// A driver or pipeline configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),
    /// A processor referenced an unknown stream or column, or the query shape is not supported.
    #[error("schema error: {0}")]
    Schema(String),
    /// A source or sink could not establish its connection.
    #[error("connection error: {0}")]
    Connection(String),
    /// A processor failed while handling a message.
    #[error("processing error in processor {processor}: {source}")]
    Processing {
        processor: String,
        #[source]
        source: anyhow::Error,
    },
    /// A sink failed to write or flush data.
    #[error("write error: {0}")]
    Write(String),
    /// A source produced a malformed event.
    #[error("source event error: {0}")]
    SourceEvent(String),
}

impl AppError {
    /// Check if this error must abort the pipeline.
    ///
    /// Startup errors and processor failures are always fatal. Write errors and malformed source
    /// events are isolated to the message which produced them.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) | Self::Schema(_) | Self::Connection(_) | Self::Processing { .. } => true,
            Self::Write(_) | Self::SourceEvent(_) => false,
        }
    }
}

/// The error type used to indicate that a system shutdown is required.
#[derive(Debug, thiserror::Error)]
#[error("fatal error: {0}")]
pub struct ShutdownError(#[from] pub anyhow::Error);

/// A result type where the error is a `ShutdownError`.
pub type ShutdownResult<T> = ::std::result::Result<T, ShutdownError>;
