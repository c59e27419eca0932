//! Builtin processors.

mod log;
mod sql;

pub use self::log::{LogConfig, LogProcessor};
pub use self::sql::{Filter, SqlConfig, SqlProcessor};
