//! Data models.

pub mod message;
pub mod schema;
pub mod value;

pub use message::{EventKind, Field, Message};
pub use schema::{Column, StreamDefinition};
pub use value::{CompareOp, Literal, LogicalType, Value};
