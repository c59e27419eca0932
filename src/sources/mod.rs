//! Builtin sources.

mod jsonl;
mod playground;

pub use jsonl::{JsonlConfig, JsonlSource};
pub use playground::{PlaygroundConfig, PlaygroundSource};
