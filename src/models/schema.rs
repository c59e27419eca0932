//! Stream schema definitions.

use serde::{Deserialize, Serialize};

use crate::models::value::LogicalType;

/// The definition of a single column of a stream.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Column {
    /// The name of this column, which is unique per stream.
    pub name: String,
    /// The logical type of this column.
    #[serde(rename = "type")]
    pub logical_type: LogicalType,
    /// The type of this column as declared by the source or sink driver, if any.
    #[serde(default, rename = "nativeConnectorType", skip_serializing_if = "Option::is_none")]
    pub driver_type: Option<String>,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, rename = "pk")]
    pub is_primary_key: bool,
}

impl Column {
    /// Create a new nullable, non-key column.
    pub fn new(name: impl Into<String>, logical_type: LogicalType) -> Self {
        Self {
            name: name.into(),
            logical_type,
            driver_type: None,
            nullable: true,
            is_primary_key: false,
        }
    }

    /// Mark this column as the primary key of its stream.
    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self.nullable = false;
        self
    }
}

/// The definition of a stream and its ordered columns.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct StreamDefinition {
    /// The name of the stream.
    #[serde(rename = "stream")]
    pub name: String,
    /// The ordered columns of the stream.
    pub columns: Vec<Column>,
}

impl StreamDefinition {
    /// Create a new instance.
    pub fn new(name: impl Into<String>, columns: Vec<Column>) -> Self {
        Self { name: name.into(), columns }
    }

    /// Get the column with the given name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|col| col.name == name)
    }

    /// Iterate over the names of this stream's columns.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|col| col.name.as_str())
    }

    /// The primary key column of this stream.
    ///
    /// Only a single key column is used by sinks relying on upsert and delete semantics, so the
    /// first one declared wins.
    pub fn primary_key(&self) -> Option<&Column> {
        self.columns.iter().find(|col| col.is_primary_key)
    }
}
