//! The message model flowing through a pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::value::Value;

/// The kind of change a message represents.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Insert,
    Update,
    Delete,
    /// A backfill row representing data which existed before streaming began.
    Snapshot,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Snapshot => "snapshot",
        };
        f.write_str(name)
    }
}

/// A named value of a message.
#[derive(Clone, Debug, PartialEq)]
pub struct Field {
    pub name: String,
    pub value: Value,
}

impl Field {
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// A single change event bound to a stream.
///
/// Fields are shared behind an `Arc` and copied on first mutation, so clones of a message are
/// cheap and never observe each other's field changes.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    id: Uuid,
    stream: Arc<str>,
    event: EventKind,
    fields: Arc<Vec<Field>>,
    meta: BTreeMap<String, String>,
}

impl Message {
    /// Create a new message with a random ID.
    pub fn new(stream: impl AsRef<str>, event: EventKind, fields: Vec<Field>) -> Self {
        Self {
            id: Uuid::new_v4(),
            stream: Arc::from(stream.as_ref()),
            event,
            fields: Arc::new(fields),
            meta: Default::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn event(&self) -> EventKind {
        self.event
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Get the value of the field with the given name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|field| field.name == name).map(|field| &field.value)
    }

    /// Set the value of the named field, overwriting it if present, else appending it.
    pub fn set_field(&mut self, name: &str, value: impl Into<Value>) -> &[Field] {
        let value = value.into();
        let fields = Arc::make_mut(&mut self.fields);
        match fields.iter_mut().find(|field| field.name == name) {
            Some(field) => field.value = value,
            None => fields.push(Field::new(name, value)),
        }
        &self.fields
    }

    /// Drop all fields with the given names. Unknown names are ignored.
    pub fn drop_fields<S: AsRef<str>>(&mut self, names: &[S]) -> &[Field] {
        if names.is_empty() || !self.fields.iter().any(|field| names.iter().any(|name| name.as_ref() == field.name)) {
            return &self.fields;
        }
        Arc::make_mut(&mut self.fields).retain(|field| !names.iter().any(|name| name.as_ref() == field.name));
        &self.fields
    }

    /// The free-form metadata of this message.
    pub fn meta(&self) -> &BTreeMap<String, String> {
        &self.meta
    }

    pub fn set_meta(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.meta.insert(key.into(), val.into());
    }

    /// Render the fields of this message as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(self.fields.iter().map(|field| (field.name.clone(), field.value.to_json())).collect())
    }
}
