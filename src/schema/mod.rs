//! Schema registry.
//!
//! The registry holds an append-only list of schema versions. Each version is a list of indices
//! into an arena of immutable stream definitions, so publishing a new version only allocates the
//! definitions which actually changed while unchanged streams are shared with prior versions.
//!
//! Version `0` is seeded from the source's declared streams. Every evolution step publishes
//! exactly one new version, including steps which declare no change, which gives downstream
//! consumers a total order over the evolution performed by a processor chain.


use std::sync::Arc;

use tracing::Span;

use crate::models::{Column, LogicalType, StreamDefinition};

/// A versioned registry of stream definitions.
pub struct SchemaRegistry {
    /// Immutable stream definitions referenced by versions.
    arena: Vec<Arc<StreamDefinition>>,
    /// All published versions, indexed by version number.
    versions: Vec<Vec<usize>>,
    /// The span used for all logging of this registry.
    span: Span,
}

impl SchemaRegistry {
    /// Create a new instance, seeding version `0` with the given streams.
    pub fn new(initial: Vec<StreamDefinition>, span: Span) -> Self {
        let arena: Vec<_> = initial.into_iter().map(Arc::new).collect();
        let versions = vec![(0..arena.len()).collect()];
        Self { arena, versions, span }
    }

    /// The number of the latest published version.
    pub fn current_version(&self) -> u64 {
        (self.versions.len() - 1) as u64
    }

    /// The contents of the latest published version.
    pub fn current(&self) -> Schema {
        self.build_schema(self.versions.len() - 1)
    }

    /// The contents of the given version, if it has been published.
    pub fn version(&self, version: u64) -> Option<Schema> {
        let idx = usize::try_from(version).ok()?;
        if idx >= self.versions.len() {
            return None;
        }
        Some(self.build_schema(idx))
    }

    /// Append a column to the named stream, publishing a new version.
    ///
    /// If the stream already has a column of the same name, it is replaced. If the stream is not
    /// known, the new version is identical to the previous one.
    pub fn add_field(&mut self, stream: &str, name: &str, logical_type: LogicalType, driver_type: Option<&str>) -> u64 {
        let column = Column {
            name: name.into(),
            logical_type,
            driver_type: driver_type.map(String::from),
            nullable: true,
            is_primary_key: false,
        };
        self.evolve(stream, move |def| {
            let mut def = def.clone();
            match def.columns.iter_mut().find(|col| col.name == column.name) {
                Some(existing) => *existing = column,
                None => def.columns.push(column),
            }
            def
        })
    }

    /// Remove all columns of the named stream whose name is in `names`, publishing a new version.
    pub fn remove_fields<S: AsRef<str>>(&mut self, stream: &str, names: &[S]) -> u64 {
        self.evolve(stream, |def| {
            let mut def = def.clone();
            def.columns.retain(|col| !names.iter().any(|name| name.as_ref() == col.name));
            def
        })
    }

    /// Publish a version identical to the current one.
    pub fn fake_evolve(&mut self) -> u64 {
        let next = self.versions[self.versions.len() - 1].clone();
        self.publish(next)
    }

    /// Publish a new version where the named stream's definition is replaced by the output of `f`.
    fn evolve<F>(&mut self, stream: &str, f: F) -> u64
    where
        F: FnOnce(&StreamDefinition) -> StreamDefinition,
    {
        let mut next = self.versions[self.versions.len() - 1].clone();
        match next.iter_mut().find(|idx| self.arena[**idx].name == stream) {
            Some(slot) => {
                let def = f(&self.arena[*slot]);
                self.arena.push(Arc::new(def));
                *slot = self.arena.len() - 1;
            }
            None => tracing::warn!(parent: &self.span, stream, "schema evolution targeted an unknown stream"),
        }
        self.publish(next)
    }

    fn publish(&mut self, streams: Vec<usize>) -> u64 {
        self.versions.push(streams);
        let version = self.current_version();
        tracing::debug!(parent: &self.span, version, "published new schema version");
        version
    }

    fn build_schema(&self, version: usize) -> Schema {
        Schema {
            version: version as u64,
            streams: self.versions[version].iter().map(|idx| self.arena[*idx].clone()).collect(),
        }
    }
}

/// An immutable view of a single schema version.
#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    version: u64,
    streams: Vec<Arc<StreamDefinition>>,
}

impl Schema {
    /// The version number of this schema.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Get the definition of the named stream.
    pub fn get(&self, stream: &str) -> Option<&StreamDefinition> {
        self.streams.iter().find(|def| def.name == stream).map(|def| def.as_ref())
    }

    /// Iterate over all stream definitions in declaration order.
    pub fn streams(&self) -> impl Iterator<Item = &StreamDefinition> {
        self.streams.iter().map(|def| def.as_ref())
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
