//! Source offset storage.
//!
//! Polling sources use an offset store to resume incremental scans from where they left off.
//! Keys are built with `utils::offset_key` from the pipeline ID and stream name.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;

use crate::database::{Database, Tree};
use crate::utils;

/// A store of source offsets.
#[async_trait]
pub trait OffsetStore: Send + Sync + 'static {
    /// Get the last offset recorded under the given key, if any.
    async fn get(&self, key: &str) -> Result<Option<u64>>;
    /// Record the given offset under the given key.
    async fn set(&self, key: &str, offset: u64) -> Result<()>;
}

/// An offset store which only keeps offsets in memory.
#[derive(Default)]
pub struct InMemoryOffsetStore {
    offsets: Mutex<HashMap<String, u64>>,
}

#[async_trait]
impl OffsetStore for InMemoryOffsetStore {
    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let offsets = self.offsets.lock().map_err(|_| anyhow!("offsets lock poisoned"))?;
        Ok(offsets.get(key).copied())
    }

    async fn set(&self, key: &str, offset: u64) -> Result<()> {
        let mut offsets = self.offsets.lock().map_err(|_| anyhow!("offsets lock poisoned"))?;
        offsets.insert(key.to_string(), offset);
        Ok(())
    }
}

/// An offset store persisted in the pipeline's database.
pub struct SledOffsetStore {
    tree: Tree,
}

impl SledOffsetStore {
    /// Create a new instance.
    pub async fn new(db: &Database) -> Result<Self> {
        let tree = db.get_offsets_tree().await?;
        Ok(Self { tree })
    }
}

#[async_trait]
impl OffsetStore for SledOffsetStore {
    #[tracing::instrument(level = "trace", skip(self))]
    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let (tree, key) = (self.tree.clone(), key.to_string());
        Database::spawn_blocking(move || -> Result<Option<u64>> {
            tree.get(key.as_bytes())
                .context("error fetching offset")?
                .map(|val| utils::decode_u64(&val).context("error decoding offset value from storage"))
                .transpose()
        })
        .await?
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn set(&self, key: &str, offset: u64) -> Result<()> {
        let (tree, key) = (self.tree.clone(), key.to_string());
        Database::spawn_blocking(move || -> Result<()> {
            tree.insert(key.as_bytes(), &utils::encode_u64(offset)).context("error writing offset")?;
            tree.flush().context("error flushing offsets")?;
            Ok(())
        })
        .await?
    }
}
