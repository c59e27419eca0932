//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec};

use crate::error::{ShutdownError, ShutdownResult};

pub type Tree = sled::Tree;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/hadron-flow/db";
/// The DB tree used for source offsets.
const TREE_OFFSETS: &str = "offsets";
/// The DB tree prefix used for sink streams.
const TREE_SINK_PREFIX: &str = "sink";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the pipeline's embedded database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database of the given pipeline under the given data path.
    pub async fn new(data_path: &str, pipeline_id: u64) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(data_path).join(format!("pipeline_{}", pipeline_id));
        tokio::fs::create_dir_all(&dbpath).await.context("error creating dir for pipeline database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(DatabaseInner { db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Get a handle to the DB tree used for source offsets.
    pub async fn get_offsets_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_OFFSETS.to_string()).await
    }

    /// Get a handle to the DB tree used by the sink for the given stream.
    pub async fn get_sink_tree(&self, stream: &str) -> ShutdownResult<Tree> {
        self.open_tree(format!("{}/{}", TREE_SINK_PREFIX, stream)).await
    }

    async fn open_tree(&self, name: String) -> ShutdownResult<Tree> {
        let (db, ivname) = (self.inner.db.clone(), IVec::from(name.as_str()));
        let tree = Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", &name, err))))?;
        Ok(tree)
    }
}
