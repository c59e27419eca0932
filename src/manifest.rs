//! Pipeline manifest.
//!
//! A pipeline is declared as a YAML document naming one source, zero or more processors and one
//! sink, along with the stream definitions of the source. Environment and secret references are
//! substituted in the raw text before it is parsed.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use anyhow::{bail, Context, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::StreamDefinition;

/// The pattern matched by the substitution pass.
///
/// Groups: 1 = escaped literal, 2 = env var name, 3 = env var default, 4 = secret key.
const SUBSTITUTION_PATTERN: &str = r"\$(\$\{[^}]*\})|\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}|#\{secret\.([A-Za-z0-9_.\-]+)\}";

/// A complete pipeline manifest.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PipelineSpec {
    /// Service level settings of the pipeline.
    pub service: ServiceSpec,
    /// The source of the pipeline.
    pub source: DriverSpec<SourceDriver>,
    /// The processor chain of the pipeline, applied in order.
    #[serde(default)]
    pub processors: Vec<DriverSpec<ProcessorDriver>>,
    /// The sink of the pipeline.
    pub sink: DriverSpec<SinkDriver>,
}

/// Service level settings of a pipeline.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServiceSpec {
    /// The ID of the pipeline, used to derive offset keys and storage paths.
    pub pipeline_id: u64,
    /// The stream definitions declared for the source.
    pub stream_schema: Vec<StreamDefinition>,
}

/// A driver identifier along with its driver specific config blob.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DriverSpec<D> {
    pub driver: D,
    #[serde(default)]
    pub config: serde_yaml::Value,
}

/// The available source drivers.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceDriver {
    Playground,
    Jsonl,
}

/// The available processor drivers.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorDriver {
    Sql,
    Log,
}

/// The available sink drivers.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SinkDriver {
    Stdout,
    Sled,
}

/// A store of secrets referenced as `#{secret.KEY}` in a manifest.
pub trait SecretStore: Send + Sync {
    /// Get the value of the given secret, if it exists.
    fn get(&self, key: &str) -> Option<String>;
}

/// A secret store backed by an in-memory map.
#[derive(Clone, Debug, Default)]
pub struct InMemorySecretStore {
    secrets: HashMap<String, String>,
}

impl InMemorySecretStore {
    pub fn new(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }

    /// Load a secret store from a YAML file holding a flat mapping of secret keys to values.
    pub async fn from_file(path: &str) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("error reading secrets file {}", path))?;
        let secrets: HashMap<String, String> =
            serde_yaml::from_str(&raw).map_err(|err| AppError::Config(format!("invalid secrets file {}: {}", path, err)))?;
        Ok(Self { secrets })
    }

    pub fn insert(&mut self, key: impl Into<String>, val: impl Into<String>) {
        self.secrets.insert(key.into(), val.into());
    }
}

impl SecretStore for InMemorySecretStore {
    fn get(&self, key: &str) -> Option<String> {
        self.secrets.get(key).cloned()
    }
}

impl PipelineSpec {
    /// Load a manifest from the given path, substituting values from the process environment.
    pub async fn load(path: &str, secrets: Option<&dyn SecretStore>) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("error reading pipeline manifest {}", path))?;
        Self::from_yaml(&raw, &|name: &str| std::env::var(name).ok(), secrets)
    }

    /// Parse a manifest from raw YAML, substituting environment and secret references first.
    pub fn from_yaml(raw: &str, env: &dyn Fn(&str) -> Option<String>, secrets: Option<&dyn SecretStore>) -> Result<Self> {
        let resolved = substitute(raw, env, secrets)?;
        let spec: Self = serde_yaml::from_str(&resolved).map_err(|err| AppError::Config(format!("invalid pipeline manifest: {}", err)))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Validate the declared stream schema.
    pub fn validate(&self) -> Result<()> {
        let streams = &self.service.stream_schema;
        if streams.is_empty() {
            bail!(AppError::Config("at least one stream must be declared".into()));
        }
        if let Some(dup) = first_duplicate(streams.iter().map(|def| def.name.as_str())) {
            bail!(AppError::Config(format!("stream {} is declared more than once", dup)));
        }
        for def in streams {
            if def.name.is_empty() {
                bail!(AppError::Config("stream names must not be empty".into()));
            }
            if def.columns.iter().any(|col| col.name.is_empty()) {
                bail!(AppError::Config(format!("stream {} declares a column with an empty name", def.name)));
            }
            if let Some(dup) = first_duplicate(def.column_names()) {
                bail!(AppError::Config(format!("stream {} declares column {} more than once", def.name, dup)));
            }
        }
        Ok(())
    }
}

fn first_duplicate<T: Eq + Hash + Copy>(items: impl Iterator<Item = T>) -> Option<T> {
    let mut seen = HashSet::new();
    items.into_iter().find(|item| !seen.insert(*item))
}

/// Substitute environment and secret references in the given text.
///
/// - `${VAR}` and `${VAR:default}` resolve from `env`; an unset variable without a default is an error.
/// - `$${...}` emits a literal `${...}`.
/// - `#{secret.KEY}` resolves from `secrets`.
///
/// Newlines in substituted values are escaped so multi-line values stay on a single YAML line.
pub fn substitute(raw: &str, env: &dyn Fn(&str) -> Option<String>, secrets: Option<&dyn SecretStore>) -> Result<String> {
    let pattern = Regex::new(SUBSTITUTION_PATTERN).context("error compiling substitution pattern")?;
    let mut out = String::with_capacity(raw.len());
    let mut last = 0;
    for caps in pattern.captures_iter(raw) {
        let whole = match caps.get(0) {
            Some(whole) => whole,
            None => continue,
        };
        out.push_str(&raw[last..whole.start()]);
        out.push_str(&resolve_capture(&caps, env, secrets)?);
        last = whole.end();
    }
    out.push_str(&raw[last..]);
    Ok(out)
}

fn resolve_capture(caps: &Captures, env: &dyn Fn(&str) -> Option<String>, secrets: Option<&dyn SecretStore>) -> Result<String> {
    if let Some(literal) = caps.get(1) {
        return Ok(literal.as_str().to_string());
    }
    if let Some(name) = caps.get(2) {
        let val = match (env(name.as_str()), caps.get(3)) {
            (Some(val), _) => val,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => bail!(AppError::Config(format!("environment variable {} is not set and has no default", name.as_str()))),
        };
        return Ok(escape_newlines(&val));
    }
    if let Some(key) = caps.get(4) {
        let store = match secrets {
            Some(store) => store,
            None => bail!(AppError::Config(format!("secret {} referenced but no secret store is configured", key.as_str()))),
        };
        let val = store
            .get(key.as_str())
            .ok_or_else(|| AppError::Config(format!("secret {} not found", key.as_str())))?;
        return Ok(escape_newlines(&val));
    }
    Ok(String::new())
}

fn escape_newlines(val: &str) -> String {
    val.replace('\n', "\\n")
}
