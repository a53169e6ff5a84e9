use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cells::DEFAULT_PRECISION;
use crate::cluster::MergePolicy;
use crate::planner::{MAX_RADIUS_M, MIN_RADIUS_M};
use crate::projection::{DEFAULT_SYSTEM, ProjectionRegistry};
use crate::rebuild::IndexOptions;
use crate::record::Category;
use crate::store::MAX_BATCH_WRITES;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub index: IndexConfig,
    pub query: QueryConfig,
    pub projection: ProjectionConfig,
    pub store: StoreConfig,
    /// Keyed by category name (`hydrant`, `risk_object`, ...).
    pub sources: HashMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexConfig {
    pub collection: String,
    pub precision: usize,
    pub batch_size: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            collection: "clusters".to_string(),
            precision: DEFAULT_PRECISION,
            batch_size: MAX_BATCH_WRITES,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct QueryConfig {
    pub min_radius: f64,
    pub max_radius: f64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            min_radius: MIN_RADIUS_M,
            max_radius: MAX_RADIUS_M,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProjectionConfig {
    pub default_system: String,
    /// Extra named systems as proj4 definitions.
    pub systems: HashMap<String, String>,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            default_system: DEFAULT_SYSTEM.to_string(),
            systems: HashMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/store"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Local path or http(s) URL of a JSON array of records.
    pub location: String,
    pub system: Option<String>,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Maximum age of a downloaded copy under `cache_dir` before it is refetched.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".cache")
}

fn default_cache_ttl() -> u64 {
    300
}

impl SourceConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl AppConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AppConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            (1..=12).contains(&self.index.precision),
            "index.precision must be between 1 and 12, got {}",
            self.index.precision
        );
        anyhow::ensure!(self.index.batch_size >= 1, "index.batch_size must be at least 1");
        anyhow::ensure!(
            self.query.min_radius > 0.0 && self.query.min_radius <= self.query.max_radius,
            "query radius bounds must satisfy 0 < min_radius <= max_radius"
        );
        for name in self.sources.keys() {
            name.parse::<Category>().map_err(anyhow::Error::msg)?;
        }
        Ok(())
    }

    pub fn source(&self, category: Category) -> Option<&SourceConfig> {
        self.sources
            .iter()
            .find(|(name, _)| name.parse::<Category>().ok() == Some(category))
            .map(|(_, source)| source)
    }

    pub fn registry(&self) -> ProjectionRegistry {
        let mut registry = ProjectionRegistry::default();
        for (name, definition) in &self.projection.systems {
            registry.register(name, definition);
        }
        registry
    }

    pub fn index_options(&self, policy: MergePolicy) -> IndexOptions {
        IndexOptions {
            collection: self.index.collection.clone(),
            precision: self.index.precision,
            batch_size: self.index.batch_size,
            policy,
            min_radius_m: self.query.min_radius,
            max_radius_m: self.query.max_radius,
        }
    }
}
