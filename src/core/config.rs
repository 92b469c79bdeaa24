//! `worldline.toml`: runtime, store, and log settings.
//!
//! Lookup order: `<dir>/worldline.toml`, then `<dir>/.worldline/worldline.toml`.
//! No file means defaults; a malformed file is an error.

use crate::core::error::WorldlineError;
use crate::core::sqlite_store::SqliteWorldStore;
use crate::core::store::{DEFAULT_SNAPSHOT_INTERVAL, MemoryWorldStore, WorldStore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "worldline.toml";
pub const STATE_DIR_NAME: &str = ".worldline";
pub const DEFAULT_RETAINED_HANDLES: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Actor used when an action names none.
    pub default_actor: String,
    /// Action types with this prefix run on the system lane.
    pub system_prefix: String,
    /// Upper bound for one effect; unset means no limit.
    pub execution_timeout_ms: Option<u64>,
    /// Settled action handles kept for `get_action_handle`; older ones are evicted.
    pub retained_handles: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_actor: "anonymous".to_string(),
            system_prefix: "system.".to_string(),
            execution_timeout_ms: None,
            retained_handles: DEFAULT_RETAINED_HANDLES,
        }
    }
}

impl RuntimeConfig {
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Store root, relative to the directory the config was loaded from.
    pub path: PathBuf,
    pub snapshot_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: PathBuf::from(STATE_DIR_NAME).join("data"),
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WorldlineConfig {
    pub runtime: RuntimeConfig,
    pub store: StoreConfig,
    pub log: LogConfig,
}

impl WorldlineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, WorldlineError> {
        let config: WorldlineConfig =
            toml::from_str(raw).map_err(|e| WorldlineError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WorldlineError> {
        if self.runtime.system_prefix.is_empty() {
            return Err(WorldlineError::ConfigError(
                "runtime.system_prefix must not be empty".to_string(),
            ));
        }
        if self.runtime.default_actor.trim().is_empty() {
            return Err(WorldlineError::ConfigError(
                "runtime.default_actor must not be empty".to_string(),
            ));
        }
        if self.store.snapshot_interval == 0 {
            return Err(WorldlineError::ConfigError(
                "store.snapshot_interval must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, WorldlineError> {
        toml::to_string_pretty(self).map_err(|e| WorldlineError::ConfigError(e.to_string()))
    }

    /// Absolute store root for a config loaded from `dir`.
    pub fn store_root(&self, dir: &Path) -> PathBuf {
        if self.store.path.is_absolute() {
            self.store.path.clone()
        } else {
            dir.join(&self.store.path)
        }
    }

    pub fn open_store(&self, dir: &Path) -> Result<Arc<dyn WorldStore>, WorldlineError> {
        Ok(match self.store.backend {
            StoreBackend::Memory => Arc::new(MemoryWorldStore::new(self.store.snapshot_interval)),
            StoreBackend::Sqlite => Arc::new(SqliteWorldStore::open(
                &self.store_root(dir),
                self.store.snapshot_interval,
            )?),
        })
    }
}

pub fn config_path(dir: &Path) -> Option<PathBuf> {
    [
        dir.join(CONFIG_FILE_NAME),
        dir.join(STATE_DIR_NAME).join(CONFIG_FILE_NAME),
    ]
    .into_iter()
    .find(|p| p.exists())
}

pub fn load_config(dir: &Path) -> Result<WorldlineConfig, WorldlineError> {
    let Some(path) = config_path(dir) else {
        return Ok(WorldlineConfig::default());
    };
    let content = fs::read_to_string(&path).map_err(WorldlineError::IoError)?;
    WorldlineConfig::from_toml_str(&content).map_err(|e| match e {
        WorldlineError::ConfigError(msg) => {
            WorldlineError::ConfigError(format!("{}: {}", path.display(), msg))
        }
        other => other,
    })
}
