// Engine configuration loaded from `~/.folio/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::doc::{
    CompactionPolicy, COMPACTION_INTERVAL_MINUTES, COMPACTION_PENDING_UPDATES,
};

/// Returns the default data directory: `~/.folio`.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".folio"))
}

/// Returns the path to the engine config file: `~/.folio/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    default_data_dir().map(|dir| dir.join("config.toml"))
}

/// Engine configuration, stored as TOML.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the workspace registry and per-workspace stores.
    pub data_dir: PathBuf,
    /// Snapshot compaction thresholds.
    pub compaction: CompactionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir().unwrap_or_else(|| PathBuf::from(".folio")),
            compaction: CompactionConfig::default(),
        }
    }
}

/// Thresholds that decide when a doc's pending update log is folded into
/// its snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CompactionConfig {
    /// Fold once this many updates are pending.
    pub pending_updates: usize,
    /// Also fold when the latest snapshot is older than this many minutes.
    pub interval_minutes: u64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            pending_updates: COMPACTION_PENDING_UPDATES,
            interval_minutes: COMPACTION_INTERVAL_MINUTES as u64,
        }
    }
}

impl EngineConfig {
    /// Loads the engine config, falling back to defaults if the file
    /// doesn't exist or can't be parsed.
    pub fn load() -> Self {
        config_path()
            .and_then(|path| Self::load_from(&path).ok())
            .unwrap_or_default()
    }

    /// Loads config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Saves the config to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = config_path().ok_or_else(|| {
            ConfigError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "could not determine home directory",
            ))
        })?;
        self.save_to(&path)
    }

    /// Saves the config to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Directory holding the per-workspace store files.
    pub fn workspaces_dir(&self) -> PathBuf {
        self.data_dir.join("workspaces")
    }

    /// Path of the workspace registry database.
    pub fn meta_db_path(&self) -> PathBuf {
        self.data_dir.join("meta.db")
    }

    /// The compaction policy these thresholds describe.
    pub fn compaction_policy(&self) -> CompactionPolicy {
        CompactionPolicy {
            pending_updates: self.compaction.pending_updates,
            interval: Duration::from_secs(self.compaction.interval_minutes * 60),
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Serialize(toml::ser::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "config I/O error: {e}"),
            ConfigError::Parse(e) => write!(f, "config parse error: {e}"),
            ConfigError::Serialize(e) => write!(f, "config serialize error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<toml::ser::Error> for ConfigError {
    fn from(e: toml::ser::Error) -> Self {
        ConfigError::Serialize(e)
    }
}
