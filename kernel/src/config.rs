// Lineup Configuration
//
// Deployment settings loaded from JSON. Every field has a default so a
// partial file is valid.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("unknown log level `{0}`")]
    LogLevel(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineupConfig {
    /// Root filename for persistent state. Queues are stored next to it as
    /// `<state_path>-<key>`. Absent means everything is in memory.
    pub state_path: Option<PathBuf>,

    pub log_level: String,
}

impl Default for LineupConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl LineupConfig {
    /// Built-in configuration (used if no config file is provided).
    pub fn default_config() -> Self {
        Self {
            state_path: None,
            log_level: "info".into(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&data).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.log_level()?;
        Ok(config)
    }

    pub fn log_level(&self) -> Result<tracing::Level, ConfigError> {
        tracing::Level::from_str(&self.log_level)
            .map_err(|_| ConfigError::LogLevel(self.log_level.clone()))
    }
}
