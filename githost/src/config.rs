use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Configuration for the git host
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP port to listen on
    pub http_port: u16,
    /// Directory holding `repos/` and the SQLite database
    pub data_dir: PathBuf,
    /// Branch whose pushes trigger a deployment
    pub deploy_branch: String,
    /// Prefix of the labels put on images and containers
    pub label_prefix: String,
    /// Seconds a container gets to stop before it is killed
    pub stop_timeout_secs: i64,
    /// git executable used for the protocol and for checkouts
    pub git_binary: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::default_config()
    }
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e))?;
        serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Config {
            http_port: 8080,
            data_dir: PathBuf::from("data"),
            deploy_branch: "main".to_string(),
            label_prefix: "githost".to_string(),
            stop_timeout_secs: 10,
            git_binary: "git".to_string(),
        }
    }

    /// Directory containing the bare repositories
    pub fn repos_path(&self) -> PathBuf {
        self.data_dir.join("repos")
    }

    /// SQLite database URL, created on first connect
    pub fn database_url(&self) -> String {
        format!("sqlite:{}?mode=rwc", self.data_dir.join("githost.db").display())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, std::io::Error),
    #[error("Failed to parse config file {0}: {1}")]
    ParseError(PathBuf, serde_json::Error),
}
