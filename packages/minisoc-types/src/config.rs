//! # config
//!
//! YAML configuration shared by the server and agent binaries. Every field
//! has a default so a missing file or an empty document still yields a
//! runnable config.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
}

// ── Sections ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: PathBuf,
    pub max_bytes: u64,
    pub backups: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: PathBuf::from("./var/log"),
            max_bytes: 5_000_000,
            backups: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_host: String,
    pub bind_port: u16,
    pub db_path: PathBuf,
    pub jsonl_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 8080,
            db_path: PathBuf::from("./var/minisoc.db"),
            jsonl_dir: PathBuf::from("./var/jsonl"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub host_name: String,
    pub tail_paths: Vec<PathBuf>,
    pub server_url: String,
    pub poll_interval_s: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            host_name: "localhost".to_string(),
            tail_paths: vec![
                PathBuf::from("/var/log/auth.log"),
                PathBuf::from("/var/log/syslog"),
            ],
            server_url: "http://127.0.0.1:8080".to_string(),
            poll_interval_s: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub agent: AgentConfig,
}

/// Load config from a YAML file. A missing file is not an error — local
/// bring-up runs on defaults; an unparsable file is fatal.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if text.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
