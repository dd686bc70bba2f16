//! Configuration for demo sync.
//!
//! Loaded once at startup from a TOML file and passed explicitly into the
//! sync engine. Relative paths in the `[general]` section are resolved
//! against the directory containing the config file.
//!
//! ```toml
//! [general]
//! demodir = "demos"
//! demos_logfile = "demos.log"
//!
//! [[servers]]
//! name = "alpha"
//! host = "203.0.113.10"
//! port = 21
//! user = "demos"
//! passwd = "secret"
//! remote_dir = "/cstrike"
//! ```

use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "DEMOSYNC_CONFIG";

pub const DEFAULT_WORKERS: usize = 5;
pub const DEFAULT_FTP_PORT: u16 = 21;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_TRANSFER_TIMEOUT_SECS: u64 = 300;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not determine a config directory for this platform")]
    NoConfigDir,
}

/// Connection settings for one remote game server.
#[derive(Clone, Deserialize)]
pub struct ServerConfig {
    /// Server name; also the local subdirectory its demos are stored in.
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    pub passwd: String,
    /// Directory on the server holding the demos.
    #[serde(default)]
    pub remote_dir: String,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("passwd", &"***")
            .field("remote_dir", &self.remote_dir)
            .finish()
    }
}

fn default_port() -> u16 {
    DEFAULT_FTP_PORT
}

#[derive(Debug, Clone, Deserialize)]
struct RawGeneral {
    demodir: PathBuf,
    #[serde(default)]
    demos_logfile: Option<PathBuf>,
    #[serde(default)]
    database: Option<PathBuf>,
    #[serde(default)]
    workers: Option<usize>,
    #[serde(default)]
    connect_timeout_secs: Option<u64>,
    #[serde(default)]
    transfer_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    general: RawGeneral,
    #[serde(default)]
    servers: Vec<ServerConfig>,
}

/// General (non-server) settings with paths already resolved.
#[derive(Debug, Clone)]
pub struct GeneralConfig {
    /// Local root for all per-server demo subdirectories.
    pub demodir: PathBuf,
    pub log_file: Option<PathBuf>,
    pub database: PathBuf,
    /// Download pool width.
    pub workers: usize,
    pub connect_timeout: Duration,
    pub transfer_timeout: Duration,
}

/// Validated configuration for one sync pass.
#[derive(Debug, Clone)]
pub struct Config {
    pub general: GeneralConfig,
    /// Servers in configuration order.
    pub servers: Vec<ServerConfig>,
}

impl Config {
    /// Load and validate the config file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        // Stored demo paths must not depend on the working directory.
        let absolute = std::path::absolute(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base = absolute.parent().unwrap_or_else(|| Path::new("/"));
        Self::from_toml_str(&content, base).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse config text, resolving relative paths against `base_dir`.
    pub fn from_toml_str(content: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;

        let resolve = |p: PathBuf| if p.is_absolute() { p } else { base_dir.join(p) };

        let general = GeneralConfig {
            demodir: resolve(raw.general.demodir),
            log_file: raw.general.demos_logfile.map(resolve),
            database: resolve(
                raw.general
                    .database
                    .unwrap_or_else(|| PathBuf::from("demos.db")),
            ),
            workers: raw.general.workers.unwrap_or(DEFAULT_WORKERS),
            connect_timeout: Duration::from_secs(
                raw.general
                    .connect_timeout_secs
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            ),
            transfer_timeout: Duration::from_secs(
                raw.general
                    .transfer_timeout_secs
                    .unwrap_or(DEFAULT_TRANSFER_TIMEOUT_SECS),
            ),
        };

        let config = Self {
            general,
            servers: raw.servers,
        };
        config.validate()?;
        Ok(config)
    }

    /// Look up a server by name.
    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.general.workers == 0 {
            return Err(ConfigError::Invalid("general.workers must be at least 1".into()));
        }

        let mut seen = HashSet::new();
        for server in &self.servers {
            if !is_valid_server_name(&server.name) {
                return Err(ConfigError::Invalid(format!(
                    "server name {:?} must be a single, non-empty path component",
                    server.name
                )));
            }
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate server name {:?}",
                    server.name
                )));
            }
            if server.host.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "server {:?} has no host",
                    server.name
                )));
            }
        }
        Ok(())
    }
}

/// Server names double as directory names under `demodir`.
fn is_valid_server_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.starts_with('.')
}

/// Resolve the config file path: explicit override, then `DEMOSYNC_CONFIG`,
/// then `config.toml` in the platform config directory.
pub fn resolve_config_path(cli_override: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = cli_override {
        return Ok(path);
    }
    if let Ok(path) = dotenvy::var(CONFIG_ENV_VAR)
        && !path.trim().is_empty()
    {
        return Ok(PathBuf::from(path));
    }
    directories::ProjectDirs::from("com", "demo-sync", "demo-sync")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}
