//! Configuration module for Cubby.

use serde::Deserialize;
use std::path::Path;

use crate::{CubbyError, Result};

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port number to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of connection handlers. Each one owns a single client at a time.
    #[serde(default = "default_handler_threads")]
    pub handler_threads: usize,
    /// Accepted connections waiting for a free handler. Connections beyond
    /// this are closed immediately.
    #[serde(default = "default_connection_queue_capacity")]
    pub connection_queue_capacity: usize,
    /// Maximum length of a command line in bytes.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_handler_threads() -> usize {
    5
}

fn default_connection_queue_capacity() -> usize {
    16
}

fn default_max_line_bytes() -> usize {
    4096
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            handler_threads: default_handler_threads(),
            connection_queue_capacity: default_connection_queue_capacity(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkersConfig {
    /// Number of workers executing file tasks.
    #[serde(default = "default_worker_count")]
    pub count: usize,
    /// Order the task queue by priority instead of plain arrival order.
    #[serde(default)]
    pub priority_queue: bool,
    /// Maximum queued tasks (0 = unbounded).
    #[serde(default)]
    pub task_queue_capacity: usize,
    /// How long a handler waits for its task (0 = forever).
    #[serde(default)]
    pub task_timeout_secs: u64,
}

fn default_worker_count() -> usize {
    4
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            priority_queue: false,
            task_queue_capacity: 0,
            task_timeout_secs: 0,
        }
    }
}

/// Storage and metadata limits.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Root directory holding one subdirectory per user.
    #[serde(default = "default_storage_root")]
    pub root: String,
    /// Per-user quota in bytes.
    #[serde(default = "default_quota_bytes")]
    pub quota_bytes: u64,
    /// Maximum number of registered users.
    #[serde(default = "default_max_users")]
    pub max_users: usize,
    /// Maximum number of files per user.
    #[serde(default = "default_max_files_per_user")]
    pub max_files_per_user: usize,
}

fn default_storage_root() -> String {
    "storage".to_string()
}

fn default_quota_bytes() -> u64 {
    1024 * 1024 // 1MB
}

fn default_max_users() -> usize {
    100
}

fn default_max_files_per_user() -> usize {
    50
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
            quota_bytes: default_quota_bytes(),
            max_users: default_max_users(),
            max_files_per_user: default_max_files_per_user(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/cubby.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Worker pool configuration.
    #[serde(default)]
    pub workers: WorkersConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(CubbyError::Io)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| CubbyError::Config(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `CUBBY_HOST`: bind address
    /// - `CUBBY_PORT`: listen port (ignored when not a valid port number)
    /// - `CUBBY_STORAGE_ROOT`: storage root directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("CUBBY_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }
        if let Ok(port) = std::env::var("CUBBY_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(root) = std::env::var("CUBBY_STORAGE_ROOT") {
            if !root.is_empty() {
                self.storage.root = root;
            }
        }
    }

    /// Validate the configuration.
    ///
    /// Pool sizes, the user table and the per-user file table must be
    /// non-empty, and a command line must be able to hold the longest
    /// `UPLOAD` command.
    pub fn validate(&self) -> Result<()> {
        if self.server.handler_threads == 0 {
            return Err(CubbyError::Config(
                "server.handler_threads must be at least 1".to_string(),
            ));
        }
        if self.server.connection_queue_capacity == 0 {
            return Err(CubbyError::Config(
                "server.connection_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.server.max_line_bytes < 512 {
            return Err(CubbyError::Config(
                "server.max_line_bytes must be at least 512".to_string(),
            ));
        }
        if self.workers.count == 0 {
            return Err(CubbyError::Config(
                "workers.count must be at least 1".to_string(),
            ));
        }
        if self.storage.max_users == 0 || self.storage.max_files_per_user == 0 {
            return Err(CubbyError::Config(
                "storage.max_users and storage.max_files_per_user must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Address string the listener binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Longest payload line an upload may send: the Base64 form of a file
    /// that fills the whole quota, plus the line terminator.
    pub fn max_payload_line_bytes(&self) -> usize {
        let quota = usize::try_from(self.storage.quota_bytes).unwrap_or(usize::MAX);
        quota.div_ceil(3).saturating_mul(4).saturating_add(2)
    }
}
