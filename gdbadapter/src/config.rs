/// Debugger session configuration
///
/// Defaults start `gdb --interpreter=mi2 -q`. Values can be read from a JSON
/// file and overlaid from the environment.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const ENV_GDB: &str = "GDBPILOT_GDB";
pub const ENV_TIMEOUT_MS: &str = "GDBPILOT_TIMEOUT_MS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid config file: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Debugger executable
    pub gdb_path: PathBuf,
    /// Arguments selecting MI mode; replace them to drive a GDB-compatible tool
    pub gdb_args: Vec<String>,
    /// Default budget for a single command round trip, in milliseconds
    pub exec_timeout_ms: u64,
    /// Size of a single read from the debugger's stdout
    pub read_chunk: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gdb_path: PathBuf::from("gdb"),
            gdb_args: vec!["--interpreter=mi2".to_string(), "-q".to_string()],
            exec_timeout_ms: 5_000,
            read_chunk: 4096,
        }
    }
}

impl Config {
    /// Load a JSON config file; missing keys keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Defaults overlaid with the environment
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    /// Overlay `GDBPILOT_GDB` and `GDBPILOT_TIMEOUT_MS` when set
    pub fn with_env(self) -> Result<Self> {
        self.with_vars(|name| std::env::var(name).ok())
    }

    fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(gdb) = var(ENV_GDB) {
            self.gdb_path = PathBuf::from(gdb);
        }
        if let Some(timeout) = var(ENV_TIMEOUT_MS) {
            self.exec_timeout_ms = timeout.parse().map_err(|_| ConfigError::InvalidEnv {
                name: ENV_TIMEOUT_MS,
                value: timeout,
            })?;
        }
        Ok(self)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }
}
