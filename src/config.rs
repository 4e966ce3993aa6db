//! Server configuration.
//!
//! Every tunable has a default; a JSON config file and command-line
//! overrides layer on top. A small whitelist of keys can also be changed
//! at runtime through the admin `ConfigSet` command.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default TCP port for client sessions.
pub const DEFAULT_PORT: u16 = 8080;

/// Default rendezvous point for the admin endpoint.
pub const DEFAULT_ADMIN_SOCKET: &str = "/tmp/codeforge-admin.sock";

/// Server configuration. Durations are stored as whole seconds so the
/// file form stays flat; accessors return [`Duration`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen port for client connections.
    pub port: u16,
    /// Filesystem path of the admin unix socket.
    pub admin_socket: PathBuf,
    /// Root for per-job sandboxes and uploaded sources.
    pub processing_dir: PathBuf,
    /// Root for result artefacts.
    pub outgoing_dir: PathBuf,
    /// Maximum concurrent client sessions.
    pub max_sessions: usize,
    /// Hard cap on queued-plus-retained jobs.
    pub max_queue_size: usize,
    /// Session idle timeout, seconds.
    pub client_timeout: u64,
    /// Admin session idle timeout, seconds.
    pub admin_timeout: u64,
    /// Compile phase wall-clock bound, seconds.
    pub compile_timeout: u64,
    /// Execute phase wall-clock bound, seconds.
    pub execution_timeout: u64,
    /// Maximum uploaded file size, bytes.
    pub max_file_size: u64,
    /// How long terminal jobs are retained for result fetches, seconds.
    pub job_retention: u64,
    /// Interval between maintenance sweeps, seconds.
    pub cleanup_interval: u64,
    /// Age past which temporary files are swept, seconds.
    pub max_file_age: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            admin_socket: PathBuf::from(DEFAULT_ADMIN_SOCKET),
            processing_dir: PathBuf::from("./processing"),
            outgoing_dir: PathBuf::from("./outgoing"),
            max_sessions: 1000,
            max_queue_size: 10_000,
            client_timeout: 300,
            admin_timeout: 1800,
            compile_timeout: 300,
            execution_timeout: 60,
            max_file_size: 4 * 1024 * 1024,
            job_retention: 3600,
            cleanup_interval: 3600,
            max_file_age: 86_400,
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{field} must be non-zero")]
    ZeroField { field: &'static str },

    #[error("{field} must not be empty")]
    EmptyPath { field: &'static str },
}

/// Errors from the admin-facing runtime key interface.
#[derive(Debug, thiserror::Error)]
pub enum ConfigKeyError {
    #[error("unknown configuration key `{0}`")]
    UnknownKey(String),

    #[error("invalid value `{value}` for `{key}`")]
    InvalidValue { key: String, value: String },
}

/// The closed set of keys the admin plane may read and write at runtime.
pub const ADMIN_KEYS: &[&str] = &[
    "client_timeout",
    "admin_timeout",
    "compile_timeout",
    "execution_timeout",
    "max_file_size",
    "job_retention",
    "cleanup_interval",
    "max_file_age",
];

impl ServerConfig {
    /// Load from a JSON file. Missing fields fall back to defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::ZeroField { field: "port" });
        }
        for (field, value) in [
            ("client_timeout", self.client_timeout),
            ("admin_timeout", self.admin_timeout),
            ("compile_timeout", self.compile_timeout),
            ("execution_timeout", self.execution_timeout),
            ("max_file_size", self.max_file_size),
            ("job_retention", self.job_retention),
            ("cleanup_interval", self.cleanup_interval),
            ("max_file_age", self.max_file_age),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroField { field });
            }
        }
        if self.max_sessions == 0 {
            return Err(ConfigError::ZeroField { field: "max_sessions" });
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::ZeroField { field: "max_queue_size" });
        }
        for (field, path) in [
            ("admin_socket", &self.admin_socket),
            ("processing_dir", &self.processing_dir),
            ("outgoing_dir", &self.outgoing_dir),
        ] {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::EmptyPath { field });
            }
        }
        Ok(())
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout)
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_secs(self.admin_timeout)
    }

    pub fn compile_timeout(&self) -> Duration {
        Duration::from_secs(self.compile_timeout)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval)
    }

    pub fn max_file_age(&self) -> Duration {
        Duration::from_secs(self.max_file_age)
    }

    /// Read one admin-visible key.
    pub fn admin_get(&self, key: &str) -> Result<String, ConfigKeyError> {
        let value = match key {
            "client_timeout" => self.client_timeout,
            "admin_timeout" => self.admin_timeout,
            "compile_timeout" => self.compile_timeout,
            "execution_timeout" => self.execution_timeout,
            "max_file_size" => self.max_file_size,
            "job_retention" => self.job_retention,
            "cleanup_interval" => self.cleanup_interval,
            "max_file_age" => self.max_file_age,
            _ => return Err(ConfigKeyError::UnknownKey(key.to_string())),
        };
        Ok(value.to_string())
    }

    /// Write one admin-visible key. Values are whole numbers and must be
    /// non-zero; anything else is rejected without touching the config.
    pub fn admin_set(&mut self, key: &str, value: &str) -> Result<(), ConfigKeyError> {
        let parsed: u64 = value
            .trim()
            .parse()
            .ok()
            .filter(|v| *v != 0)
            .ok_or_else(|| ConfigKeyError::InvalidValue {
                key: key.to_string(),
                value: value.to_string(),
            })?;
        match key {
            "client_timeout" => self.client_timeout = parsed,
            "admin_timeout" => self.admin_timeout = parsed,
            "compile_timeout" => self.compile_timeout = parsed,
            "execution_timeout" => self.execution_timeout = parsed,
            "max_file_size" => self.max_file_size = parsed,
            "job_retention" => self.job_retention = parsed,
            "cleanup_interval" => self.cleanup_interval = parsed,
            "max_file_age" => self.max_file_age = parsed,
            _ => return Err(ConfigKeyError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Render the admin-visible key set with current values.
    pub fn admin_list(&self) -> String {
        let mut out = String::from("Server Configuration:\n");
        for key in ADMIN_KEYS {
            // admin_get cannot fail for a whitelisted key
            if let Ok(value) = self.admin_get(key) {
                out.push_str(&format!("{key}={value}\n"));
            }
        }
        out
    }
}
