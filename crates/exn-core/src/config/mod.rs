//! Run configuration loading and validation.
//!
//! This module handles:
//! - The `config.json` document (tool paths, ports, timeouts)
//! - Config resolution order (CLI > env > XDG > defaults)
//! - Semantic validation (non-zero port and timeouts, poll ≤ timeout)

use crate::exec::duration_ms;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default XDG config directory name.
const CONFIG_DIR_NAME: &str = "exynex";

/// Config file name inside the config directory.
const CONFIG_FILE_NAME: &str = "config.json";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "EXYNEX_CONFIG";

/// Errors that can occur during config loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {path}")]
    NotFound { path: PathBuf },

    #[error("invalid JSON in config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("I/O error reading {path}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<ConfigError> for exn_common::Error {
    fn from(err: ConfigError) -> Self {
        exn_common::Error::Config(err.to_string())
    }
}

/// Paths (or PATH-resolved names) of the external tools a run drives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolPaths {
    pub adb: String,
    pub aapt: String,
    pub jadx: String,
    pub mitmdump: String,
    /// mitmproxy addon that writes the HAR capture.
    pub proxy_script: PathBuf,
    pub sudo: String,
    pub iptables: String,
    pub sysctl: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            adb: "adb".to_string(),
            aapt: "aapt".to_string(),
            jadx: "jadx".to_string(),
            mitmdump: "mitmdump".to_string(),
            proxy_script: PathBuf::from("har_dump.py"),
            sudo: "sudo".to_string(),
            iptables: "iptables".to_string(),
            sysctl: "sysctl".to_string(),
        }
    }
}

/// Complete configuration for one analysis run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub tools: ToolPaths,

    /// Passed to adb as `-s <serial>` when several devices are attached.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adb_serial: Option<String>,

    /// Port the transparent proxy listens on and NAT redirects to.
    pub proxy_port: u16,

    /// Device directory the APK is pushed to before `pm install`.
    pub staging_dir: String,

    #[serde(with = "duration_ms")]
    pub command_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub launch_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub launch_poll_interval: Duration,

    #[serde(with = "duration_ms")]
    pub stop_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub stop_poll_interval: Duration,

    /// How long the proxy must stay alive after spawn to count as started.
    #[serde(with = "duration_ms")]
    pub proxy_settle_delay: Duration,

    /// Time between SIGTERM and SIGKILL when stopping the proxy.
    #[serde(with = "duration_ms")]
    pub proxy_stop_grace: Duration,

    #[serde(with = "duration_ms")]
    pub observe_poll_interval: Duration,

    /// Length of the observation window.
    #[serde(with = "duration_ms")]
    pub activity_time: Duration,

    /// Install with `pm install -g` so runtime permissions are pre-granted.
    pub grant_permissions: bool,

    /// Decompile the APK with jadx before the dynamic run.
    pub decompile: bool,

    #[serde(with = "duration_ms")]
    pub decompile_timeout: Duration,

    /// Directory holding per-device run locks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            tools: ToolPaths::default(),
            adb_serial: None,
            proxy_port: 8080,
            staging_dir: "/data/local/tmp".to_string(),
            command_timeout: Duration::from_secs(120),
            launch_timeout: Duration::from_secs(10),
            launch_poll_interval: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(10),
            stop_poll_interval: Duration::from_millis(500),
            proxy_settle_delay: Duration::from_secs(5),
            proxy_stop_grace: Duration::from_secs(3),
            observe_poll_interval: Duration::from_secs(2),
            activity_time: Duration::from_secs(5),
            grant_permissions: false,
            decompile: true,
            decompile_timeout: Duration::from_secs(600),
            state_dir: None,
        }
    }
}

impl RunConfig {
    /// Check values serde cannot reject on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy_port == 0 {
            return Err(ConfigError::Invalid {
                field: "proxy_port",
                message: "must be non-zero".to_string(),
            });
        }
        if self.staging_dir.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "staging_dir",
                message: "must not be empty".to_string(),
            });
        }

        let non_zero = [
            ("command_timeout", self.command_timeout),
            ("launch_timeout", self.launch_timeout),
            ("launch_poll_interval", self.launch_poll_interval),
            ("stop_timeout", self.stop_timeout),
            ("stop_poll_interval", self.stop_poll_interval),
            ("observe_poll_interval", self.observe_poll_interval),
            ("decompile_timeout", self.decompile_timeout),
        ];
        for (field, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    field,
                    message: "must be greater than zero".to_string(),
                });
            }
        }

        let polls = [
            ("launch_poll_interval", self.launch_poll_interval, self.launch_timeout),
            ("stop_poll_interval", self.stop_poll_interval, self.stop_timeout),
        ];
        for (field, poll, timeout) in polls {
            if poll > timeout {
                return Err(ConfigError::Invalid {
                    field,
                    message: format!(
                        "{}ms exceeds its timeout of {}ms",
                        poll.as_millis(),
                        timeout.as_millis()
                    ),
                });
            }
        }

        Ok(())
    }

    /// Directory for run locks, falling back to the platform state dir.
    pub fn resolved_state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        dirs::state_dir()
            .or_else(dirs::cache_dir)
            .unwrap_or_else(std::env::temp_dir)
            .join(CONFIG_DIR_NAME)
    }
}

/// Resolved configuration with provenance information.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: RunConfig,
    /// File the config was read from (None when defaults were used).
    pub source: Option<PathBuf>,
}

/// Configuration resolution options.
#[derive(Debug, Default)]
pub struct ConfigOptions {
    /// Explicit config file (highest priority).
    pub config_path: Option<PathBuf>,
}

/// Load configuration with the standard resolution order.
///
/// Resolution order (highest to lowest priority):
/// 1. Explicit CLI flag (via ConfigOptions)
/// 2. Environment variable (EXYNEX_CONFIG)
/// 3. XDG config home (~/.config/exynex/config.json)
/// 4. Built-in defaults
pub fn load_config(options: &ConfigOptions) -> Result<ResolvedConfig, ConfigError> {
    let env_path = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
    let xdg_home = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .ok()
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")));

    load_config_from(options, env_path, xdg_home)
}

/// Resolution with the environment supplied by the caller.
pub fn load_config_from(
    options: &ConfigOptions,
    env_path: Option<PathBuf>,
    xdg_home: Option<PathBuf>,
) -> Result<ResolvedConfig, ConfigError> {
    // Explicitly named files must exist; the XDG file is optional.
    let explicit = options.config_path.clone().or(env_path);
    let (config, source) = match explicit {
        Some(path) => (load_config_file(&path)?, Some(path)),
        None => {
            let candidate = xdg_home.map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME));
            match candidate {
                Some(path) if path.exists() => (load_config_file(&path)?, Some(path)),
                _ => (RunConfig::default(), None),
            }
        }
    };

    config.validate()?;
    Ok(ResolvedConfig { config, source })
}

/// Load a config document from a specific file.
pub fn load_config_file(path: &Path) -> Result<RunConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        path: path.to_path_buf(),
        source: e,
    })?;

    serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
        path: path.to_path_buf(),
        source: e,
    })
}
