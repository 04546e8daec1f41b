//! Where log verbosity and format come from.
//!
//! Precedence, highest first: CLI flags (`-v`, `--quiet`, `--log-format`),
//! `EXYNEX_LOG` / `EXYNEX_LOG_FORMAT`, `RUST_LOG`, built-in defaults.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Level for exynex's own log lines.
pub const LOG_ENV: &str = "EXYNEX_LOG";

/// `human` or `jsonl`.
pub const LOG_FORMAT_ENV: &str = "EXYNEX_LOG_FORMAT";

/// Raw `tracing` filter directives, used only when nothing else is set.
pub const RUST_LOG_ENV: &str = "RUST_LOG";

/// Crates whose spans and events exynex emits.
const OWN_TARGETS: [&str; 2] = ["exn_core", "exynex"];

/// Shape of each line on stderr.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Console lines for a person watching the run.
    #[default]
    Human,
    /// One JSON object per line.
    Jsonl,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "human" | "pretty" | "console" => Ok(LogFormat::Human),
            "jsonl" | "json" => Ok(LogFormat::Jsonl),
            other => Err(format!("unknown log format `{}` (human, jsonl)", other)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogFormat::Human => "human",
            LogFormat::Jsonl => "jsonl",
        })
    }
}

/// Minimum level for exynex's own targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Off,
}

impl LogLevel {
    const NAMES: [(&'static str, LogLevel); 8] = [
        ("trace", LogLevel::Trace),
        ("debug", LogLevel::Debug),
        ("info", LogLevel::Info),
        ("warn", LogLevel::Warn),
        ("warning", LogLevel::Warn),
        ("error", LogLevel::Error),
        ("off", LogLevel::Off),
        ("quiet", LogLevel::Off),
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Off => "off",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::NAMES
            .iter()
            .find(|(name, _)| *name == wanted)
            .map(|(_, level)| *level)
            .ok_or_else(|| format!("unknown log level `{}`", s))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resolved logging setup for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub format: LogFormat,
    pub level: LogLevel,
    /// `RUST_LOG` directives, kept verbatim when no level was chosen explicitly.
    pub directives: Option<String>,
    /// Human lines carry a timestamp.
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Human,
            level: LogLevel::Info,
            directives: None,
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Resolve from the process environment and CLI overrides.
    pub fn from_env(cli_level: Option<LogLevel>, cli_format: Option<LogFormat>) -> Self {
        let var = |name: &str| std::env::var(name).ok();
        Self::from_values(
            var(LOG_ENV).as_deref(),
            var(RUST_LOG_ENV).as_deref(),
            var(LOG_FORMAT_ENV).as_deref(),
            cli_level,
            cli_format,
        )
    }

    /// Resolve with the environment supplied by the caller.
    ///
    /// Unparseable values are ignored rather than rejected; logging must come
    /// up before anything can report an error.
    pub fn from_values(
        exynex_log: Option<&str>,
        rust_log: Option<&str>,
        log_format: Option<&str>,
        cli_level: Option<LogLevel>,
        cli_format: Option<LogFormat>,
    ) -> Self {
        let env_level = exynex_log.and_then(|v| v.parse().ok());
        let level = cli_level.or(env_level);
        let directives = match level {
            Some(_) => None,
            None => rust_log
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
        };

        Self {
            format: cli_format
                .or_else(|| log_format.and_then(|v| v.parse().ok()))
                .unwrap_or_default(),
            level: level.unwrap_or_default(),
            directives,
            ..Self::default()
        }
    }

    /// Level implied by `-v` repetitions and `--quiet`.
    pub fn level_from_verbosity(verbose: u8, quiet: bool) -> Option<LogLevel> {
        match (quiet, verbose) {
            (true, _) => Some(LogLevel::Error),
            (false, 0) => None,
            (false, 1) => Some(LogLevel::Debug),
            (false, _) => Some(LogLevel::Trace),
        }
    }

    /// `EnvFilter` directives for this config.
    ///
    /// Only exynex's own targets get the chosen level; everything else stays
    /// at `warn` so dependency chatter never drowns the run log.
    pub fn filter_directives(&self) -> String {
        if let Some(raw) = &self.directives {
            return raw.clone();
        }
        let mut parts = vec![LogLevel::Warn.max(self.level).as_str().to_string()];
        parts.extend(
            OWN_TARGETS
                .iter()
                .map(|target| format!("{}={}", target, self.level)),
        );
        parts.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_names() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Jsonl);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Human);
        assert!("yaml".parse::<LogFormat>().is_err());

        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!(" Debug ".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("quiet".parse::<LogLevel>().unwrap(), LogLevel::Off);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_defaults() {
        let config = LogConfig::from_values(None, None, None, None, None);
        assert_eq!(config, LogConfig::default());
        assert_eq!(config.filter_directives(), "warn,exn_core=info,exynex=info");
    }

    #[test]
    fn test_exynex_log_beats_rust_log() {
        let config = LogConfig::from_values(Some("debug"), Some("hyper=trace"), None, None, None);
        assert_eq!(config.level, LogLevel::Debug);
        assert!(config.directives.is_none());
        assert_eq!(config.filter_directives(), "warn,exn_core=debug,exynex=debug");
    }

    #[test]
    fn test_rust_log_is_passed_through() {
        let config = LogConfig::from_values(None, Some("exn_core::network=trace"), None, None, None);
        assert_eq!(config.filter_directives(), "exn_core::network=trace");

        let config = LogConfig::from_values(Some("nonsense"), Some("  "), None, None, None);
        assert_eq!(config.level, LogLevel::Info);
        assert!(config.directives.is_none());
    }

    #[test]
    fn test_cli_overrides_env() {
        let config = LogConfig::from_values(
            Some("error"),
            Some("trace"),
            Some("human"),
            Some(LogLevel::Trace),
            Some(LogFormat::Jsonl),
        );
        assert_eq!(config.level, LogLevel::Trace);
        assert_eq!(config.format, LogFormat::Jsonl);
        assert!(config.directives.is_none());
    }

    #[test]
    fn test_quiet_level_silences_dependencies_too() {
        let config = LogConfig::from_values(None, None, Some("jsonl"), Some(LogLevel::Error), None);
        assert_eq!(config.format, LogFormat::Jsonl);
        assert_eq!(config.filter_directives(), "error,exn_core=error,exynex=error");
    }

    #[test]
    fn test_level_from_verbosity() {
        assert_eq!(LogConfig::level_from_verbosity(0, false), None);
        assert_eq!(LogConfig::level_from_verbosity(1, false), Some(LogLevel::Debug));
        assert_eq!(LogConfig::level_from_verbosity(3, false), Some(LogLevel::Trace));
        assert_eq!(LogConfig::level_from_verbosity(2, true), Some(LogLevel::Error));
    }
}
