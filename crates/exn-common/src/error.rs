//! Error types for exynex.
//!
//! Every failure a run can end with has a stable kind name and code, a
//! category, a headline and a remediation hint. The pipeline attaches the
//! originating error to the run outcome, so these are the values automation
//! sees.
//!
//! # Human-Facing Output
//!
//! ```text
//! ✗ Host Network Setup Failed
//!   Reason: host network setup failed: iptables: Permission denied
//!   Fix: Check the sudo password and that iptables is installed on the host.
//! ```
//!
//! # Agent-Facing Output
//!
//! ```json
//! {
//!   "code": 31,
//!   "kind": "host_network_setup_failed",
//!   "category": "network",
//!   "message": "host network setup failed: iptables: Permission denied",
//!   "fatal": true,
//!   "suggested_action": "elevate"
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for exynex operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Configuration and input artifact errors.
    Config,
    /// Device presence, package and app lifecycle errors.
    Device,
    /// Device or host firewall/NAT errors.
    Network,
    /// Interception proxy and capture errors.
    Interception,
    /// Run-level control errors (locking, interruption).
    Run,
    /// File I/O and serialization errors.
    Io,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Device => write!(f, "device"),
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Interception => write!(f, "interception"),
            ErrorCategory::Run => write!(f, "run"),
            ErrorCategory::Io => write!(f, "io"),
        }
    }
}

/// Suggested actions for agents to take in response to errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    /// Retry the run (possibly with backoff).
    Retry,
    /// Run the `check` command.
    RunCheck,
    /// Reconnect or restart the device.
    Reconnect,
    /// Wait for another run to finish.
    Wait,
    /// Request elevated privileges.
    Elevate,
    /// Inspect the device or host by hand.
    ManualIntervention,
    /// No action needed (informational).
    None,
}

impl std::fmt::Display for SuggestedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SuggestedAction::Retry => write!(f, "retry"),
            SuggestedAction::RunCheck => write!(f, "run_check"),
            SuggestedAction::Reconnect => write!(f, "reconnect"),
            SuggestedAction::Wait => write!(f, "wait"),
            SuggestedAction::Elevate => write!(f, "elevate"),
            SuggestedAction::ManualIntervention => write!(f, "manual_intervention"),
            SuggestedAction::None => write!(f, "none"),
        }
    }
}

/// Unified error type for exynex.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration and input errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to read apk badging: {0}")]
    BadgingFailed(String),

    #[error("decompilation failed: {0}")]
    DecompileFailed(String),

    // Device errors (20-29)
    #[error("no device available: {0}")]
    DeviceUnavailable(String),

    #[error("could not resolve uid for package {package}")]
    UidResolutionFailed { package: String },

    #[error("installation of {package} failed: {reason}")]
    InstallFailed { package: String, reason: String },

    #[error("launch of {package} failed: {reason}")]
    LaunchFailed { package: String, reason: String },

    #[error("{package} (pid {pid}) is still running after stop")]
    StopFailed { package: String, pid: u32 },

    #[error("uninstallation of {package} failed: {reason}")]
    UninstallFailed { package: String, reason: String },

    // Network errors (30-39)
    #[error("device network setup failed: {0}")]
    DeviceNetworkSetupFailed(String),

    #[error("host network setup failed: {0}")]
    HostNetworkSetupFailed(String),

    #[error("network restore failed: {0}")]
    NetworkRestoreFailed(String),

    // Interception errors (40-49)
    #[error("interception proxy failed to start: {0}")]
    ProxyStartFailed(String),

    #[error("capture {path} could not be read: {reason}")]
    CaptureReadFailed { path: PathBuf, reason: String },

    // Run control errors (50-59)
    #[error("run interrupted by termination signal")]
    Interrupted,

    #[error("another run holds the device lock {path}")]
    RunLocked { path: PathBuf },

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("external command failed: {0}")]
    Command(String),
}

impl Error {
    /// Returns the stable error code.
    ///
    /// - 10-19: Configuration and input errors
    /// - 20-29: Device errors
    /// - 30-39: Network errors
    /// - 40-49: Interception errors
    /// - 50-59: Run control errors
    /// - 60-69: I/O errors
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::BadgingFailed(_) => 11,
            Error::DecompileFailed(_) => 12,
            Error::DeviceUnavailable(_) => 20,
            Error::UidResolutionFailed { .. } => 21,
            Error::InstallFailed { .. } => 22,
            Error::LaunchFailed { .. } => 23,
            Error::StopFailed { .. } => 24,
            Error::UninstallFailed { .. } => 25,
            Error::DeviceNetworkSetupFailed(_) => 30,
            Error::HostNetworkSetupFailed(_) => 31,
            Error::NetworkRestoreFailed(_) => 32,
            Error::ProxyStartFailed(_) => 40,
            Error::CaptureReadFailed { .. } => 41,
            Error::Interrupted => 50,
            Error::RunLocked { .. } => 51,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
            Error::Command(_) => 62,
        }
    }

    /// Stable snake_case name of the error kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::BadgingFailed(_) => "badging_failed",
            Error::DecompileFailed(_) => "decompile_failed",
            Error::DeviceUnavailable(_) => "device_unavailable",
            Error::UidResolutionFailed { .. } => "uid_resolution_failed",
            Error::InstallFailed { .. } => "install_failed",
            Error::LaunchFailed { .. } => "launch_failed",
            Error::StopFailed { .. } => "stop_failed",
            Error::UninstallFailed { .. } => "uninstall_failed",
            Error::DeviceNetworkSetupFailed(_) => "device_network_setup_failed",
            Error::HostNetworkSetupFailed(_) => "host_network_setup_failed",
            Error::NetworkRestoreFailed(_) => "network_restore_failed",
            Error::ProxyStartFailed(_) => "proxy_start_failed",
            Error::CaptureReadFailed { .. } => "capture_read_failed",
            Error::Interrupted => "interrupted",
            Error::RunLocked { .. } => "run_locked",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Command(_) => "command",
        }
    }

    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::BadgingFailed(_) | Error::DecompileFailed(_) => {
                ErrorCategory::Config
            }

            Error::DeviceUnavailable(_)
            | Error::UidResolutionFailed { .. }
            | Error::InstallFailed { .. }
            | Error::LaunchFailed { .. }
            | Error::StopFailed { .. }
            | Error::UninstallFailed { .. } => ErrorCategory::Device,

            Error::DeviceNetworkSetupFailed(_)
            | Error::HostNetworkSetupFailed(_)
            | Error::NetworkRestoreFailed(_) => ErrorCategory::Network,

            Error::ProxyStartFailed(_) | Error::CaptureReadFailed { .. } => {
                ErrorCategory::Interception
            }

            Error::Interrupted | Error::RunLocked { .. } => ErrorCategory::Run,

            Error::Io(_) | Error::Json(_) | Error::Command(_) => ErrorCategory::Io,
        }
    }

    /// Whether this error aborts a run.
    ///
    /// A missing or unreadable capture is the only failure a run recovers
    /// from locally: it continues with an empty capture.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::CaptureReadFailed { .. })
    }

    /// Returns the suggested action for agents.
    pub fn suggested_action(&self) -> SuggestedAction {
        match self {
            Error::Config(_) => SuggestedAction::RunCheck,
            Error::BadgingFailed(_) => SuggestedAction::RunCheck,
            Error::DecompileFailed(_) => SuggestedAction::RunCheck,

            Error::DeviceUnavailable(_) => SuggestedAction::Reconnect,
            Error::UidResolutionFailed { .. } => SuggestedAction::Retry,
            Error::InstallFailed { .. } => SuggestedAction::ManualIntervention,
            Error::LaunchFailed { .. } => SuggestedAction::Retry,
            Error::StopFailed { .. } => SuggestedAction::ManualIntervention,
            Error::UninstallFailed { .. } => SuggestedAction::ManualIntervention,

            Error::DeviceNetworkSetupFailed(_) => SuggestedAction::Elevate,
            Error::HostNetworkSetupFailed(_) => SuggestedAction::Elevate,
            Error::NetworkRestoreFailed(_) => SuggestedAction::ManualIntervention,

            Error::ProxyStartFailed(_) => SuggestedAction::RunCheck,
            Error::CaptureReadFailed { .. } => SuggestedAction::None,

            Error::Interrupted => SuggestedAction::Retry,
            Error::RunLocked { .. } => SuggestedAction::Wait,

            Error::Io(_) => SuggestedAction::Retry,
            Error::Json(_) => SuggestedAction::ManualIntervention,
            Error::Command(_) => SuggestedAction::RunCheck,
        }
    }

    /// Returns a human-readable remediation hint.
    pub fn remediation(&self) -> &'static str {
        match self {
            Error::Config(_) => {
                "Run 'exynex check' to validate configuration, or fix the syntax of config.json."
            }
            Error::BadgingFailed(_) => {
                "Make sure aapt is on PATH and the file is a valid APK."
            }
            Error::DecompileFailed(_) => {
                "Make sure jadx is installed and the configured jadx path is executable."
            }

            Error::DeviceUnavailable(_) => {
                "Connect a device or start an emulator and confirm it is listed by 'adb devices'."
            }
            Error::UidResolutionFailed { .. } => {
                "Confirm the package is installed with 'adb shell dumpsys package <name>'."
            }
            Error::InstallFailed { .. } => {
                "Check that the device is rooted, has free space and accepts side-loaded packages."
            }
            Error::LaunchFailed { .. } => {
                "The app did not start. Check logcat for a crash on launch and retry."
            }
            Error::StopFailed { .. } => {
                "The app survived force-stop. Stop it by hand before starting another run."
            }
            Error::UninstallFailed { .. } => {
                "Remove the package by hand with 'adb shell pm uninstall <name>'."
            }

            Error::DeviceNetworkSetupFailed(_) => {
                "The device firewall could not be changed. Check the root broker grants shell access."
            }
            Error::HostNetworkSetupFailed(_) => {
                "Check the sudo password and that iptables and sysctl are available on the host."
            }
            Error::NetworkRestoreFailed(_) => {
                "Restore firewall state by hand: 'iptables -P OUTPUT ACCEPT' on the device and 'iptables -t nat -F' on both sides."
            }

            Error::ProxyStartFailed(_) => {
                "Make sure mitmdump is installed, the addon script exists and the listen port is free."
            }
            Error::CaptureReadFailed { .. } => {
                "The run completed with an empty capture. Check the proxy addon output path."
            }

            Error::Interrupted => "The run was cancelled and its device and host changes were reverted.",
            Error::RunLocked { .. } => {
                "Only one run per device is supported. Wait for the other run to finish."
            }

            Error::Io(_) => {
                "Check disk space, permissions, and that output directories exist. Retry the run."
            }
            Error::Json(_) => "A JSON document could not be encoded or decoded.",
            Error::Command(_) => {
                "Run 'exynex check' to confirm adb, aapt and mitmdump resolve on PATH."
            }
        }
    }

    /// Returns a short headline for human-readable output.
    pub fn headline(&self) -> &'static str {
        match self {
            Error::Config(_) => "Configuration Error",
            Error::BadgingFailed(_) => "APK Badging Failed",
            Error::DecompileFailed(_) => "Decompilation Failed",
            Error::DeviceUnavailable(_) => "Device Unavailable",
            Error::UidResolutionFailed { .. } => "UID Resolution Failed",
            Error::InstallFailed { .. } => "Install Failed",
            Error::LaunchFailed { .. } => "Launch Failed",
            Error::StopFailed { .. } => "Stop Failed",
            Error::UninstallFailed { .. } => "Uninstall Failed",
            Error::DeviceNetworkSetupFailed(_) => "Device Network Setup Failed",
            Error::HostNetworkSetupFailed(_) => "Host Network Setup Failed",
            Error::NetworkRestoreFailed(_) => "Network Restore Failed",
            Error::ProxyStartFailed(_) => "Proxy Start Failed",
            Error::CaptureReadFailed { .. } => "Capture Read Failed",
            Error::Interrupted => "Run Interrupted",
            Error::RunLocked { .. } => "Device Busy",
            Error::Io(_) => "I/O Error",
            Error::Json(_) => "JSON Error",
            Error::Command(_) => "Command Failed",
        }
    }
}

/// Structured error for the run outcome document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    /// Stable error code.
    pub code: u32,

    /// Stable kind name.
    pub kind: String,

    /// Error category for grouping.
    pub category: ErrorCategory,

    /// Human-readable error message.
    pub message: String,

    /// Whether the error aborted the run.
    pub fatal: bool,

    /// Suggested action for agents.
    pub suggested_action: SuggestedAction,

    /// Additional structured context (package, pid, path).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

impl From<&Error> for StructuredError {
    fn from(err: &Error) -> Self {
        let mut context = HashMap::new();

        match err {
            Error::UidResolutionFailed { package }
            | Error::InstallFailed { package, .. }
            | Error::LaunchFailed { package, .. }
            | Error::UninstallFailed { package, .. } => {
                context.insert("package".to_string(), serde_json::json!(package));
            }
            Error::StopFailed { package, pid } => {
                context.insert("package".to_string(), serde_json::json!(package));
                context.insert("pid".to_string(), serde_json::json!(pid));
            }
            Error::CaptureReadFailed { path, .. } | Error::RunLocked { path } => {
                context.insert("path".to_string(), serde_json::json!(path));
            }
            _ => {}
        }

        StructuredError {
            code: err.code(),
            kind: err.kind_name().to_string(),
            category: err.category(),
            message: err.to_string(),
            fatal: err.is_fatal(),
            suggested_action: err.suggested_action(),
            context,
        }
    }
}

impl StructuredError {
    /// Add additional context to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"error":"serialization_failed"}}"#, self.code)
        })
    }
}

/// Format an error for human-readable stderr output.
///
/// ```text
/// ✗ [Headline]
///   Reason: [Error message]
///   Fix: [Remediation hint]
/// ```
pub fn format_error_human(err: &Error, use_color: bool) -> String {
    let (red, cyan, reset) = if use_color {
        ("\x1b[31m", "\x1b[36m", "\x1b[0m")
    } else {
        ("", "", "")
    };

    format!(
        "{red}✗{reset} {headline}\n  Reason: {message}\n  {cyan}Fix:{reset} {remediation}",
        red = red,
        cyan = cyan,
        reset = reset,
        headline = err.headline(),
        message = err,
        remediation = err.remediation()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        assert_eq!(Error::Config("test".into()).code(), 10);
        assert_eq!(Error::DeviceUnavailable("none".into()).code(), 20);
        assert_eq!(Error::HostNetworkSetupFailed("x".into()).code(), 31);
        assert_eq!(Error::Interrupted.code(), 50);
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            Error::StopFailed {
                package: "a.b".into(),
                pid: 1
            }
            .category(),
            ErrorCategory::Device
        );
        assert_eq!(
            Error::DeviceNetworkSetupFailed("x".into()).category(),
            ErrorCategory::Network
        );
        assert_eq!(
            Error::ProxyStartFailed("x".into()).category(),
            ErrorCategory::Interception
        );
    }

    #[test]
    fn test_only_capture_read_is_non_fatal() {
        let capture = Error::CaptureReadFailed {
            path: PathBuf::from("/tmp/dump.har"),
            reason: "missing".into(),
        };
        assert!(!capture.is_fatal());
        assert!(Error::ProxyStartFailed("exited".into()).is_fatal());
        assert!(Error::UidResolutionFailed {
            package: "a.b".into()
        }
        .is_fatal());
        assert!(Error::Interrupted.is_fatal());
    }

    #[test]
    fn test_suggested_action() {
        assert_eq!(
            Error::RunLocked {
                path: PathBuf::from("/tmp/x.lock")
            }
            .suggested_action(),
            SuggestedAction::Wait
        );
        assert_eq!(
            Error::DeviceUnavailable("none".into()).suggested_action(),
            SuggestedAction::Reconnect
        );
    }

    #[test]
    fn test_structured_error_carries_kind_and_context() {
        let err = Error::StopFailed {
            package: "com.example.app".into(),
            pid: 4242,
        };
        let structured = StructuredError::from(&err);

        assert_eq!(structured.code, 24);
        assert_eq!(structured.kind, "stop_failed");
        assert!(structured.fatal);
        assert_eq!(
            structured.context.get("pid"),
            Some(&serde_json::json!(4242))
        );
        assert_eq!(
            structured.context.get("package"),
            Some(&serde_json::json!("com.example.app"))
        );
    }

    #[test]
    fn test_structured_error_json() {
        let err = Error::HostNetworkSetupFailed("iptables: Permission denied".into());
        let json = StructuredError::from(&err).to_json();

        assert!(json.contains(r#""code":31"#));
        assert!(json.contains(r#""kind":"host_network_setup_failed""#));
        assert!(json.contains(r#""category":"network""#));
        assert!(json.contains(r#""suggested_action":"elevate""#));
    }

    #[test]
    fn test_format_error_human() {
        let err = Error::UninstallFailed {
            package: "com.example.app".into(),
            reason: "Failure [DELETE_FAILED_INTERNAL_ERROR]".into(),
        };
        let formatted = format_error_human(&err, false);

        assert!(formatted.contains("Uninstall Failed"));
        assert!(formatted.contains("uninstallation of com.example.app failed"));
        assert!(formatted.contains("pm uninstall"));
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::Network.to_string(), "network");
        assert_eq!(ErrorCategory::Interception.to_string(), "interception");
    }
}
