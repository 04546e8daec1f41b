//! Exit codes for the exynex CLI.
//!
//! Exit codes communicate the run outcome without requiring output parsing.
//!
//! Exit code ranges:
//! - 0-6: Operational outcomes (the run executed; read the outcome from the code)
//! - 10-19: User/environment errors (recoverable by user action)
//! - 20-29: Internal errors (bugs, should be reported)

use exn_common::Error;

/// Exit codes for exynex operations.
///
/// These codes are a stable contract for automation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    // ========================================================================
    // Operational Outcomes (0-6)
    // ========================================================================
    /// Run completed and everything it changed was reverted
    Clean = 0,

    /// A stage failed; teardown reverted the run's changes
    Aborted = 1,

    /// Teardown could not revert everything (firewall or package left behind)
    Dirty = 2,

    /// Cancelled by SIGINT/SIGTERM; teardown ran
    Interrupted = 6,

    // ========================================================================
    // User / Environment Errors (10-19)
    // ========================================================================
    /// Invalid arguments or unreadable APK
    ArgsError = 10,

    /// Required tool missing or failing (adb, aapt, jadx, mitmdump)
    CapabilityError = 11,

    /// Permission denied (sudo, root broker)
    PermissionError = 12,

    /// Invalid configuration file
    ConfigError = 13,

    /// Lock contention (another run targets the same device)
    LockError = 14,

    /// No usable device attached
    DeviceError = 15,

    // ========================================================================
    // Internal Errors (20-29)
    // ========================================================================
    /// Internal error (bug - please report)
    InternalError = 20,

    /// I/O error
    IoError = 21,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Map a run's terminal error to its exit code.
    pub fn for_error(err: &Error) -> Self {
        match err {
            Error::Config(_) => ExitCode::ConfigError,
            Error::BadgingFailed(_) => ExitCode::ArgsError,
            Error::DecompileFailed(_) | Error::Command(_) => ExitCode::CapabilityError,
            Error::DeviceUnavailable(_) => ExitCode::DeviceError,
            Error::HostNetworkSetupFailed(_) => ExitCode::PermissionError,
            Error::RunLocked { .. } => ExitCode::LockError,
            Error::Interrupted => ExitCode::Interrupted,
            Error::NetworkRestoreFailed(_) | Error::UninstallFailed { .. } => ExitCode::Dirty,
            Error::UidResolutionFailed { .. }
            | Error::InstallFailed { .. }
            | Error::LaunchFailed { .. }
            | Error::StopFailed { .. }
            | Error::DeviceNetworkSetupFailed(_)
            | Error::ProxyStartFailed(_) => ExitCode::Aborted,
            Error::CaptureReadFailed { .. } => ExitCode::Clean,
            Error::Io(_) => ExitCode::IoError,
            Error::Json(_) => ExitCode::InternalError,
        }
    }

    /// Whether the run left the device and host as it found them.
    pub fn is_success(self) -> bool {
        self == ExitCode::Clean
    }

    /// Stable symbolic name.
    pub fn code_name(&self) -> &'static str {
        match self {
            ExitCode::Clean => "OK_CLEAN",
            ExitCode::Aborted => "ERR_ABORTED",
            ExitCode::Dirty => "ERR_DIRTY",
            ExitCode::Interrupted => "ERR_INTERRUPTED",
            ExitCode::ArgsError => "ERR_ARGS",
            ExitCode::CapabilityError => "ERR_CAPABILITY",
            ExitCode::PermissionError => "ERR_PERMISSION",
            ExitCode::ConfigError => "ERR_CONFIG",
            ExitCode::LockError => "ERR_LOCK",
            ExitCode::DeviceError => "ERR_DEVICE",
            ExitCode::InternalError => "ERR_INTERNAL",
            ExitCode::IoError => "ERR_IO",
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

impl std::fmt::Display for ExitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.code_name(), self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_only_clean_is_success() {
        assert!(ExitCode::Clean.is_success());
        assert!(!ExitCode::Dirty.is_success());
        assert!(!ExitCode::Interrupted.is_success());
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            ExitCode::for_error(&Error::DeviceUnavailable("none".into())),
            ExitCode::DeviceError
        );
        assert_eq!(
            ExitCode::for_error(&Error::RunLocked {
                path: PathBuf::from("/tmp/exynex-10.0.0.2.lock")
            }),
            ExitCode::LockError
        );
        assert_eq!(
            ExitCode::for_error(&Error::ProxyStartFailed("exited".into())),
            ExitCode::Aborted
        );
        assert_eq!(
            ExitCode::for_error(&Error::NetworkRestoreFailed("nat".into())),
            ExitCode::Dirty
        );
        assert_eq!(ExitCode::for_error(&Error::Interrupted), ExitCode::Interrupted);
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitCode::Aborted.to_string(), "ERR_ABORTED (1)");
        assert_eq!(i32::from(ExitCode::ConfigError), 13);
    }
}
