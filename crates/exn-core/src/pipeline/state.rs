//! Run state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a run is. Declaration order is progress order for the non-terminal
/// states, so `state >= RunState::NetworkIsolated` reads as "isolation was
/// reached".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    DeviceVerified,
    AppInstalled,
    NetworkIsolated,
    Intercepting,
    AppRunning,
    Observing,
    AppStopped,
    NetworkRestored,
    AppUninstalled,
    Complete,
    /// Failure after network isolation; teardown ran.
    Aborted,
    /// Failure before network isolation; teardown ran for what existed.
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Complete | RunState::Aborted | RunState::Failed)
    }

    /// Terminal state for a run that failed after reaching `furthest`.
    pub fn failure_after(furthest: RunState) -> RunState {
        if furthest >= RunState::NetworkIsolated && !furthest.is_terminal() {
            RunState::Aborted
        } else {
            RunState::Failed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::DeviceVerified => "device_verified",
            RunState::AppInstalled => "app_installed",
            RunState::NetworkIsolated => "network_isolated",
            RunState::Intercepting => "intercepting",
            RunState::AppRunning => "app_running",
            RunState::Observing => "observing",
            RunState::AppStopped => "app_stopped",
            RunState::NetworkRestored => "network_restored",
            RunState::AppUninstalled => "app_uninstalled",
            RunState::Complete => "complete",
            RunState::Aborted => "aborted",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_order() {
        assert!(RunState::Idle < RunState::DeviceVerified);
        assert!(RunState::Intercepting > RunState::NetworkIsolated);
        assert!(RunState::AppUninstalled < RunState::Complete);
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(RunState::failure_after(RunState::Idle), RunState::Failed);
        assert_eq!(RunState::failure_after(RunState::AppInstalled), RunState::Failed);
        assert_eq!(RunState::failure_after(RunState::NetworkIsolated), RunState::Aborted);
        assert_eq!(RunState::failure_after(RunState::Observing), RunState::Aborted);
    }

    #[test]
    fn test_display_matches_serde() {
        for state in [RunState::Idle, RunState::NetworkIsolated, RunState::Aborted] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state));
        }
    }
}
