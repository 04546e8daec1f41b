//! The document a run produces.

use crate::apk::{ApkBadging, DecompiledTree};
use crate::device::{Device, TargetApp};
use crate::exit_codes::ExitCode;
use crate::logging::events::LogEvent;
use crate::observe::ObservationWindow;
use crate::pipeline::context::StateTransition;
use crate::pipeline::state::RunState;
use crate::proxy::CaptureData;
use chrono::{DateTime, Utc};
use exn_common::{Error, RunId, StructuredError};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// How the observation window went.
#[derive(Debug, Clone, Serialize)]
pub struct ObservationSummary {
    pub window: ObservationWindow,
    #[serde(with = "crate::exec::duration_ms", rename = "blocked_ms")]
    pub blocked: Duration,
    pub cancelled: bool,
}

/// Everything known about a finished run.
#[derive(Debug, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub apk: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badging: Option<ApkBadging>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decompiled: Option<DecompiledTree>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<Device>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetApp>,
    pub final_state: RunState,
    pub states: Vec<StateTransition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observation: Option<ObservationSummary>,
    pub capture: CaptureData,
    pub events: Vec<LogEvent>,
    /// The error that ended the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StructuredError>,
    /// Teardown steps that failed on top of `error`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub teardown_errors: Vec<StructuredError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip)]
    pub failure: Option<Error>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.final_state == RunState::Complete && self.failure.is_none()
    }

    /// Process exit code for this outcome.
    ///
    /// A clean run whose teardown left state behind is still reported as dirty.
    pub fn exit_code(&self) -> ExitCode {
        match &self.failure {
            Some(err) => ExitCode::for_error(err),
            None if !self.teardown_errors.is_empty() => ExitCode::Dirty,
            None => ExitCode::Clean,
        }
    }

    pub fn to_json_pretty(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// One-line human summary.
    pub fn summary_line(&self) -> String {
        let package = self
            .target
            .as_ref()
            .map(|t| t.package.as_str())
            .or_else(|| self.badging.as_ref().map(|b| b.package.as_str()))
            .unwrap_or("-");
        match &self.error {
            Some(err) => format!(
                "{} {} {}: {} ({} requests captured)",
                self.run_id,
                package,
                self.final_state,
                err.message,
                self.capture.len()
            ),
            None => format!(
                "{} {} {}: {} requests to {} hosts",
                self.run_id,
                package,
                self.final_state,
                self.capture.len(),
                self.capture.hosts().len()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn outcome(final_state: RunState) -> RunOutcome {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        RunOutcome {
            run_id: RunId::new(),
            apk: PathBuf::from("/tmp/app.apk"),
            badging: None,
            decompiled: None,
            device: None,
            target: Some(TargetApp::new("com.example.tracker")),
            final_state,
            states: Vec::new(),
            observation: None,
            capture: CaptureData::default(),
            events: Vec::new(),
            error: None,
            teardown_errors: Vec::new(),
            started_at: at,
            finished_at: at,
            failure: None,
        }
    }

    #[test]
    fn test_exit_code_follows_failure_then_teardown() {
        let mut run = outcome(RunState::Complete);
        assert!(run.is_success());
        assert_eq!(run.exit_code(), ExitCode::Clean);

        let leftover = Error::NetworkRestoreFailed("iptables -t nat -F".into());
        run.teardown_errors.push(StructuredError::from(&leftover));
        assert_eq!(run.exit_code(), ExitCode::Dirty);

        run.final_state = RunState::Aborted;
        run.failure = Some(Error::ProxyStartFailed("exited".into()));
        assert!(!run.is_success());
        assert_eq!(run.exit_code(), ExitCode::Aborted);
    }

    #[test]
    fn test_summary_and_json_omit_empty_parts() {
        let mut run = outcome(RunState::Failed);
        let err = Error::DeviceUnavailable("adb devices lists no device".into());
        run.error = Some(StructuredError::from(&err));
        run.failure = Some(err);

        assert!(run
            .summary_line()
            .contains("com.example.tracker failed: no device available"));

        let json: serde_json::Value = serde_json::from_str(&run.to_json_pretty().unwrap()).unwrap();
        assert_eq!(json["final_state"], "failed");
        assert!(json.get("teardown_errors").is_none());
        assert!(json.get("failure").is_none());
        assert!(json.get("observation").is_none());
    }
}
