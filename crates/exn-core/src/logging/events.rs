//! Stage events.
//!
//! A [`LogEvent`] is both a log line and an entry in the run outcome's
//! `events` list, so its JSON shape is part of the outcome document.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// Coarse phase of a run an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Locking and startup.
    Init,
    /// APK badging and decompilation.
    Prepare,
    Device,
    /// Install and uid resolution.
    Install,
    /// Device and host firewall changes.
    Network,
    /// Interception proxy lifecycle.
    Intercept,
    Launch,
    Observe,
    /// Reverse-order release of everything the run acquired.
    Teardown,
    /// Outcome assembly.
    Report,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::Prepare => "prepare",
            Stage::Device => "device",
            Stage::Install => "install",
            Stage::Network => "network",
            Stage::Intercept => "intercept",
            Stage::Launch => "launch",
            Stage::Observe => "observe",
            Stage::Teardown => "teardown",
            Stage::Report => "report",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable event names; automation keys on these.
pub mod event_names {
    pub const RUN_STARTED: &str = "run.started";
    pub const RUN_FINISHED: &str = "run.finished";
    pub const RUN_ABORTED: &str = "run.aborted";
    pub const RUN_INTERRUPTED: &str = "run.interrupted";
    pub const STATE_ENTERED: &str = "state.entered";
    pub const LOCK_ACQUIRED: &str = "lock.acquired";

    pub const BADGING_PARSED: &str = "badging.parsed";
    pub const DECOMPILE_FINISHED: &str = "decompile.finished";
    pub const DECOMPILE_SKIPPED: &str = "decompile.skipped";

    pub const DEVICE_VERIFIED: &str = "device.verified";
    pub const APP_INSTALLED: &str = "app.installed";
    pub const APP_ALREADY_INSTALLED: &str = "app.already_installed";
    pub const UID_RESOLVED: &str = "uid.resolved";

    pub const NETWORK_APPLIED: &str = "network.applied";
    pub const NETWORK_ROLLED_BACK: &str = "network.rolled_back";
    pub const NETWORK_CLEARED: &str = "network.cleared";

    pub const PROXY_STARTED: &str = "proxy.started";
    pub const PROXY_STOPPED: &str = "proxy.stopped";
    pub const CAPTURE_READ: &str = "capture.read";
    /// Non-fatal: the run continues with an empty capture.
    pub const CAPTURE_READ_FAILED: &str = "capture.read_failed";

    pub const APP_LAUNCHED: &str = "app.launched";
    pub const APP_STOPPED: &str = "app.stopped";
    pub const APP_UNINSTALLED: &str = "app.uninstalled";

    pub const OBSERVE_STARTED: &str = "observe.started";
    pub const OBSERVE_FINISHED: &str = "observe.finished";

    pub const TEARDOWN_STEP_FAILED: &str = "teardown.step_failed";
}

/// One stage event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// Set from the run's clock when recorded.
    pub ts: DateTime<Utc>,
    pub level: Level,
    /// One of [`event_names`].
    pub event: String,
    pub run_id: String,
    pub stage: Stage,
    pub host_id: String,
    /// Device IP, once the run knows it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    pub message: String,
    /// Event-specific details, ordered by key.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl LogEvent {
    /// Attach a detail. Values that do not serialize are dropped.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.fields.insert(key.into(), v);
        }
        self
    }
}

/// Correlation ids shared by every event of one run.
#[derive(Debug, Clone)]
pub struct LogContext {
    pub run_id: String,
    pub host_id: String,
    pub device: Option<String>,
}

impl LogContext {
    pub fn new(run_id: impl Into<String>, host_id: impl Into<String>) -> Self {
        LogContext {
            run_id: run_id.into(),
            host_id: host_id.into(),
            device: None,
        }
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    fn event(&self, level: Level, event: &str, stage: Stage, message: impl Into<String>) -> LogEvent {
        LogEvent {
            ts: Utc::now(),
            level,
            event: event.to_string(),
            run_id: self.run_id.clone(),
            stage,
            host_id: self.host_id.clone(),
            device: self.device.clone(),
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn info(&self, event: &str, stage: Stage, message: impl Into<String>) -> LogEvent {
        self.event(Level::Info, event, stage, message)
    }

    pub fn debug(&self, event: &str, stage: Stage, message: impl Into<String>) -> LogEvent {
        self.event(Level::Debug, event, stage, message)
    }

    pub fn warn(&self, event: &str, stage: Stage, message: impl Into<String>) -> LogEvent {
        self.event(Level::Warn, event, stage, message)
    }

    pub fn error(&self, event: &str, stage: Stage, message: impl Into<String>) -> LogEvent {
        self.event(Level::Error, event, stage, message)
    }
}
