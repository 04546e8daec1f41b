//! Per-run state threaded through the pipeline.

use crate::cancel::CancelToken;
use crate::config::RunConfig;
use crate::log_event;
use crate::logging::events::{Level, LogContext, LogEvent};
use crate::network::HostPrivilege;
use crate::pipeline::state::RunState;
use chrono::{DateTime, Utc};
use exn_common::RunId;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A state the run entered, with when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub state: RunState,
    pub at: DateTime<Utc>,
}

/// Configuration, correlation ids, cancellation and the stage record.
#[derive(Debug)]
pub struct RunContext {
    pub run_id: RunId,
    pub config: RunConfig,
    pub log: LogContext,
    pub cancel: CancelToken,
    pub host_privilege: HostPrivilege,
    /// Holds the capture, the proxy log and decompiled output.
    pub workdir: PathBuf,
    events: Vec<LogEvent>,
    states: Vec<StateTransition>,
}

impl RunContext {
    pub fn new(
        run_id: RunId,
        config: RunConfig,
        host_id: impl Into<String>,
        cancel: CancelToken,
        host_privilege: HostPrivilege,
        workdir: PathBuf,
    ) -> Self {
        let log = LogContext::new(run_id.as_str(), host_id);
        Self {
            run_id,
            config,
            log,
            cancel,
            host_privilege,
            workdir,
            events: Vec::new(),
            states: Vec::new(),
        }
    }

    /// Emit `event` through tracing and keep it for the outcome.
    pub fn record(&mut self, event: LogEvent) {
        let ctx = &self.log;
        let fields = if event.fields.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&event.fields).unwrap_or_default()
        };
        let name = event.event.as_str();
        match event.level {
            Level::Error => log_event!(ctx, ERROR, name, event.stage, &event.message, fields = fields.as_str()),
            Level::Warn => log_event!(ctx, WARN, name, event.stage, &event.message, fields = fields.as_str()),
            Level::Info => log_event!(ctx, INFO, name, event.stage, &event.message, fields = fields.as_str()),
            Level::Debug => {
                log_event!(ctx, DEBUG, name, event.stage, &event.message, fields = fields.as_str())
            }
        }
        self.events.push(event);
    }

    pub fn enter(&mut self, state: RunState, at: DateTime<Utc>) {
        self.states.push(StateTransition { state, at });
    }

    /// Furthest non-terminal state reached.
    pub fn furthest_state(&self) -> RunState {
        self.states
            .iter()
            .map(|t| t.state)
            .filter(|s| !s.is_terminal())
            .max()
            .unwrap_or(RunState::Idle)
    }

    pub fn current_state(&self) -> RunState {
        self.states.last().map_or(RunState::Idle, |t| t.state)
    }

    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    pub fn states(&self) -> &[StateTransition] {
        &self.states
    }

    /// Hand the stage record over to the outcome.
    pub fn into_record(self) -> (Vec<StateTransition>, Vec<LogEvent>) {
        (self.states, self.events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::events::{event_names, Stage};

    fn ctx() -> RunContext {
        RunContext::new(
            RunId::new(),
            RunConfig::default(),
            "host-test",
            CancelToken::new(),
            HostPrivilege::NonInteractive,
            PathBuf::from("/tmp/exynex-test"),
        )
    }

    #[test]
    fn test_record_keeps_events_in_order() {
        let mut ctx = ctx();
        let first = ctx.log.info(event_names::RUN_STARTED, Stage::Init, "start");
        let second = ctx
            .log
            .warn(event_names::CAPTURE_READ_FAILED, Stage::Teardown, "no capture")
            .with_field("path", "/tmp/dump.har");
        ctx.record(first);
        ctx.record(second);
        let names: Vec<_> = ctx.events().iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names, vec!["run.started", "capture.read_failed"]);
    }

    #[test]
    fn test_furthest_state_ignores_terminal() {
        let mut ctx = ctx();
        assert_eq!(ctx.furthest_state(), RunState::Idle);
        let now = Utc::now();
        ctx.enter(RunState::DeviceVerified, now);
        ctx.enter(RunState::NetworkIsolated, now);
        ctx.enter(RunState::Aborted, now);
        assert_eq!(ctx.furthest_state(), RunState::NetworkIsolated);
        assert_eq!(ctx.current_state(), RunState::Aborted);
    }
}
