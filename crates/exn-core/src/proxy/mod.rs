//! Transparent interception proxy lifecycle.
//!
//! The proxy is a long-lived child process, so it is not driven through
//! [`CommandRunner`](crate::exec::CommandRunner); a [`ProxyLauncher`] spawns it
//! and hands back a [`ProxyProcess`] the manager polls and terminates.

pub mod har;

use crate::config::ToolPaths;
use crate::exec::tool_runner::terminate_with_grace;
use crate::logging::truncate_for_log;
use crate::observe::Clock;
use chrono::{DateTime, Utc};
use exn_common::{Error, Result};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

pub use har::{CaptureData, HarEntry};

/// Everything needed to start one proxy process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySpec {
    pub program: String,
    pub args: Vec<String>,
    pub capture_path: PathBuf,
    pub tag: String,
    pub port: u16,
    /// Receives the proxy's stdout and stderr.
    pub log_path: Option<PathBuf>,
}

impl ProxySpec {
    /// `mitmdump` in transparent mode with the HAR addon.
    pub fn mitmdump(
        tools: &ToolPaths,
        port: u16,
        capture_path: &Path,
        tag: &str,
        log_path: Option<PathBuf>,
    ) -> Self {
        let args = vec![
            "--mode".to_string(),
            "transparent".to_string(),
            "--showhost".to_string(),
            "--listen-port".to_string(),
            port.to_string(),
            "-s".to_string(),
            tools.proxy_script.to_string_lossy().into_owned(),
            "--set".to_string(),
            format!("hardump={}", capture_path.display()),
            "--set".to_string(),
            format!("timestamp={}", tag),
        ];
        Self {
            program: tools.mitmdump.clone(),
            args,
            capture_path: capture_path.to_path_buf(),
            tag: tag.to_string(),
            port,
            log_path,
        }
    }
}

/// Session tag handed to the addon: unix seconds with milliseconds.
pub fn session_tag(at: DateTime<Utc>) -> String {
    let millis = at.timestamp_millis();
    format!("{}.{:03}", millis.div_euclid(1000), millis.rem_euclid(1000))
}

/// How a proxy process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyExit {
    /// `None` when killed by a signal.
    pub code: Option<i32>,
}

/// A running proxy.
pub trait ProxyProcess {
    fn id(&self) -> u32;

    /// Non-blocking exit check.
    fn try_exited(&mut self) -> io::Result<Option<ProxyExit>>;

    /// SIGTERM, then SIGKILL after `grace`; reaps the process.
    fn terminate(&mut self, grace: Duration);
}

/// Starts proxy processes.
pub trait ProxyLauncher {
    fn spawn(&self, spec: &ProxySpec) -> io::Result<Box<dyn ProxyProcess>>;
}

/// Spawns the real `mitmdump`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MitmdumpLauncher;

struct ChildProxy {
    child: Child,
}

impl ProxyProcess for ChildProxy {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_exited(&mut self) -> io::Result<Option<ProxyExit>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| ProxyExit { code: status.code() }))
    }

    fn terminate(&mut self, grace: Duration) {
        terminate_with_grace(&mut self.child, grace);
    }
}

impl ProxyLauncher for MitmdumpLauncher {
    fn spawn(&self, spec: &ProxySpec) -> io::Result<Box<dyn ProxyProcess>> {
        let (stdout, stderr) = match &spec.log_path {
            Some(path) => {
                let log = File::create(path)?;
                (Stdio::from(log.try_clone()?), Stdio::from(log))
            }
            None => (Stdio::null(), Stdio::null()),
        };
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()?;
        Ok(Box::new(ChildProxy { child }))
    }
}

/// A started proxy and its capture.
pub struct InterceptionSession {
    process: Option<Box<dyn ProxyProcess>>,
    pub pid: u32,
    pub capture_path: PathBuf,
    pub tag: String,
    pub started_at: DateTime<Utc>,
}

impl std::fmt::Debug for InterceptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterceptionSession")
            .field("pid", &self.pid)
            .field("running", &self.is_running())
            .field("capture_path", &self.capture_path)
            .field("tag", &self.tag)
            .field("started_at", &self.started_at)
            .finish()
    }
}

impl InterceptionSession {
    /// Whether [`InterceptionProxyManager::stop`] has not yet run.
    pub fn is_running(&self) -> bool {
        self.process.is_some()
    }
}

/// Result of reading the capture after the proxy stopped.
#[derive(Debug)]
pub struct CaptureRead {
    pub data: CaptureData,
    /// Non-fatal `CaptureReadFailed` when the file was missing or malformed.
    pub failure: Option<Error>,
}

/// Starts, stops and reads back the interception proxy.
pub struct InterceptionProxyManager<'a> {
    launcher: &'a dyn ProxyLauncher,
    clock: &'a dyn Clock,
    settle_delay: Duration,
    stop_grace: Duration,
}

impl<'a> InterceptionProxyManager<'a> {
    pub fn new(
        launcher: &'a dyn ProxyLauncher,
        clock: &'a dyn Clock,
        settle_delay: Duration,
        stop_grace: Duration,
    ) -> Self {
        Self {
            launcher,
            clock,
            settle_delay,
            stop_grace,
        }
    }

    /// Spawn the proxy and make sure it survives the settle delay.
    pub fn start(&self, spec: &ProxySpec) -> Result<InterceptionSession> {
        let mut process = self
            .launcher
            .spawn(spec)
            .map_err(|e| Error::ProxyStartFailed(format!("spawn {}: {}", spec.program, e)))?;
        let pid = process.id();
        let started_at = self.clock.now();
        debug!(pid, port = spec.port, "proxy spawned, settling");

        self.clock.sleep(self.settle_delay);

        let exited = match process.try_exited() {
            Ok(exit) => exit.map(|e| format!("exited with {:?}", e.code)),
            Err(e) => Some(format!("status unavailable: {}", e)),
        };
        if let Some(reason) = exited {
            process.terminate(Duration::ZERO);
            let mut message = format!(
                "{} {} within {}ms",
                spec.program,
                reason,
                self.settle_delay.as_millis()
            );
            if let Some(tail) = spec.log_path.as_deref().and_then(log_tail) {
                message.push_str(": ");
                message.push_str(&tail);
            }
            return Err(Error::ProxyStartFailed(message));
        }

        info!(pid, port = spec.port, capture = %spec.capture_path.display(), "proxy running");
        Ok(InterceptionSession {
            process: Some(process),
            pid,
            capture_path: spec.capture_path.clone(),
            tag: spec.tag.clone(),
            started_at,
        })
    }

    /// Stop the proxy. Later calls on the same session do nothing.
    pub fn stop(&self, session: &mut InterceptionSession) {
        match session.process.take() {
            Some(mut process) => {
                process.terminate(self.stop_grace);
                info!(pid = session.pid, "proxy stopped");
            }
            None => debug!(pid = session.pid, "proxy already stopped"),
        }
    }

    /// Parse the capture; failures yield an empty capture plus the error.
    pub fn read_capture(&self, path: &Path) -> CaptureRead {
        match CaptureData::read(path) {
            Ok(data) => CaptureRead {
                data,
                failure: None,
            },
            Err(reason) => {
                warn!(path = %path.display(), reason = %reason, "capture unreadable");
                CaptureRead {
                    data: CaptureData::default(),
                    failure: Some(Error::CaptureReadFailed {
                        path: path.to_path_buf(),
                        reason,
                    }),
                }
            }
        }
    }
}

/// Last non-empty line of the proxy log, if any.
fn log_tail(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .map(|l| truncate_for_log(l.trim(), 256))
}
