//! Test doubles for running the pipeline without a device.
//!
//! - [`ScriptedRunner`]: answers commands from a script and records them
//! - [`FakeClock`]: manual time that advances only when slept on
//! - [`FakeProxyLauncher`]: proxy processes that exit or write a HAR on cue

use crate::cancel::CancelToken;
use crate::exec::{CommandRunner, ToolError, ToolOutput, ToolSpec};
use crate::observe::Clock;
use crate::proxy::{ProxyExit, ProxyLauncher, ProxyProcess, ProxySpec};
use chrono::{DateTime, TimeZone, Utc};
use std::cell::{Cell, RefCell};
use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

// ============================================================================
// Scripted command runner
// ============================================================================

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Output {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    Timeout,
    NotFound,
}

impl Reply {
    /// Exit 0 with nothing printed.
    pub fn silent() -> Self {
        Self::stdout("")
    }

    pub fn stdout(text: impl Into<String>) -> Self {
        Reply::Output {
            stdout: text.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Reply::Output {
            stdout: String::new(),
            stderr: text.into(),
            exit_code: 0,
        }
    }

    pub fn fail(exit_code: i32, stderr: impl Into<String>) -> Self {
        Reply::Output {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    fn answer(&self, spec: &ToolSpec) -> Result<ToolOutput, ToolError> {
        match self {
            Reply::Output {
                stdout,
                stderr,
                exit_code,
            } => Ok(ToolOutput::completed(
                spec,
                stdout.as_bytes(),
                stderr.as_bytes(),
                *exit_code,
            )),
            Reply::Timeout => Err(ToolError::Timeout(spec.timeout.unwrap_or_default())),
            Reply::NotFound => Err(ToolError::CommandNotFound(spec.command.clone())),
        }
    }
}

struct Rule {
    pattern: String,
    replies: Vec<Reply>,
    served: usize,
}

/// [`CommandRunner`] that matches the full command line against substring
/// rules.
///
/// The most recently added matching rule wins. A rule with several replies
/// serves them in order and then repeats the last one. Unmatched commands
/// exit 0 with no output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: RefCell<Vec<Rule>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern` with `reply`.
    pub fn on(self, pattern: &str, reply: Reply) -> Self {
        self.add(pattern, vec![reply]);
        self
    }

    /// Answer commands containing `pattern` with `replies`, one per call.
    pub fn on_seq(self, pattern: &str, replies: Vec<Reply>) -> Self {
        self.add(pattern, replies);
        self
    }

    /// Add a rule to a runner that is already borrowed by collaborators.
    pub fn add(&self, pattern: &str, replies: Vec<Reply>) {
        self.rules.borrow_mut().push(Rule {
            pattern: pattern.to_string(),
            replies,
            served: 0,
        });
    }

    /// Every command line run so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    /// Number of commands containing `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    /// Index of the first command containing `pattern`.
    pub fn position(&self, pattern: &str) -> Option<usize> {
        self.calls.borrow().iter().position(|c| c.contains(pattern))
    }

    /// Index of the last command containing `pattern`.
    pub fn last_position(&self, pattern: &str) -> Option<usize> {
        self.calls.borrow().iter().rposition(|c| c.contains(pattern))
    }

    /// A runner that makes a healthy device and host: one device attached,
    /// Magisk present, install and uninstall succeed, the app launches as
    /// pid 4242 and stops on request.
    pub fn healthy_device(package: &str, uid: &str) -> Self {
        Self::new()
            .on(
                "devices",
                Reply::stdout("List of devices attached\nR58M123ABC\tdevice\n\n"),
            )
            .on(
                "pm list packages",
                Reply::stdout("package:com.android.settings\npackage:com.topjohnwu.magisk\n"),
            )
            .on("push", Reply::stdout("app.apk: 1 file pushed, 0 skipped. 38.2 MB/s\n"))
            .on("pm install", Reply::stdout("Success\n"))
            .on("pm uninstall", Reply::stdout("Success\n"))
            .on(
                "dumpsys package",
                Reply::stdout(format!(
                    "Packages:\n  Package [{package}] (3c5e2a1):\n    userId={uid}\n    pkg=Package{{{package}}}\n"
                )),
            )
            .on(
                "monkey",
                Reply::stdout("Events injected: 1\n## Network stats: elapsed time=12ms\n"),
            )
            .on("pidof", Reply::stdout("4242\n"))
            .on(
                "ps -p",
                Reply::stdout("USER      PID   PPID  VSZ   RSS  WCHAN  ADDR S NAME\n"),
            )
            .on("sysctl -w net.ipv4.ip_forward=1", Reply::stdout("net.ipv4.ip_forward = 1\n"))
            .on(
                "sysctl -w net.ipv6.conf.all.forwarding=1",
                Reply::stdout("net.ipv6.conf.all.forwarding = 1\n"),
            )
            .on(
                "sysctl -w net.ipv4.conf.all.send_redirects=0",
                Reply::stdout("net.ipv4.conf.all.send_redirects = 0\n"),
            )
            .on(
                "aapt",
                Reply::stdout(format!(
                    "package: name='{package}' versionCode='7' versionName='1.0.7'\napplication-label:'Sample'\n"
                )),
            )
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, spec: &ToolSpec) -> Result<ToolOutput, ToolError> {
        let line = spec.command_line();
        self.calls.borrow_mut().push(line.clone());

        let mut rules = self.rules.borrow_mut();
        let Some(rule) = rules.iter_mut().rev().find(|r| line.contains(&r.pattern)) else {
            return Reply::silent().answer(spec);
        };
        let index = rule.served.min(rule.replies.len().saturating_sub(1));
        rule.served += 1;
        match rule.replies.get(index) {
            Some(reply) => reply.answer(spec),
            None => Reply::silent().answer(spec),
        }
    }
}

// ============================================================================
// Manual clock
// ============================================================================

/// Clock that only moves when slept on or advanced.
pub struct FakeClock {
    now: Cell<DateTime<Utc>>,
    sleeps: RefCell<Vec<Duration>>,
    cancel_after: RefCell<Option<(usize, CancelToken)>>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    /// Starts at 2024-03-01T10:00:00Z.
    pub fn new() -> Self {
        let start = Utc
            .with_ymd_and_hms(2024, 3, 1, 10, 0, 0)
            .single()
            .unwrap_or_default();
        Self::at(start)
    }

    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Cell::new(now),
            sleeps: RefCell::new(Vec::new()),
            cancel_after: RefCell::new(None),
        }
    }

    pub fn advance(&self, by: Duration) {
        let by = chrono::Duration::from_std(by).unwrap_or_else(|_| chrono::Duration::zero());
        self.now.set(self.now.get() + by);
    }

    /// Cancel `token` once `sleeps` sleeps have happened.
    pub fn cancel_after(&self, sleeps: usize, token: CancelToken) {
        *self.cancel_after.borrow_mut() = Some((sleeps, token));
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.sleeps.borrow().iter().sum()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
        let count = {
            let mut sleeps = self.sleeps.borrow_mut();
            sleeps.push(duration);
            sleeps.len()
        };
        if let Some((after, token)) = self.cancel_after.borrow().as_ref() {
            if count >= *after {
                token.cancel();
            }
        }
    }
}

// ============================================================================
// Fake proxy
// ============================================================================

/// Proxy launcher whose processes live in memory.
#[derive(Default)]
pub struct FakeProxyLauncher {
    /// Processes exit with this code before the settle check.
    pub exit_during_settle: Option<i32>,
    /// `spawn` fails as if the binary were missing.
    pub spawn_error: bool,
    /// Written to the capture path when the process is terminated.
    pub har_on_terminate: Option<String>,
    spawned: Cell<usize>,
    terminated: Rc<Cell<usize>>,
    specs: RefCell<Vec<ProxySpec>>,
}

impl FakeProxyLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writing_har(har: impl Into<String>) -> Self {
        Self {
            har_on_terminate: Some(har.into()),
            ..Self::default()
        }
    }

    pub fn exiting(code: i32) -> Self {
        Self {
            exit_during_settle: Some(code),
            ..Self::default()
        }
    }

    pub fn spawned(&self) -> usize {
        self.spawned.get()
    }

    pub fn terminated(&self) -> usize {
        self.terminated.get()
    }

    pub fn specs(&self) -> Vec<ProxySpec> {
        self.specs.borrow().clone()
    }
}

struct FakeProxy {
    pid: u32,
    exit: Option<ProxyExit>,
    har: Option<(PathBuf, String)>,
    terminated: Rc<Cell<usize>>,
}

impl ProxyProcess for FakeProxy {
    fn id(&self) -> u32 {
        self.pid
    }

    fn try_exited(&mut self) -> io::Result<Option<ProxyExit>> {
        Ok(self.exit)
    }

    fn terminate(&mut self, _grace: Duration) {
        if let Some((path, har)) = self.har.take() {
            let _ = std::fs::write(path, har);
        }
        if self.exit.is_none() {
            self.exit = Some(ProxyExit { code: None });
        }
        self.terminated.set(self.terminated.get() + 1);
    }
}

impl ProxyLauncher for FakeProxyLauncher {
    fn spawn(&self, spec: &ProxySpec) -> io::Result<Box<dyn ProxyProcess>> {
        self.specs.borrow_mut().push(spec.clone());
        if self.spawn_error {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: not found", spec.program),
            ));
        }
        self.spawned.set(self.spawned.get() + 1);
        Ok(Box::new(FakeProxy {
            pid: 31_000 + self.spawned.get() as u32,
            exit: self.exit_during_settle.map(|code| ProxyExit { code: Some(code) }),
            har: self
                .har_on_terminate
                .clone()
                .map(|har| (spec.capture_path.clone(), har)),
            terminated: Rc::clone(&self.terminated),
        }))
    }
}
