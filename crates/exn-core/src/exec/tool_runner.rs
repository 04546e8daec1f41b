//! One-shot external commands with a deadline and bounded output.
//!
//! Every command a run issues (adb, aapt, sudo, iptables, sysctl, jadx) goes
//! through [`ToolRunner`]:
//!
//! - the child gets a minimal `C`-locale environment, so marker matching sees
//!   untranslated output
//! - stdout and stderr are captured up to a byte cap
//! - a command that outlives its deadline gets SIGTERM, then SIGKILL
//! - an optional stdin payload (the sudo password) is written once and never
//!   logged
//!
//! ```ignore
//! use exn_core::exec::{CommandRunner, ToolRunnerBuilder, ToolSpec};
//!
//! let runner = ToolRunnerBuilder::new().timeout(Duration::from_secs(30)).build();
//! let out = runner.run(&ToolSpec::new("adb", vec!["devices".into()]))?;
//! ```

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Per-stream capture cap. `dumpsys package` on a busy device is the largest
/// thing a run reads.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 4 * 1024 * 1024;

/// SIGTERM to SIGKILL delay for commands that hit their deadline.
const TIMEOUT_KILL_GRACE: Duration = Duration::from_millis(500);

/// Sleep between polls when neither pipe had data.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Variables a child keeps; everything else is cleared.
///
/// adb needs HOME for its key pair and the ANDROID_* / ADB_* variables to
/// find the SDK and its server.
const PRESERVED_ENV: [&str; 9] = [
    "PATH",
    "HOME",
    "USER",
    "TMPDIR",
    "ANDROID_HOME",
    "ANDROID_SDK_ROOT",
    "ANDROID_SERIAL",
    "ADB_SERVER_SOCKET",
    "ADB_VENDOR_KEYS",
];

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("command failed to spawn: {0}")]
    SpawnFailed(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid command path: {0}")]
    InvalidPath(String),
}

impl From<ToolError> for exn_common::Error {
    fn from(err: ToolError) -> Self {
        exn_common::Error::Command(err.to_string())
    }
}

/// What a finished command left behind.
///
/// A command that hit its deadline still yields an output with `timed_out`
/// set; callers decide whether partial output is usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub command: String,
    pub args: Vec<String>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// None when the child was killed by a signal.
    pub exit_code: Option<i32>,
    /// Either stream hit the cap.
    pub truncated: bool,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
    pub timed_out: bool,
}

impl ToolOutput {
    /// Output of a command that exited on its own with `exit_code`.
    pub fn completed(
        spec: &ToolSpec,
        stdout: impl Into<Vec<u8>>,
        stderr: impl Into<Vec<u8>>,
        exit_code: i32,
    ) -> Self {
        Self {
            command: spec.command.clone(),
            args: spec.args.clone(),
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            truncated: false,
            duration: Duration::ZERO,
            timed_out: false,
        }
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// stdout then stderr, as a terminal would show them.
    ///
    /// adb prints some failures on stdout and some on stderr, so markers are
    /// matched against both.
    pub fn combined(&self) -> String {
        let mut text = self.stdout_str();
        let stderr = self.stderr_str();
        if !stderr.is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        text
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out
    }

    /// Exit 0 with nothing but whitespace on either stream.
    pub fn is_silent_success(&self) -> bool {
        self.success() && self.combined().trim().is_empty()
    }
}

/// Runner-wide limits; a [`ToolSpec`] may override either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolConfig {
    pub default_timeout: Duration,
    pub max_output_bytes: usize,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// A command to run: program, argv and per-command limits.
#[derive(Clone)]
pub struct ToolSpec {
    pub command: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    pub max_output: Option<usize>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<Vec<u8>>,
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("command", &self.command)
            .field("args", &self.args)
            .field("timeout", &self.timeout)
            .field("max_output", &self.max_output)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl ToolSpec {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            timeout: None,
            max_output: None,
            stdin: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_output(mut self, max_output: usize) -> Self {
        self.max_output = Some(max_output);
        self
    }

    pub fn with_stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program and argv joined with spaces. Never includes stdin.
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            return self.command.clone();
        }
        format!("{} {}", self.command, self.args.join(" "))
    }
}

/// Production [`CommandRunner`](super::CommandRunner).
#[derive(Debug, Default)]
pub struct ToolRunner {
    config: ToolConfig,
}

impl ToolRunner {
    pub fn new(config: ToolConfig) -> Self {
        Self { config }
    }

    /// Spawn `spec`, feed stdin, and collect output until exit or deadline.
    #[instrument(skip(self), fields(cmd = %spec.command))]
    pub fn execute(&self, spec: &ToolSpec) -> Result<ToolOutput, ToolError> {
        validate_command(&spec.command)?;

        let timeout = spec.timeout.unwrap_or(self.config.default_timeout);
        let cap = spec.max_output.unwrap_or(self.config.max_output_bytes);
        trace!(args = ?spec.args, timeout_ms = timeout.as_millis() as u64, cap, "spawning");

        let started = Instant::now();
        let mut child = spawn(spec)?;

        if let Some(input) = &spec.stdin {
            if let Some(mut pipe) = child.stdin.take() {
                // A child that exits without reading leaves a broken pipe; its
                // output still says what happened.
                if let Err(e) = pipe.write_all(input) {
                    trace!(error = %e, "stdin write failed");
                }
            }
        }

        let collected = collect(&mut child, Instant::now() + timeout, cap)?;
        let duration = started.elapsed();
        debug!(
            exit_code = ?collected.status.and_then(|s| s.code()),
            duration_ms = duration.as_millis() as u64,
            timed_out = collected.timed_out,
            "command finished"
        );

        Ok(ToolOutput {
            command: spec.command.clone(),
            args: spec.args.clone(),
            truncated: collected.stdout.truncated || collected.stderr.truncated,
            stdout: collected.stdout.bytes,
            stderr: collected.stderr.bytes,
            exit_code: collected.status.and_then(|s| s.code()),
            duration,
            timed_out: collected.timed_out,
        })
    }
}

/// Reject command names a shell would reinterpret.
fn validate_command(cmd: &str) -> Result<(), ToolError> {
    if cmd.is_empty() {
        return Err(ToolError::InvalidPath("empty command".to_string()));
    }
    if cmd.contains(['|', '&', ';', '$', '`', '\n', '\r']) {
        return Err(ToolError::InvalidPath(format!(
            "command contains shell metacharacters: {}",
            cmd
        )));
    }
    if cmd.starts_with('/') && !Path::new(cmd).exists() {
        return Err(ToolError::CommandNotFound(cmd.to_string()));
    }
    Ok(())
}

fn spawn(spec: &ToolSpec) -> Result<Child, ToolError> {
    let mut command = Command::new(&spec.command);
    command.args(&spec.args).env_clear();
    for key in PRESERVED_ENV {
        if let Some(value) = std::env::var_os(key) {
            command.env(key, value);
        }
    }
    command
        .env("LC_ALL", "C")
        .env("LANG", "C")
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    command.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ToolError::CommandNotFound(spec.command.clone())
        } else {
            ToolError::SpawnFailed(format!("{}: {}", spec.command, e))
        }
    })
}

/// Bytes read from one pipe, capped.
struct Capture {
    bytes: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl Capture {
    fn new(cap: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(cap.min(64 * 1024)),
            cap,
            truncated: false,
        }
    }

    fn push(&mut self, data: &[u8]) {
        let room = self.cap.saturating_sub(self.bytes.len());
        if data.len() > room {
            self.truncated = true;
        }
        self.bytes.extend_from_slice(&data[..data.len().min(room)]);
    }

    /// Read whatever is available now. Returns whether anything was read.
    fn pull(&mut self, pipe: &mut Option<impl Read>, chunk: &mut [u8]) -> bool {
        let Some(stream) = pipe.as_mut() else {
            return false;
        };
        match stream.read(chunk) {
            Ok(0) => {
                // EOF; stop polling this pipe.
                *pipe = None;
                false
            }
            Ok(n) => {
                self.push(&chunk[..n]);
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => true,
            Err(e) => {
                trace!(error = %e, "pipe read failed");
                *pipe = None;
                false
            }
        }
    }
}

struct Collected {
    stdout: Capture,
    stderr: Capture,
    status: Option<ExitStatus>,
    timed_out: bool,
}

/// Poll both pipes and the child until it exits or `deadline` passes.
///
/// The pipes are non-blocking, so a grandchild that inherited them (the adb
/// server forks one on first use) cannot hold the caller past the child's
/// exit.
fn collect(child: &mut Child, deadline: Instant, cap: usize) -> Result<Collected, ToolError> {
    let mut stdout: Option<ChildStdout> = child.stdout.take();
    let mut stderr: Option<ChildStderr> = child.stderr.take();
    set_nonblocking(stdout.as_ref())?;
    set_nonblocking(stderr.as_ref())?;

    let mut out = Collected {
        stdout: Capture::new(cap),
        stderr: Capture::new(cap),
        status: None,
        timed_out: false,
    };
    let mut chunk = [0u8; 8192];

    loop {
        let read_out = out.stdout.pull(&mut stdout, &mut chunk);
        let read_err = out.stderr.pull(&mut stderr, &mut chunk);

        if let Some(status) = child.try_wait()? {
            // Whatever the child wrote before exiting is already buffered.
            while out.stdout.pull(&mut stdout, &mut chunk) {}
            while out.stderr.pull(&mut stderr, &mut chunk) {}
            out.status = Some(status);
            return Ok(out);
        }

        if Instant::now() >= deadline {
            warn!(pid = child.id(), "command hit its deadline");
            out.timed_out = true;
            terminate_with_grace(child, TIMEOUT_KILL_GRACE);
            out.status = child.try_wait().ok().flatten();
            return Ok(out);
        }

        if !read_out && !read_err {
            thread::sleep(IDLE_POLL);
        }
    }
}

#[cfg(unix)]
fn set_nonblocking<F: std::os::unix::io::AsRawFd>(pipe: Option<&F>) -> std::io::Result<()> {
    let Some(pipe) = pipe else {
        return Ok(());
    };
    let fd = pipe.as_raw_fd();
    // SAFETY: fd is owned by the pipe handle and stays open for this call.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: as above; only O_NONBLOCK is added to the existing flags.
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_nonblocking<F>(_pipe: Option<&F>) -> std::io::Result<()> {
    Ok(())
}

/// SIGTERM, wait up to `grace`, then SIGKILL. The child is reaped either way.
#[cfg(unix)]
pub(crate) fn terminate_with_grace(child: &mut Child, grace: Duration) {
    if matches!(child.try_wait(), Ok(Some(_))) {
        return;
    }
    let pid = child.id() as libc::pid_t;
    // SAFETY: pid belongs to a child we have not reaped, so it cannot have
    // been recycled.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) => thread::sleep(Duration::from_millis(20)),
            Err(e) => {
                warn!(pid, error = %e, "cannot poll child");
                break;
            }
        }
    }

    debug!(pid, "still running after SIGTERM, killing");
    if let Err(e) = child.kill() {
        trace!(pid, error = %e, "kill failed");
    }
    if let Err(e) = child.wait() {
        trace!(pid, error = %e, "wait failed");
    }
}

#[cfg(not(unix))]
pub(crate) fn terminate_with_grace(child: &mut Child, _grace: Duration) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Builds a [`ToolRunner`] from run configuration.
#[derive(Debug, Default)]
pub struct ToolRunnerBuilder {
    config: ToolConfig,
}

impl ToolRunnerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.default_timeout = timeout;
        self
    }

    pub fn max_output(mut self, max_bytes: usize) -> Self {
        self.config.max_output_bytes = max_bytes;
        self
    }

    pub fn build(self) -> ToolRunner {
        ToolRunner::new(self.config)
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ToolRunner {
        ToolRunnerBuilder::new()
            .timeout(Duration::from_secs(10))
            .build()
    }

    fn sh(script: &str) -> ToolSpec {
        ToolSpec::new("sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_captures_both_streams() {
        let output = runner().execute(&sh("echo pushed; echo warn >&2")).unwrap();

        assert!(output.success());
        assert_eq!(output.stdout_str(), "pushed\n");
        assert_eq!(output.stderr_str(), "warn\n");
        assert_eq!(output.combined(), "pushed\nwarn\n");
        assert!(!output.is_silent_success());
        assert!(!output.truncated);
    }

    #[test]
    fn test_silent_success_needs_exit_zero() {
        assert!(runner().execute(&sh("true")).unwrap().is_silent_success());

        let failed = runner().execute(&sh("exit 42")).unwrap();
        assert_eq!(failed.exit_code, Some(42));
        assert!(!failed.is_silent_success());
    }

    #[test]
    fn test_child_sees_c_locale_only() {
        let output = runner()
            .execute(&sh("echo \"$LC_ALL:$LANG:${EXYNEX_SU_PASS:-unset}\""))
            .unwrap();
        assert_eq!(output.stdout_str().trim(), "C:C:unset");
    }

    #[test]
    fn test_stdin_is_delivered() {
        let spec = ToolSpec::new("cat", vec![]).with_stdin("secret\n");
        let output = runner().execute(&spec).unwrap();
        assert_eq!(output.stdout_str(), "secret\n");
    }

    #[test]
    fn test_stdin_never_rendered() {
        let spec = ToolSpec::new("sudo", vec!["-S".into(), "iptables".into()]).with_stdin("hunter2\n");
        assert!(!format!("{:?}", spec).contains("hunter2"));
        assert_eq!(spec.command_line(), "sudo -S iptables");
    }

    #[test]
    fn test_missing_commands() {
        assert!(matches!(
            runner().execute(&ToolSpec::new("/nonexistent/bin/adb", vec![])),
            Err(ToolError::CommandNotFound(_))
        ));
        assert!(matches!(
            runner().execute(&ToolSpec::new("exynex-no-such-tool", vec![])),
            Err(ToolError::CommandNotFound(_))
        ));
    }

    #[test]
    fn test_shell_metacharacters_rejected() {
        let result = runner().execute(&ToolSpec::new("adb; rm -rf /", vec![]));
        assert!(matches!(result, Err(ToolError::InvalidPath(_))));
    }

    #[test]
    fn test_deadline_terminates_child() {
        let spec = ToolSpec::new("sleep", vec!["10".into()]).with_timeout(Duration::from_millis(100));
        let output = runner().execute(&spec).unwrap();

        assert!(output.timed_out);
        assert!(!output.success());
        assert!(output.duration < Duration::from_secs(3));
    }

    #[test]
    fn test_backgrounded_grandchild_does_not_block() {
        // adb's first call forks a server that keeps the pipes open.
        let spec = sh("sleep 5 & echo started").with_timeout(Duration::from_secs(4));
        let output = runner().execute(&spec).unwrap();

        assert!(output.success());
        assert_eq!(output.stdout_str().trim(), "started");
        assert!(output.duration < Duration::from_secs(3));
    }

    #[test]
    fn test_output_cap() {
        let spec = sh("yes | head -n 1000").with_max_output(100);
        let output = runner().execute(&spec).unwrap();

        assert!(output.truncated);
        assert_eq!(output.stdout.len(), 100);
    }

    #[test]
    fn test_capture_push_respects_cap() {
        let mut capture = Capture::new(4);
        capture.push(b"ab");
        capture.push(b"cdef");
        assert_eq!(capture.bytes, b"abcd");
        assert!(capture.truncated);
    }

    #[test]
    fn test_terminate_with_grace_reaps_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        terminate_with_grace(&mut child, Duration::from_millis(200));
        assert!(matches!(child.try_wait(), Ok(Some(_))));
    }

    #[test]
    fn test_duration_ms_round_trip() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            #[serde(with = "duration_ms")]
            d: Duration,
        }
        let json = serde_json::to_string(&Wrapper {
            d: Duration::from_millis(2500),
        })
        .unwrap();
        assert_eq!(json, r#"{"d":2500}"#);
    }
}
