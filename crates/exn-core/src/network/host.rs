//! Host-side forwarding and NAT commands.

use crate::config::ToolPaths;
use crate::exec::{CommandRunner, ToolError, ToolOutput, ToolSpec};
use crate::logging::truncate_for_log;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Host operating system family; decides which forwarding knobs exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPlatform {
    Linux,
    MacOs,
}

impl HostPlatform {
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            HostPlatform::MacOs
        } else {
            HostPlatform::Linux
        }
    }
}

/// How host commands gain root.
#[derive(Clone, PartialEq, Eq)]
pub enum HostPrivilege {
    /// Already root; commands run directly.
    Root,
    /// `sudo -S` with this password on stdin.
    Password(String),
    /// `sudo -n`; fails instead of prompting.
    NonInteractive,
}

impl fmt::Debug for HostPrivilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostPrivilege::Root => f.write_str("Root"),
            HostPrivilege::Password(_) => f.write_str("Password(<redacted>)"),
            HostPrivilege::NonInteractive => f.write_str("NonInteractive"),
        }
    }
}

impl HostPrivilege {
    /// Pick a mode from the effective uid and an optional sudo password.
    pub fn detect(password: Option<String>) -> Self {
        // SAFETY: geteuid has no preconditions and cannot fail.
        let euid = unsafe { libc::geteuid() };
        if euid == 0 {
            return HostPrivilege::Root;
        }
        match password {
            Some(p) if !p.is_empty() => HostPrivilege::Password(p),
            _ => HostPrivilege::NonInteractive,
        }
    }

    /// Build the spec that runs `program args` with root rights.
    pub fn wrap(&self, sudo: &str, program: &str, args: &[String]) -> ToolSpec {
        match self {
            HostPrivilege::Root => ToolSpec::new(program, args.to_vec()),
            HostPrivilege::Password(password) => {
                let mut full = vec![
                    "-S".to_string(),
                    "-p".to_string(),
                    String::new(),
                    program.to_string(),
                ];
                full.extend(args.iter().cloned());
                ToolSpec::new(sudo, full).with_stdin(format!("{}\n", password))
            }
            HostPrivilege::NonInteractive => {
                let mut full = vec!["-n".to_string(), program.to_string()];
                full.extend(args.iter().cloned());
                ToolSpec::new(sudo, full)
            }
        }
    }
}

/// Failure of one host command, with enough context for the error message.
#[derive(Debug, Error)]
#[error("`{command}`: {detail}")]
pub struct HostCommandError {
    pub command: String,
    pub detail: String,
}

/// Linux forwarding keys and the values a run needs.
pub const LINUX_FORWARDING: [(&str, &str); 3] = [
    ("net.ipv4.ip_forward", "1"),
    ("net.ipv6.conf.all.forwarding", "1"),
    ("net.ipv4.conf.all.send_redirects", "0"),
];

/// macOS has no per-family knobs beyond this one.
pub const MACOS_FORWARDING: (&str, &str) = ("net.inet.ip.forwarding", "1");

/// Runs privileged host commands.
pub struct HostNetwork<'a> {
    runner: &'a dyn CommandRunner,
    privilege: HostPrivilege,
    platform: HostPlatform,
    sudo: String,
    iptables: String,
    sysctl: String,
    timeout: Duration,
}

impl<'a> HostNetwork<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        privilege: HostPrivilege,
        platform: HostPlatform,
        tools: &ToolPaths,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            privilege,
            platform,
            sudo: tools.sudo.clone(),
            iptables: tools.iptables.clone(),
            sysctl: tools.sysctl.clone(),
            timeout,
        }
    }

    pub fn platform(&self) -> HostPlatform {
        self.platform
    }

    fn run(&self, program: &str, args: &[&str]) -> Result<(String, ToolOutput), HostCommandError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        let line = format!("{} {}", program, args.join(" "));
        let spec = self
            .privilege
            .wrap(&self.sudo, program, &args)
            .with_timeout(self.timeout);
        let output = self.runner.run(&spec).map_err(|e: ToolError| HostCommandError {
            command: line.clone(),
            detail: e.to_string(),
        })?;
        debug!(
            command = %line,
            exit_code = ?output.exit_code,
            output = %truncate_for_log(&output.combined(), 512),
            "host command"
        );
        Ok((line, output))
    }

    fn run_silent(&self, program: &str, args: &[&str]) -> Result<(), HostCommandError> {
        let (line, output) = self.run(program, args)?;
        if output.is_silent_success() {
            Ok(())
        } else {
            Err(HostCommandError {
                command: line,
                detail: describe(&output),
            })
        }
    }

    /// `iptables -t nat -F`.
    pub fn flush_nat(&self) -> Result<(), HostCommandError> {
        if self.platform == HostPlatform::MacOs {
            return Ok(());
        }
        self.run_silent(&self.iptables, &["-t", "nat", "-F"])
    }

    /// Enable forwarding for the platform.
    pub fn enable_forwarding(&self) -> Result<(), HostCommandError> {
        match self.platform {
            HostPlatform::Linux => {
                for (key, value) in LINUX_FORWARDING {
                    self.sysctl_set(key, value, |out| sysctl_echoed(out, key, value))?;
                }
                Ok(())
            }
            HostPlatform::MacOs => {
                let (key, value) = MACOS_FORWARDING;
                self.sysctl_set(key, value, |out| out.contains(key))
            }
        }
    }

    fn sysctl_set(
        &self,
        key: &str,
        value: &str,
        accepted: impl Fn(&str) -> bool,
    ) -> Result<(), HostCommandError> {
        let assignment = format!("{}={}", key, value);
        let (line, output) = self.run(&self.sysctl, &["-w", &assignment])?;
        if output.success() && accepted(&output.stdout_str()) {
            Ok(())
        } else {
            Err(HostCommandError {
                command: line,
                detail: describe(&output),
            })
        }
    }

    /// Redirect TCP from `device_ip` to the local proxy port.
    pub fn redirect(&self, device_ip: &str, port: u16) -> Result<(), HostCommandError> {
        if self.platform == HostPlatform::MacOs {
            warn!(device_ip, "no NAT redirect on this host; traffic must be routed to the proxy manually");
            return Ok(());
        }
        let port = port.to_string();
        self.run_silent(
            &self.iptables,
            &[
                "-t", "nat", "-A", "PREROUTING", "-s", device_ip, "-p", "tcp", "-j", "REDIRECT",
                "--to-port", &port,
            ],
        )
    }
}

/// Whether sysctl echoed `<key> = <value>`.
pub fn sysctl_echoed(output: &str, key: &str, value: &str) -> bool {
    let expected = format!("{} = {}", key, value);
    output.lines().any(|line| line.trim() == expected)
}

fn describe(output: &ToolOutput) -> String {
    if output.timed_out {
        return "timed out".to_string();
    }
    let text = output.combined();
    let text = text.trim();
    match (output.exit_code, text.is_empty()) {
        (Some(0), false) => format!("unexpected output: {}", truncate_for_log(text, 256)),
        (code, true) => format!("exit status {:?}", code),
        (code, false) => format!("exit status {:?}: {}", code, truncate_for_log(text, 256)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_error_message() {
        let err = HostCommandError {
            command: "sudo -n iptables -t nat -F".to_string(),
            detail: "exited with Some(1)".to_string(),
        };
        assert_eq!(err.to_string(), "`sudo -n iptables -t nat -F`: exited with Some(1)");
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn test_root_runs_directly() {
        let spec = HostPrivilege::Root.wrap("sudo", "iptables", &["-t".into(), "nat".into()]);
        assert_eq!(spec.command, "iptables");
        assert_eq!(spec.args, vec!["-t", "nat"]);
        assert!(spec.stdin.is_none());
    }

    #[test]
    fn test_password_goes_to_stdin() {
        let spec = HostPrivilege::Password("hunter2".into()).wrap("sudo", "sysctl", &["-w".into()]);
        assert_eq!(spec.command, "sudo");
        assert_eq!(spec.args, vec!["-S", "-p", "", "sysctl", "-w"]);
        assert_eq!(spec.stdin.as_deref(), Some(&b"hunter2\n"[..]));
        assert!(!spec.command_line().contains("hunter2"));
    }

    #[test]
    fn test_non_interactive_sudo() {
        let spec = HostPrivilege::NonInteractive.wrap("sudo", "iptables", &["-F".into()]);
        assert_eq!(spec.args, vec!["-n", "iptables", "-F"]);
    }

    #[test]
    fn test_privilege_debug_redacts_password() {
        let text = format!("{:?}", HostPrivilege::Password("hunter2".into()));
        assert!(!text.contains("hunter2"));
    }

    #[test]
    fn test_sysctl_echo_must_match_value() {
        assert!(sysctl_echoed("net.ipv4.ip_forward = 1\n", "net.ipv4.ip_forward", "1"));
        assert!(!sysctl_echoed("net.ipv4.ip_forward = 0\n", "net.ipv4.ip_forward", "1"));
        assert!(!sysctl_echoed("", "net.ipv4.ip_forward", "1"));
    }

    #[test]
    fn test_describe_unexpected_output() {
        let out = ToolOutput::completed(
            &ToolSpec::new("iptables", vec![]),
            "",
            "iptables: Permission denied\n",
            4,
        );
        let text = describe(&out);
        assert!(text.contains("Permission denied"));
        assert!(text.contains("4"));
    }
}
