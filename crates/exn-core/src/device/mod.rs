//! Device presence, package lifecycle and app process control over adb.
//!
//! Every command is issued through a [`CommandRunner`]; this module owns the
//! markers that decide whether a command worked.

pub mod parse;

use crate::config::RunConfig;
use crate::exec::{CommandRunner, ToolError, ToolOutput, ToolSpec};
use crate::logging::truncate_for_log;
use crate::observe::{elapsed_since, Clock};
use chrono::{DateTime, Utc};
use exn_common::{AppUid, DevicePid, Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Marker `adb push` prints once the file is on the device.
const PUSH_MARKER: &str = "file pushed";

/// Marker `pm install` / `pm uninstall` print on success.
const PM_SUCCESS_MARKER: &str = "Success";

/// A device that answered `adb devices`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Address the device's traffic originates from on the host network.
    pub ip: String,
    /// adb serial that reported the `device` state.
    pub serial: String,
    /// Magisk is installed; privileged commands use `su -c`.
    pub has_root_broker: bool,
}

/// The app under analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetApp {
    pub package: String,
    /// Resolved only after install.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<AppUid>,
    /// Set only after a verified launch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<DevicePid>,
    pub installed: bool,
    /// The package was present before this run.
    pub already_installed: bool,
}

impl TargetApp {
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            ..Self::default()
        }
    }
}

/// Result of a verified launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchedApp {
    pub pid: DevicePid,
    /// When the process was first observed running.
    pub started_at: DateTime<Utc>,
}

/// Quote `s` for the device's `sh`.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Issues `adb [-s serial] shell ...` commands, optionally through `su`.
#[derive(Clone)]
pub struct AdbShell<'a> {
    runner: &'a dyn CommandRunner,
    adb: String,
    serial: Option<String>,
    timeout: Duration,
}

impl<'a> AdbShell<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        adb: impl Into<String>,
        serial: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            adb: adb.into(),
            serial,
            timeout,
        }
    }

    /// Pin later commands to one serial.
    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    /// Run `adb <args>`.
    pub fn adb(&self, args: &[&str]) -> std::result::Result<ToolOutput, ToolError> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(serial) = &self.serial {
            full.push("-s".to_string());
            full.push(serial.clone());
        }
        full.extend(args.iter().map(|a| a.to_string()));
        let spec = ToolSpec::new(&self.adb, full).with_timeout(self.timeout);
        let output = self.runner.run(&spec)?;
        debug!(
            command = %spec.command_line(),
            exit_code = ?output.exit_code,
            output = %truncate_for_log(&output.combined(), 512),
            "adb"
        );
        Ok(output)
    }

    /// Run `cmd` in the device shell.
    pub fn shell(&self, cmd: &str) -> std::result::Result<ToolOutput, ToolError> {
        self.adb(&["shell", cmd])
    }

    /// Run `cmd` as root: `su -c "<cmd>"` with a root broker, `su 0 <cmd>` otherwise.
    pub fn privileged(
        &self,
        cmd: &str,
        has_root_broker: bool,
    ) -> std::result::Result<ToolOutput, ToolError> {
        self.shell(&privileged_command(cmd, has_root_broker))
    }
}

/// Wrap `cmd` for the device's `su`.
pub fn privileged_command(cmd: &str, has_root_broker: bool) -> String {
    if has_root_broker {
        format!("su -c \"{}\"", cmd)
    } else {
        format!("su 0 {}", cmd)
    }
}

/// Timeouts and knobs for device operations.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub adb: String,
    pub serial: Option<String>,
    pub staging_dir: String,
    pub grant_permissions: bool,
    pub command_timeout: Duration,
    pub launch_timeout: Duration,
    pub launch_poll_interval: Duration,
    pub stop_timeout: Duration,
    pub stop_poll_interval: Duration,
}

impl DeviceSettings {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            adb: config.tools.adb.clone(),
            serial: config.adb_serial.clone(),
            staging_dir: config.staging_dir.clone(),
            grant_permissions: config.grant_permissions,
            command_timeout: config.command_timeout,
            launch_timeout: config.launch_timeout,
            launch_poll_interval: config.launch_poll_interval,
            stop_timeout: config.stop_timeout,
            stop_poll_interval: config.stop_poll_interval,
        }
    }
}

/// Device-side lifecycle operations.
pub struct DeviceController<'a> {
    shell: AdbShell<'a>,
    clock: &'a dyn Clock,
    settings: DeviceSettings,
}

impl<'a> DeviceController<'a> {
    pub fn new(runner: &'a dyn CommandRunner, clock: &'a dyn Clock, settings: DeviceSettings) -> Self {
        let shell = AdbShell::new(
            runner,
            settings.adb.clone(),
            settings.serial.clone(),
            settings.command_timeout,
        );
        Self {
            shell,
            clock,
            settings,
        }
    }

    /// Shell handle for collaborators that issue their own device commands.
    pub fn shell(&self) -> &AdbShell<'a> {
        &self.shell
    }

    /// Find a ready device and probe it for a root broker.
    ///
    /// The first ready serial is used unless a serial was configured; later
    /// commands are pinned to it.
    pub fn discover(&mut self, device_ip: &str) -> Result<Device> {
        let listing = self
            .shell
            .adb(&["devices"])
            .map_err(|e| Error::DeviceUnavailable(format!("adb devices: {}", e)))?;
        let ready = parse::ready_serials(&listing.stdout_str());

        let serial = match &self.settings.serial {
            Some(wanted) if ready.iter().any(|s| s == wanted) => wanted.clone(),
            Some(wanted) => {
                return Err(Error::DeviceUnavailable(format!(
                    "device {} is not in the `device` state",
                    wanted
                )))
            }
            None => match ready.first() {
                Some(serial) => serial.clone(),
                None => {
                    return Err(Error::DeviceUnavailable(
                        "adb devices lists no device in the `device` state".to_string(),
                    ))
                }
            },
        };
        if ready.len() > 1 && self.settings.serial.is_none() {
            warn!(serial = %serial, count = ready.len(), "several devices attached, using the first");
        }
        self.shell = self.shell.clone().with_serial(serial.clone());

        let packages = self
            .shell
            .shell("pm list packages")
            .map_err(|e| Error::DeviceUnavailable(format!("pm list packages: {}", e)))?;
        let has_root_broker = parse::has_magisk(&packages.stdout_str());

        info!(serial = %serial, has_root_broker, "device verified");
        Ok(Device {
            ip: device_ip.to_string(),
            serial,
            has_root_broker,
        })
    }

    /// Whether `pm list packages` lists `package` exactly.
    pub fn is_installed(&self, package: &str) -> std::result::Result<bool, ToolError> {
        let out = self.shell.shell("pm list packages")?;
        Ok(parse::lists_package(&out.stdout_str(), package))
    }

    /// Install `apk` unless `package` is already present.
    ///
    /// Returns `true` when the package was already installed and nothing was
    /// done.
    pub fn install(&self, apk: &Path, package: &str, has_root_broker: bool) -> Result<bool> {
        let failed = |reason: String| Error::InstallFailed {
            package: package.to_string(),
            reason,
        };

        if self
            .is_installed(package)
            .map_err(|e| failed(format!("pm list packages: {}", e)))?
        {
            info!(package, "package already installed");
            return Ok(true);
        }

        let selinux = self
            .shell
            .privileged("setenforce 0", has_root_broker)
            .map_err(|e| failed(format!("setenforce: {}", e)))?;
        if !selinux.is_silent_success() {
            return Err(failed(format!(
                "setenforce 0 printed: {}",
                truncate_for_log(&selinux.combined(), 256)
            )));
        }

        let apk_str = apk.to_string_lossy();
        let push = self
            .shell
            .adb(&["push", apk_str.as_ref(), self.settings.staging_dir.as_str()])
            .map_err(|e| failed(format!("adb push: {}", e)))?;
        if !push.combined().contains(PUSH_MARKER) {
            return Err(failed(format!(
                "adb push did not report `{}`: {}",
                PUSH_MARKER,
                truncate_for_log(&push.combined(), 256)
            )));
        }

        let staged = self.staged_path(apk);
        let flags = if self.settings.grant_permissions { "-g " } else { "" };
        let install_cmd = format!("pm install {}{}", flags, shell_quote(&staged));
        let install = self
            .shell
            .privileged(&install_cmd, has_root_broker)
            .map_err(|e| failed(format!("pm install: {}", e)))?;

        // The staged copy is only needed by pm install.
        if let Err(e) = self.shell.shell(&format!("rm -f {}", shell_quote(&staged))) {
            debug!(error = %e, path = %staged, "staged apk not removed");
        }

        if !install.combined().contains(PM_SUCCESS_MARKER) {
            return Err(failed(format!(
                "pm install did not report `{}`: {}",
                PM_SUCCESS_MARKER,
                truncate_for_log(&install.combined(), 256)
            )));
        }

        info!(package, "package installed");
        Ok(false)
    }

    fn staged_path(&self, apk: &Path) -> String {
        let name = apk
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "target.apk".to_string());
        format!("{}/{}", self.settings.staging_dir.trim_end_matches('/'), name)
    }

    /// Read the app uid from `dumpsys package`.
    pub fn resolve_uid(&self, package: &str) -> Result<AppUid> {
        let out = self
            .shell
            .shell(&format!("dumpsys package {}", package))
            .map_err(|e| {
                warn!(package, error = %e, "dumpsys failed");
                Error::UidResolutionFailed {
                    package: package.to_string(),
                }
            })?;

        match parse::user_id(&out.stdout_str()) {
            Some(uid) => {
                debug!(package, uid = %uid, "uid resolved");
                Ok(AppUid(uid))
            }
            None => Err(Error::UidResolutionFailed {
                package: package.to_string(),
            }),
        }
    }

    /// Fire the launcher intent and wait for the process to appear.
    pub fn launch(&self, package: &str) -> Result<LaunchedApp> {
        let failed = |reason: String| Error::LaunchFailed {
            package: package.to_string(),
            reason,
        };

        let monkey = self
            .shell
            .shell(&format!(
                "monkey -p {} -c android.intent.category.LAUNCHER 1",
                package
            ))
            .map_err(|e| failed(format!("monkey: {}", e)))?;
        if parse::monkey_aborted(&monkey.combined()) {
            return Err(failed(format!(
                "no launchable activity: {}",
                truncate_for_log(&monkey.combined(), 256)
            )));
        }

        let pid = self
            .poll(
                self.settings.launch_timeout,
                self.settings.launch_poll_interval,
                || {
                    let out = self.shell.shell(&format!("pidof {}", package))?;
                    Ok(parse::first_pid(&out.stdout_str()))
                },
            )
            .map_err(|e| failed(format!("pidof: {}", e)))?;

        match pid {
            Some(pid) => {
                let started_at = self.clock.now();
                info!(package, pid, "app running");
                Ok(LaunchedApp {
                    pid: DevicePid(pid),
                    started_at,
                })
            }
            None => Err(failed(format!(
                "process not seen within {}ms",
                self.settings.launch_timeout.as_millis()
            ))),
        }
    }

    /// Whether `pid` is still listed by `ps -p`.
    pub fn process_running(&self, pid: DevicePid) -> std::result::Result<bool, ToolError> {
        let out = self.shell.shell(&format!("ps -p {}", pid))?;
        Ok(parse::ps_lists_pid(&out.stdout_str(), pid.0))
    }

    /// Force-stop the app and wait for `pid` to disappear.
    pub fn stop(&self, package: &str, pid: DevicePid) -> Result<()> {
        let stop_failed = || Error::StopFailed {
            package: package.to_string(),
            pid: pid.0,
        };

        self.shell
            .shell(&format!("am force-stop {}", package))
            .map_err(|e| {
                warn!(package, error = %e, "force-stop failed");
                stop_failed()
            })?;

        let gone = self
            .poll(
                self.settings.stop_timeout,
                self.settings.stop_poll_interval,
                || Ok((!self.process_running(pid)?).then_some(())),
            )
            .map_err(|e| {
                warn!(package, error = %e, "ps failed");
                stop_failed()
            })?;

        match gone {
            Some(()) => {
                info!(package, pid = pid.0, "app stopped");
                Ok(())
            }
            None => Err(stop_failed()),
        }
    }

    /// Remove the package.
    pub fn uninstall(&self, package: &str) -> Result<()> {
        let failed = |reason: String| Error::UninstallFailed {
            package: package.to_string(),
            reason,
        };

        let out = self
            .shell
            .shell(&format!("pm uninstall {}", package))
            .map_err(|e| failed(format!("pm uninstall: {}", e)))?;
        if !out.combined().contains(PM_SUCCESS_MARKER) {
            return Err(failed(truncate_for_log(&out.combined(), 256)));
        }

        info!(package, "package uninstalled");
        Ok(())
    }

    /// Call `probe` until it yields a value or `timeout` elapses.
    ///
    /// The probe always runs at least once; sleeps are capped at the time
    /// left.
    fn poll<T>(
        &self,
        timeout: Duration,
        interval: Duration,
        mut probe: impl FnMut() -> std::result::Result<Option<T>, ToolError>,
    ) -> std::result::Result<Option<T>, ToolError> {
        let started = self.clock.now();
        loop {
            if let Some(value) = probe()? {
                return Ok(Some(value));
            }
            let elapsed = elapsed_since(self.clock, started);
            if elapsed >= timeout {
                return Ok(None);
            }
            self.clock.sleep(interval.min(timeout - elapsed));
        }
    }
}
