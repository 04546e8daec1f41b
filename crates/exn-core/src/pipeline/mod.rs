//! The analysis run: prepare, isolate, observe, tear down.
//!
//! [`analyze`] never returns early without tearing down. Every resource the
//! run commits (installed package, firewall rules, proxy process, launched
//! app) is released by one teardown path in reverse acquisition order,
//! whether the run succeeded, failed, or was interrupted.

pub mod context;
pub mod lock;
pub mod outcome;
pub mod state;

pub use context::{RunContext, StateTransition};
pub use lock::{lock_path, LockError, RunLock};
pub use outcome::{ObservationSummary, RunOutcome};
pub use state::RunState;

use crate::apk::{read_badging, ApkBadging, DecompiledTree, Decompiler, JadxDecompiler};
use crate::device::{Device, DeviceController, DeviceSettings, TargetApp};
use crate::exec::CommandRunner;
use crate::logging::events::{event_names, LogEvent, Stage};
use crate::network::{HostNetwork, HostPlatform, NetworkRedirector, RedirectTarget};
use crate::observe::{Clock, ObservationScheduler, ObservationWindow, WaitOutcome};
use crate::proxy::{
    session_tag, CaptureData, InterceptionProxyManager, InterceptionSession, ProxyLauncher,
    ProxySpec,
};
use exn_common::{Error, Result, StructuredError};
use std::path::PathBuf;
use std::time::Duration;

/// File name of the HAR capture inside the work directory.
pub const CAPTURE_FILE: &str = "dump.har";

/// File name of the proxy's own log inside the work directory.
pub const PROXY_LOG_FILE: &str = "mitmdump.log";

/// Directory decompiled output goes to inside the work directory.
pub const DECOMPILE_DIR: &str = "jadx";

/// External seams of a run.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub runner: &'a dyn CommandRunner,
    pub launcher: &'a dyn ProxyLauncher,
    pub clock: &'a dyn Clock,
    pub platform: HostPlatform,
}

/// What to analyze.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub apk: PathBuf,
    pub device_ip: String,
    pub activity_time: Duration,
}

/// Run one full analysis and report what happened.
pub fn analyze(ctx: RunContext, request: &AnalysisRequest, deps: Collaborators<'_>) -> RunOutcome {
    let mut run = Pipeline::new(ctx, deps);
    let started_at = deps.clock.now();
    run.emit(
        run.ctx
            .log
            .info(event_names::RUN_STARTED, Stage::Init, "analysis run started")
            .with_field("apk", request.apk.display().to_string())
            .with_field("device_ip", &request.device_ip),
    );

    let lock_file = lock_path(&run.ctx.config.resolved_state_dir(), &request.device_ip);
    let _lock = match RunLock::acquire(&lock_file) {
        Ok(lock) => {
            run.emit(
                run.ctx
                    .log
                    .debug(event_names::LOCK_ACQUIRED, Stage::Init, "device lock acquired")
                    .with_field("path", lock.path().display().to_string()),
            );
            lock
        }
        Err(e) => return run.finish(request, started_at, Some(e.into())),
    };

    let failure = match run.prepare(request) {
        Ok(()) => run.dynamic(request),
        Err(e) => Err(e),
    };
    let failure = match failure {
        Ok(()) => None,
        Err(e) => {
            run.record_failure(&e);
            Some(e)
        }
    };

    let succeeded = failure.is_none();
    let teardown_failure = run.teardown(succeeded);
    let failure = failure.or(teardown_failure);
    run.finish(request, started_at, failure)
}

struct Pipeline<'a> {
    ctx: RunContext,
    deps: Collaborators<'a>,
    device_ctl: DeviceController<'a>,
    proxy: InterceptionProxyManager<'a>,
    redirector: Option<NetworkRedirector<'a>>,
    badging: Option<ApkBadging>,
    decompiled: Option<DecompiledTree>,
    device: Option<Device>,
    target: Option<TargetApp>,
    session: Option<InterceptionSession>,
    observation: Option<ObservationSummary>,
    capture: CaptureData,
    uninstall_attempted: bool,
    teardown_errors: Vec<Error>,
}

impl<'a> Pipeline<'a> {
    fn new(ctx: RunContext, deps: Collaborators<'a>) -> Self {
        let device_ctl = DeviceController::new(
            deps.runner,
            deps.clock,
            DeviceSettings::from_config(&ctx.config),
        );
        let proxy = InterceptionProxyManager::new(
            deps.launcher,
            deps.clock,
            ctx.config.proxy_settle_delay,
            ctx.config.proxy_stop_grace,
        );
        Self {
            ctx,
            deps,
            device_ctl,
            proxy,
            redirector: None,
            badging: None,
            decompiled: None,
            device: None,
            target: None,
            session: None,
            observation: None,
            capture: CaptureData::default(),
            uninstall_attempted: false,
            teardown_errors: Vec::new(),
        }
    }

    fn emit(&mut self, mut event: LogEvent) {
        event.ts = self.deps.clock.now();
        self.ctx.record(event);
    }

    fn enter(&mut self, state: RunState) {
        let at = self.deps.clock.now();
        self.ctx.enter(state, at);
        self.emit(
            self.ctx
                .log
                .debug(event_names::STATE_ENTERED, stage_of(state), format!("entered {}", state))
                .with_field("state", state),
        );
    }

    /// Fail with `Interrupted` once a termination signal arrived.
    fn checkpoint(&mut self, stage: Stage) -> Result<()> {
        if !self.ctx.cancel.is_cancelled() {
            return Ok(());
        }
        self.emit(self.ctx.log.warn(
            event_names::RUN_INTERRUPTED,
            stage,
            "termination requested, tearing down",
        ));
        Err(Error::Interrupted)
    }

    fn record_failure(&mut self, err: &Error) {
        let stage = stage_of(self.ctx.current_state());
        self.emit(
            self.ctx
                .log
                .error(event_names::RUN_ABORTED, stage, err.to_string())
                .with_field("kind", err.kind_name())
                .with_field("code", err.code()),
        );
    }

    /// Static steps: badging, then optional decompilation.
    fn prepare(&mut self, request: &AnalysisRequest) -> Result<()> {
        self.checkpoint(Stage::Prepare)?;
        let config = &self.ctx.config;
        let badging = read_badging(
            self.deps.runner,
            &config.tools.aapt,
            &request.apk,
            config.command_timeout,
        )?;
        self.emit(
            self.ctx
                .log
                .info(event_names::BADGING_PARSED, Stage::Prepare, "apk badging read")
                .with_field("package", &badging.package)
                .with_field("label", &badging.label)
                .with_field("version_name", &badging.version_name)
                .with_field("version_code", &badging.version_code),
        );
        self.target = Some(TargetApp::new(badging.package.clone()));
        self.badging = Some(badging);

        if !self.ctx.config.decompile {
            self.emit(self.ctx.log.debug(
                event_names::DECOMPILE_SKIPPED,
                Stage::Prepare,
                "decompilation disabled",
            ));
            return Ok(());
        }
        self.checkpoint(Stage::Prepare)?;
        let jadx = JadxDecompiler::new(
            self.deps.runner,
            self.ctx.config.tools.jadx.clone(),
            self.ctx.config.decompile_timeout,
        );
        let decompiler: &dyn Decompiler = &jadx;
        let tree = decompiler.decompile(&request.apk, &self.ctx.workdir.join(DECOMPILE_DIR))?;
        self.emit(
            self.ctx
                .log
                .info(event_names::DECOMPILE_FINISHED, Stage::Prepare, "apk decompiled")
                .with_field("manifest", tree.manifest.display().to_string())
                .with_field("reused", tree.reused),
        );
        self.decompiled = Some(tree);
        Ok(())
    }

    /// Device, network, proxy, launch and observation, in that order.
    fn dynamic(&mut self, request: &AnalysisRequest) -> Result<()> {
        let package = match &self.target {
            Some(target) => target.package.clone(),
            None => return Err(Error::BadgingFailed("package name unknown".to_string())),
        };

        self.checkpoint(Stage::Device)?;
        let device = self.device_ctl.discover(&request.device_ip)?;
        self.ctx.log.device = Some(device.ip.clone());
        self.device = Some(device.clone());
        self.enter(RunState::DeviceVerified);
        self.emit(
            self.ctx
                .log
                .info(event_names::DEVICE_VERIFIED, Stage::Device, "device ready")
                .with_field("serial", &device.serial)
                .with_field("has_root_broker", device.has_root_broker),
        );

        self.checkpoint(Stage::Install)?;
        let already_installed =
            self.device_ctl
                .install(&request.apk, &package, device.has_root_broker)?;
        if let Some(target) = self.target.as_mut() {
            target.installed = true;
            target.already_installed = already_installed;
        }
        self.enter(RunState::AppInstalled);
        let (name, message) = if already_installed {
            (event_names::APP_ALREADY_INSTALLED, "package was already installed")
        } else {
            (event_names::APP_INSTALLED, "package installed")
        };
        self.emit(
            self.ctx
                .log
                .info(name, Stage::Install, message)
                .with_field("package", &package),
        );

        self.checkpoint(Stage::Install)?;
        let uid = self.device_ctl.resolve_uid(&package)?;
        if let Some(target) = self.target.as_mut() {
            target.uid = Some(uid.clone());
        }
        self.emit(
            self.ctx
                .log
                .info(event_names::UID_RESOLVED, Stage::Install, "app uid resolved")
                .with_field("uid", uid.as_str()),
        );

        self.checkpoint(Stage::Network)?;
        let host = HostNetwork::new(
            self.deps.runner,
            self.ctx.host_privilege.clone(),
            self.deps.platform,
            &self.ctx.config.tools,
            self.ctx.config.command_timeout,
        );
        let redirector = self
            .redirector
            .insert(NetworkRedirector::new(self.device_ctl.shell().clone(), host));
        let target = RedirectTarget {
            uid,
            device_ip: device.ip.clone(),
            proxy_port: self.ctx.config.proxy_port,
            has_root_broker: device.has_root_broker,
        };
        if let Err(e) = redirector.apply(&target) {
            let left_applied = redirector.is_applied();
            self.emit(
                self.ctx
                    .log
                    .warn(
                        event_names::NETWORK_ROLLED_BACK,
                        Stage::Network,
                        "isolation failed, rules rolled back",
                    )
                    .with_field("kind", e.kind_name())
                    .with_field("left_applied", left_applied),
            );
            return Err(e);
        }
        self.enter(RunState::NetworkIsolated);
        self.emit(
            self.ctx
                .log
                .info(event_names::NETWORK_APPLIED, Stage::Network, "app traffic isolated")
                .with_field("proxy_port", self.ctx.config.proxy_port),
        );

        self.checkpoint(Stage::Intercept)?;
        let spec = ProxySpec::mitmdump(
            &self.ctx.config.tools,
            self.ctx.config.proxy_port,
            &self.ctx.workdir.join(CAPTURE_FILE),
            &session_tag(self.deps.clock.now()),
            Some(self.ctx.workdir.join(PROXY_LOG_FILE)),
        );
        let session = self.proxy.start(&spec)?;
        let pid = session.pid;
        self.session = Some(session);
        self.enter(RunState::Intercepting);
        self.emit(
            self.ctx
                .log
                .info(event_names::PROXY_STARTED, Stage::Intercept, "proxy running")
                .with_field("pid", pid)
                .with_field("tag", &spec.tag),
        );

        self.checkpoint(Stage::Launch)?;
        let launched = self.device_ctl.launch(&package)?;
        if let Some(target) = self.target.as_mut() {
            target.pid = Some(launched.pid);
        }
        self.enter(RunState::AppRunning);
        self.emit(
            self.ctx
                .log
                .info(event_names::APP_LAUNCHED, Stage::Launch, "app running")
                .with_field("pid", launched.pid.0),
        );

        self.enter(RunState::Observing);
        let window = ObservationWindow {
            anchor: launched.started_at,
            duration: request.activity_time,
        };
        self.emit(
            self.ctx
                .log
                .info(event_names::OBSERVE_STARTED, Stage::Observe, "observing app activity")
                .with_field("duration_ms", window.duration.as_millis() as u64),
        );
        let scheduler = ObservationScheduler::new(
            self.deps.clock,
            self.ctx.config.observe_poll_interval,
            self.ctx.cancel.clone(),
        );
        let waited = scheduler.wait(window);
        let cancelled = matches!(waited, WaitOutcome::Cancelled { .. });
        self.observation = Some(ObservationSummary {
            window,
            blocked: waited.blocked(),
            cancelled,
        });
        self.emit(
            self.ctx
                .log
                .info(event_names::OBSERVE_FINISHED, Stage::Observe, "observation window closed")
                .with_field("blocked_ms", waited.blocked().as_millis() as u64)
                .with_field("cancelled", cancelled),
        );
        self.checkpoint(Stage::Observe)
    }

    /// Release everything in reverse acquisition order.
    ///
    /// Every step runs. On the success path the first failure is returned
    /// and the teardown states are entered for steps that worked; on the
    /// failure path failures are only kept as teardown errors.
    fn teardown(&mut self, succeeded: bool) -> Option<Error> {
        let mut first: Option<Error> = None;
        let package = self.target.as_ref().map(|t| t.package.clone());

        // 1. app
        let running = self
            .target
            .as_ref()
            .and_then(|t| t.pid)
            .zip(package.clone());
        let mut app_stopped = true;
        if let Some((pid, package)) = running {
            match self.device_ctl.stop(&package, pid) {
                Ok(()) => {
                    if let Some(target) = self.target.as_mut() {
                        target.pid = None;
                    }
                    self.emit(
                        self.ctx
                            .log
                            .info(event_names::APP_STOPPED, Stage::Teardown, "app stopped")
                            .with_field("pid", pid.0),
                    );
                }
                Err(e) => {
                    app_stopped = false;
                    self.teardown_failed(e, succeeded, &mut first);
                }
            }
        }
        if succeeded && app_stopped {
            self.enter(RunState::AppStopped);
        }

        // 2. proxy
        let stopped_proxy = match self.session.as_mut() {
            Some(session) if session.is_running() => {
                self.proxy.stop(session);
                Some(session.pid)
            }
            _ => None,
        };
        if let Some(pid) = stopped_proxy {
            self.emit(
                self.ctx
                    .log
                    .info(event_names::PROXY_STOPPED, Stage::Teardown, "proxy stopped")
                    .with_field("pid", pid),
            );
        }

        // 3. network
        let mut restored = true;
        if let Some(redirector) = self.redirector.as_mut() {
            let was_applied = redirector.is_applied();
            match redirector.clear() {
                Ok(()) if was_applied => {
                    self.emit(self.ctx.log.info(
                        event_names::NETWORK_CLEARED,
                        Stage::Teardown,
                        "network rules cleared",
                    ));
                }
                Ok(()) => {}
                Err(e) => {
                    restored = false;
                    self.teardown_failed(e, succeeded, &mut first);
                }
            }
        }
        if succeeded && restored {
            self.enter(RunState::NetworkRestored);
        }

        // 4. capture, once the proxy has flushed it
        if let Some(path) = self.session.as_ref().map(|s| s.capture_path.clone()) {
            let read = self.proxy.read_capture(&path);
            self.capture = read.data;
            match read.failure {
                Some(err) => self.emit(
                    self.ctx
                        .log
                        .warn(event_names::CAPTURE_READ_FAILED, Stage::Teardown, err.to_string())
                        .with_field("kind", err.kind_name())
                        .with_field("path", path.display().to_string()),
                ),
                None => self.emit(
                    self.ctx
                        .log
                        .info(event_names::CAPTURE_READ, Stage::Teardown, "capture read")
                        .with_field("entries", self.capture.len()),
                ),
            }
        }

        // 5. package, exactly once whenever a device was verified
        let mut uninstalled = true;
        let uninstall = package.filter(|_| self.device.is_some() && !self.uninstall_attempted);
        if let Some(package) = uninstall {
            self.uninstall_attempted = true;
            match self.device_ctl.uninstall(&package) {
                Ok(()) => {
                    if let Some(target) = self.target.as_mut() {
                        target.installed = false;
                    }
                    self.emit(
                        self.ctx
                            .log
                            .info(event_names::APP_UNINSTALLED, Stage::Teardown, "package removed")
                            .with_field("package", &package),
                    );
                }
                Err(e) => {
                    uninstalled = false;
                    self.teardown_failed(e, succeeded, &mut first);
                }
            }
        }
        if succeeded && uninstalled {
            self.enter(RunState::AppUninstalled);
        }

        first
    }

    fn teardown_failed(&mut self, err: Error, succeeded: bool, first: &mut Option<Error>) {
        self.emit(
            self.ctx
                .log
                .warn(event_names::TEARDOWN_STEP_FAILED, Stage::Teardown, err.to_string())
                .with_field("kind", err.kind_name()),
        );
        if succeeded && first.is_none() {
            *first = Some(err);
        } else {
            self.teardown_errors.push(err);
        }
    }

    fn finish(
        mut self,
        request: &AnalysisRequest,
        started_at: chrono::DateTime<chrono::Utc>,
        failure: Option<Error>,
    ) -> RunOutcome {
        let final_state = match &failure {
            None => RunState::Complete,
            Some(_) => RunState::failure_after(self.ctx.furthest_state()),
        };
        self.enter(final_state);
        let event = match &failure {
            None => self.ctx.log.info(
                event_names::RUN_FINISHED,
                Stage::Report,
                "analysis run complete",
            ),
            Some(err) => self
                .ctx
                .log
                .error(event_names::RUN_FINISHED, Stage::Report, err.headline())
                .with_field("kind", err.kind_name()),
        };
        self.emit(event.with_field("final_state", final_state));

        let finished_at = self.deps.clock.now();
        let run_id = self.ctx.run_id.clone();
        let error = failure.as_ref().map(StructuredError::from);
        let teardown_errors = self.teardown_errors.iter().map(StructuredError::from).collect();
        let (states, events) = self.ctx.into_record();
        RunOutcome {
            run_id,
            apk: request.apk.clone(),
            badging: self.badging,
            decompiled: self.decompiled,
            device: self.device,
            target: self.target,
            final_state,
            states,
            observation: self.observation,
            capture: self.capture,
            events,
            error,
            teardown_errors,
            started_at,
            finished_at,
            failure,
        }
    }
}

/// Stage a state belongs to, for event tagging.
fn stage_of(state: RunState) -> Stage {
    match state {
        RunState::Idle => Stage::Init,
        RunState::DeviceVerified => Stage::Device,
        RunState::AppInstalled => Stage::Install,
        RunState::NetworkIsolated => Stage::Network,
        RunState::Intercepting => Stage::Intercept,
        RunState::AppRunning => Stage::Launch,
        RunState::Observing => Stage::Observe,
        RunState::AppStopped | RunState::NetworkRestored | RunState::AppUninstalled => {
            Stage::Teardown
        }
        RunState::Complete | RunState::Aborted | RunState::Failed => Stage::Report,
    }
}
