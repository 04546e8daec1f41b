//! DeviceController marker matching and polling against scripted adb output.

use exn_common::{DevicePid, Error};
use exn_core::config::RunConfig;
use exn_core::device::{DeviceController, DeviceSettings};
use exn_core::observe::Clock;
use exn_core::test_utils::{FakeClock, Reply, ScriptedRunner};
use std::path::Path;
use std::time::Duration;

const PACKAGE: &str = "com.example.tracker";

fn settings() -> DeviceSettings {
    DeviceSettings::from_config(&RunConfig::default())
}

fn devices(text: &str) -> ScriptedRunner {
    ScriptedRunner::new()
        .on("devices", Reply::stdout(text))
        .on("pm list packages", Reply::stdout("package:com.android.shell\n"))
}

#[test]
fn discover_picks_first_ready_device_and_pins_serial() {
    let runner = devices(
        "* daemon started successfully\nList of devices attached\nemulator-5554\toffline\nR58M123ABC\tdevice\n\n",
    );
    let clock = FakeClock::new();
    let mut ctl = DeviceController::new(&runner, &clock, settings());

    let device = ctl.discover("192.168.56.101").expect("device");

    assert_eq!(device.serial, "R58M123ABC");
    assert_eq!(device.ip, "192.168.56.101");
    assert!(!device.has_root_broker);
    assert_eq!(runner.calls()[1], "adb -s R58M123ABC shell pm list packages");
}

#[test]
fn discover_without_ready_device_fails() {
    let runner = devices("List of devices attached\nR58M123ABC\tunauthorized\n\n");
    let clock = FakeClock::new();
    let mut ctl = DeviceController::new(&runner, &clock, settings());

    assert!(matches!(
        ctl.discover("192.168.56.101"),
        Err(Error::DeviceUnavailable(_))
    ));
}

#[test]
fn configured_serial_must_be_ready() {
    let runner = devices("List of devices attached\nR58M123ABC\tdevice\n\n");
    let clock = FakeClock::new();
    let settings = DeviceSettings {
        serial: Some("emulator-5554".to_string()),
        ..settings()
    };
    let mut ctl = DeviceController::new(&runner, &clock, settings);

    assert!(matches!(
        ctl.discover("10.0.0.2"),
        Err(Error::DeviceUnavailable(ref m)) if m.contains("emulator-5554")
    ));
}

#[test]
fn magisk_package_means_root_broker() {
    let runner = devices("List of devices attached\nR58M123ABC\tdevice\n").on(
        "pm list packages",
        Reply::stdout("package:com.android.shell\npackage:com.topjohnwu.magisk\n"),
    );
    let clock = FakeClock::new();
    let mut ctl = DeviceController::new(&runner, &clock, settings());

    assert!(ctl.discover("10.0.0.2").expect("device").has_root_broker);
}

#[test]
fn install_requires_every_marker() {
    let clock = FakeClock::new();
    let apk = Path::new("/tmp/samples/app.apk");

    let ok = ScriptedRunner::new()
        .on("push", Reply::stdout("/tmp/samples/app.apk: 1 file pushed, 0 skipped.\n"))
        .on("pm install", Reply::stdout("Success\n"));
    let ctl = DeviceController::new(&ok, &clock, settings());
    assert_eq!(ctl.install(apk, PACKAGE, false).ok(), Some(false));
    let calls = ok.calls();
    assert!(calls.iter().any(|c| c.ends_with("shell su 0 setenforce 0")));
    assert!(calls.iter().any(|c| c == "adb push /tmp/samples/app.apk /data/local/tmp"));
    assert!(calls
        .iter()
        .any(|c| c.ends_with("shell su 0 pm install /data/local/tmp/app.apk")));

    let noisy_selinux = ScriptedRunner::new()
        .on("setenforce", Reply::stderr("setenforce: Couldn't set enforcing status\n"));
    let ctl = DeviceController::new(&noisy_selinux, &clock, settings());
    assert!(matches!(
        ctl.install(apk, PACKAGE, false),
        Err(Error::InstallFailed { .. })
    ));
    assert_eq!(noisy_selinux.count("push"), 0);

    let no_push = ScriptedRunner::new()
        .on("push", Reply::stderr("adb: error: failed to copy\n"));
    let ctl = DeviceController::new(&no_push, &clock, settings());
    assert!(matches!(
        ctl.install(apk, PACKAGE, false),
        Err(Error::InstallFailed { ref reason, .. }) if reason.contains("file pushed")
    ));

    let rejected = ScriptedRunner::new()
        .on("push", Reply::stdout("1 file pushed\n"))
        .on("pm install", Reply::stdout("Failure [INSTALL_FAILED_OLDER_SDK]\n"));
    let ctl = DeviceController::new(&rejected, &clock, settings());
    assert!(matches!(
        ctl.install(apk, PACKAGE, false),
        Err(Error::InstallFailed { ref reason, .. }) if reason.contains("OLDER_SDK")
    ));
}

#[test]
fn install_is_a_noop_when_package_is_listed() {
    let runner = ScriptedRunner::new().on(
        "pm list packages",
        Reply::stdout(format!("package:{PACKAGE}.debug\npackage:{PACKAGE}\n")),
    );
    let clock = FakeClock::new();
    let ctl = DeviceController::new(&runner, &clock, settings());

    assert_eq!(
        ctl.install(Path::new("/tmp/app.apk"), PACKAGE, true).ok(),
        Some(true)
    );
    assert_eq!(runner.calls().len(), 1);
}

#[test]
fn resolve_uid_reads_user_id_marker() {
    let runner = ScriptedRunner::new().on(
        "dumpsys package",
        Reply::stdout("  Package [com.example.tracker] (c0ffee):\n    userId=u0_a123\n    sharedUser=null\n"),
    );
    let clock = FakeClock::new();
    let ctl = DeviceController::new(&runner, &clock, settings());

    assert_eq!(ctl.resolve_uid(PACKAGE).expect("uid").as_str(), "u0_a123");

    runner.add("dumpsys package", vec![Reply::stdout("Unable to find package\n")]);
    assert!(matches!(
        ctl.resolve_uid(PACKAGE),
        Err(Error::UidResolutionFailed { .. })
    ));
}

#[test]
fn launch_polls_pidof_until_the_process_appears() {
    let runner = ScriptedRunner::new().on_seq(
        "pidof",
        vec![Reply::silent(), Reply::silent(), Reply::stdout("4242\n")],
    );
    let clock = FakeClock::new();
    let t0 = clock.now();
    let ctl = DeviceController::new(&runner, &clock, settings());

    let launched = ctl.launch(PACKAGE).expect("launch");

    assert_eq!(launched.pid, DevicePid(4242));
    assert_eq!(clock.sleeps(), vec![Duration::from_millis(500); 2]);
    assert_eq!(
        launched.started_at - t0,
        chrono::Duration::milliseconds(1000)
    );
    assert!(runner.calls()[0].contains("monkey -p com.example.tracker -c android.intent.category.LAUNCHER 1"));
}

#[test]
fn launch_gives_up_after_the_timeout() {
    let runner = ScriptedRunner::new();
    let clock = FakeClock::new();
    let ctl = DeviceController::new(&runner, &clock, settings());

    assert!(matches!(
        ctl.launch(PACKAGE),
        Err(Error::LaunchFailed { .. })
    ));
    assert_eq!(clock.total_slept(), Duration::from_secs(10));
}

#[test]
fn launch_without_launcher_activity_fails_fast() {
    let runner = ScriptedRunner::new().on(
        "monkey",
        Reply::stdout("** No activities found to run, monkey aborted.\n"),
    );
    let clock = FakeClock::new();
    let ctl = DeviceController::new(&runner, &clock, settings());

    assert!(matches!(ctl.launch(PACKAGE), Err(Error::LaunchFailed { .. })));
    assert_eq!(runner.count("pidof"), 0);
}

#[test]
fn stop_waits_for_the_pid_to_disappear() {
    let row = "USER      PID   PPID  VSZ   RSS  WCHAN  ADDR S NAME\nu0_a123  4242   612 1234  5678  0      0    S com.example.tracker\n";
    let gone = "USER      PID   PPID  VSZ   RSS  WCHAN  ADDR S NAME\n";
    let runner = ScriptedRunner::new().on_seq(
        "ps -p 4242",
        vec![Reply::stdout(row), Reply::stdout(row), Reply::stdout(gone)],
    );
    let clock = FakeClock::new();
    let ctl = DeviceController::new(&runner, &clock, settings());

    ctl.stop(PACKAGE, DevicePid(4242)).expect("stop");

    assert_eq!(runner.count("am force-stop com.example.tracker"), 1);
    assert_eq!(runner.count("ps -p 4242"), 3);
}

#[test]
fn stop_fails_when_the_pid_survives() {
    let runner = ScriptedRunner::new().on(
        "ps -p",
        Reply::stdout("PID NAME\n4242 com.example.tracker\n"),
    );
    let clock = FakeClock::new();
    let ctl = DeviceController::new(&runner, &clock, settings());

    assert!(matches!(
        ctl.stop(PACKAGE, DevicePid(4242)),
        Err(Error::StopFailed { pid: 4242, .. })
    ));
}

#[test]
fn uninstall_requires_success_marker() {
    let clock = FakeClock::new();

    let ok = ScriptedRunner::new().on("pm uninstall", Reply::stdout("Success\n"));
    assert!(DeviceController::new(&ok, &clock, settings())
        .uninstall(PACKAGE)
        .is_ok());

    let failed = ScriptedRunner::new().on(
        "pm uninstall",
        Reply::stdout("Failure [DELETE_FAILED_INTERNAL_ERROR]\n"),
    );
    assert!(matches!(
        DeviceController::new(&failed, &clock, settings()).uninstall(PACKAGE),
        Err(Error::UninstallFailed { .. })
    ));
}
