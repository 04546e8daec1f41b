//! Parsers for adb and Android shell output.
//!
//! Each function answers one question about fabricated-or-real command text;
//! the absence of the expected marker is always the negative answer.

use regex::Regex;
use std::sync::OnceLock;

/// Serials whose state column in `adb devices` reads exactly `device`.
///
/// `offline`, `unauthorized` and daemon banner lines are skipped.
pub fn ready_serials(adb_devices: &str) -> Vec<String> {
    adb_devices
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let serial = cols.next()?;
            let state = cols.next()?;
            (state == "device").then(|| serial.to_string())
        })
        .collect()
}

/// Package names from `pm list packages` (`package:<name>` lines).
pub fn listed_packages(pm_list: &str) -> impl Iterator<Item = &str> {
    pm_list
        .lines()
        .filter_map(|line| line.trim().strip_prefix("package:"))
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

/// Whether `pm list packages` lists exactly `package`.
pub fn lists_package(pm_list: &str, package: &str) -> bool {
    listed_packages(pm_list).any(|name| name == package)
}

/// Whether a Magisk root broker package is installed.
pub fn has_magisk(pm_list: &str) -> bool {
    listed_packages(pm_list).any(|name| name.to_ascii_lowercase().contains("magisk"))
}

fn user_id_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\buserId=(\S+)").ok())
        .as_ref()
}

/// Value of the first `userId=<value>` marker in `dumpsys package` output.
pub fn user_id(dumpsys: &str) -> Option<String> {
    let captures = user_id_pattern()?.captures(dumpsys)?;
    let value = captures.get(1)?.as_str();
    Some(value.to_string())
}

/// First pid printed by `pidof`.
pub fn first_pid(pidof: &str) -> Option<u32> {
    pidof.split_whitespace().next()?.parse().ok()
}

/// Whether `ps -p <pid>` output has a process row for `pid`.
///
/// Only the `PID` column counts. Old toolbox `ps` ignores `-p` and lists
/// every process, so the pid also turns up as another row's PPID or RSS.
pub fn ps_lists_pid(ps: &str, pid: u32) -> bool {
    let wanted = pid.to_string();
    let mut lines = ps.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return false;
    };
    let Some(pid_col) = header.split_whitespace().position(|col| col == "PID") else {
        return false;
    };
    lines.any(|line| line.split_whitespace().nth(pid_col) == Some(wanted.as_str()))
}

/// Whether `monkey` refused to fire the launcher intent.
pub fn monkey_aborted(monkey: &str) -> bool {
    monkey.contains("monkey aborted") || monkey.contains("No activities found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_serials() {
        let out = "* daemon not running; starting now at tcp:5037\n\
                   * daemon started successfully\n\
                   List of devices attached\n\
                   emulator-5554\tdevice\n\
                   R58M12ABCDE\tunauthorized\n\
                   192.168.1.50:5555\toffline\n\
                   0123456789ABCDEF\tdevice\n\n";
        assert_eq!(
            ready_serials(out),
            vec!["emulator-5554".to_string(), "0123456789ABCDEF".to_string()]
        );
    }

    #[test]
    fn test_ready_serials_empty() {
        assert!(ready_serials("List of devices attached\n\n").is_empty());
        assert!(ready_serials("").is_empty());
    }

    #[test]
    fn test_lists_package_is_exact() {
        let out = "package:com.android.settings\npackage:com.example.app.debug\n";
        assert!(!lists_package(out, "com.example.app"));
        assert!(lists_package(out, "com.example.app.debug"));
        assert!(lists_package("package:com.example.app\r\n", "com.example.app"));
    }

    #[test]
    fn test_has_magisk() {
        assert!(has_magisk("package:com.android.shell\npackage:com.topjohnwu.magisk\n"));
        assert!(!has_magisk("package:com.android.shell\npackage:eu.chainfire.supersu\n"));
        assert!(!has_magisk(""));
    }

    #[test]
    fn test_user_id_textual() {
        let dumpsys = "Packages:\n  Package [com.example.app] (c0ffee):\n    userId=u0_a123\n    pkg=Package{...}\n";
        assert_eq!(user_id(dumpsys), Some("u0_a123".to_string()));
    }

    #[test]
    fn test_user_id_numeric() {
        let dumpsys = "    appId=10123\n    userId=10123 gids=[3003]\n";
        assert_eq!(user_id(dumpsys), Some("10123".to_string()));
    }

    #[test]
    fn test_user_id_missing() {
        assert_eq!(user_id("Unable to find package: com.example.app\n"), None);
        assert_eq!(user_id("sharedUserId= \n"), None);
    }

    #[test]
    fn test_first_pid() {
        assert_eq!(first_pid("4242\n"), Some(4242));
        assert_eq!(first_pid("4242 4300\n"), Some(4242));
        assert_eq!(first_pid(""), None);
        assert_eq!(first_pid("pidof: not found"), None);
    }

    #[test]
    fn test_ps_lists_pid() {
        let running = "USER           PID  PPID     VSZ    RSS WCHAN            ADDR S NAME\n\
                       u0_a123       4242   612 1234567  89012 0                   0 S com.example.app\n";
        assert!(ps_lists_pid(running, 4242));
        assert!(!ps_lists_pid(running, 424));

        let gone = "USER           PID  PPID     VSZ    RSS WCHAN            ADDR S NAME\n";
        assert!(!ps_lists_pid(gone, 4242));
        assert!(!ps_lists_pid("", 4242));
        assert!(!ps_lists_pid("bad pid '4242'\n", 4242));
    }

    #[test]
    fn test_ps_lists_pid_ignores_other_columns() {
        let header = "USER           PID  PPID     VSZ    RSS WCHAN            ADDR S NAME\n";
        let cases = [
            ("u0_a77        5000  4242 1234567  89012 0                   0 S com.other.child\n", false),
            ("u0_a77        5001   612 1234567   4242 0                   0 S com.other.app\n", false),
            ("u0_a77        5002   612    4242  89012 0                   0 S com.other.app\n", false),
            ("u0_a123       4242   612 1234567  89012 0                   0 S com.example.app\n", true),
        ];
        for (row, expected) in cases {
            let ps = format!("{}{}", header, row);
            assert_eq!(ps_lists_pid(&ps, 4242), expected, "row: {}", row.trim());
        }
    }

    #[test]
    fn test_ps_lists_pid_toolbox_listing() {
        let ps = "USER     PID   PPID  VSIZE  RSS     WCHAN    PC         NAME\n\
                  root      1     0     8856   736   ffffffff 00000000 S /init\n\
                  u0_a77    5000  4242  1044000 4242 ffffffff 00000000 S com.other.app\n";
        assert!(!ps_lists_pid(ps, 4242));
        assert!(ps_lists_pid(ps, 5000));
    }

    #[test]
    fn test_monkey_aborted() {
        assert!(monkey_aborted("** No activities found to run, monkey aborted.\n"));
        assert!(!monkey_aborted("Events injected: 1\n## Network stats: elapsed time=12ms\n"));
    }
}
