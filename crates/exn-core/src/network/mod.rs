//! Device and host rules that force one app's traffic through the proxy.
//!
//! Rules are applied in two phases, device first. Host rules exist only while
//! device rules exist, and [`NetworkRedirector::clear`] undoes both in reverse
//! order.

pub mod host;

use crate::device::AdbShell;
use crate::logging::truncate_for_log;
use exn_common::{AppUid, Error, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use host::{HostNetwork, HostPlatform, HostPrivilege};

/// Which side of the link a rule set lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    Device,
    Host,
}

/// Applied state of one scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRuleSet {
    pub scope: RuleScope,
    pub applied: bool,
}

/// What [`NetworkRedirector::apply`] needs to know about the run.
#[derive(Debug, Clone)]
pub struct RedirectTarget {
    pub uid: AppUid,
    pub device_ip: String,
    pub proxy_port: u16,
    pub has_root_broker: bool,
}

/// Applies and clears the isolation rules.
pub struct NetworkRedirector<'a> {
    shell: AdbShell<'a>,
    host: HostNetwork<'a>,
    device_rules: NetworkRuleSet,
    host_rules: NetworkRuleSet,
    applied_to: Option<RedirectTarget>,
}

impl<'a> NetworkRedirector<'a> {
    pub fn new(shell: AdbShell<'a>, host: HostNetwork<'a>) -> Self {
        Self {
            shell,
            host,
            device_rules: NetworkRuleSet {
                scope: RuleScope::Device,
                applied: false,
            },
            host_rules: NetworkRuleSet {
                scope: RuleScope::Host,
                applied: false,
            },
            applied_to: None,
        }
    }

    pub fn rule_sets(&self) -> [NetworkRuleSet; 2] {
        [self.device_rules, self.host_rules]
    }

    /// Whether any rule is in place.
    pub fn is_applied(&self) -> bool {
        self.device_rules.applied || self.host_rules.applied
    }

    /// Apply device rules, then host rules.
    ///
    /// A failure in either phase is rolled back. When the rollback itself
    /// fails, the affected rules stay marked as applied so [`clear`](Self::clear)
    /// retries them, and the error detail names the rollback failure.
    pub fn apply(&mut self, target: &RedirectTarget) -> Result<()> {
        if self.is_applied() {
            return Err(Error::DeviceNetworkSetupFailed(
                "rules are already applied for this run".to_string(),
            ));
        }

        if let Err(detail) = self.apply_device(target) {
            return match self.rollback_device(target) {
                Ok(()) => Err(Error::DeviceNetworkSetupFailed(detail)),
                Err(rollback) => {
                    self.device_rules.applied = true;
                    self.applied_to = Some(target.clone());
                    Err(Error::DeviceNetworkSetupFailed(format!(
                        "{}; rollback failed: {}",
                        detail, rollback
                    )))
                }
            };
        }
        self.device_rules.applied = true;
        self.applied_to = Some(target.clone());

        if let Err(e) = self.apply_host(target) {
            let mut detail = e.to_string();
            match self.host.flush_nat() {
                Ok(()) => self.host_rules.applied = false,
                Err(flush) => {
                    warn!(error = %flush, "host NAT flush after failed setup");
                    self.host_rules.applied = true;
                    detail.push_str(&format!("; rollback failed: {}", flush));
                }
            }
            match self.rollback_device(target) {
                Ok(()) => self.device_rules.applied = false,
                Err(rollback) => detail.push_str(&format!("; rollback failed: {}", rollback)),
            }
            if !self.is_applied() {
                self.applied_to = None;
            }
            return Err(Error::HostNetworkSetupFailed(detail));
        }
        self.host_rules.applied = true;

        info!(
            uid = %target.uid,
            device_ip = %target.device_ip,
            proxy_port = target.proxy_port,
            "network isolated"
        );
        Ok(())
    }

    fn apply_device(&self, target: &RedirectTarget) -> std::result::Result<(), String> {
        let accept_uid = format!(
            "iptables -A OUTPUT -m owner --uid-owner {} -j ACCEPT",
            target.uid
        );
        for cmd in ["iptables -P OUTPUT DROP", accept_uid.as_str()] {
            self.device_silent(cmd, target.has_root_broker)?;
        }
        Ok(())
    }

    fn apply_host(&self, target: &RedirectTarget) -> std::result::Result<(), host::HostCommandError> {
        self.host.flush_nat()?;
        self.host.enable_forwarding()?;
        self.host.redirect(&target.device_ip, target.proxy_port)
    }

    /// Reopen the device's OUTPUT chain and drop the uid exception.
    ///
    /// Every step runs. The uid rule may never have been added, so a failed
    /// delete is only logged; any other failure is returned.
    fn rollback_device(&self, target: &RedirectTarget) -> std::result::Result<(), String> {
        let mut first_failure = None;
        for (step, cmd) in device_clear_commands(&target.uid).into_iter().enumerate() {
            if let Err(e) = self.device_silent(&cmd, target.has_root_broker) {
                warn!(command = %cmd, error = %e, "device rollback step failed");
                if step != UID_RULE_STEP {
                    first_failure.get_or_insert(e);
                }
            }
        }
        match first_failure {
            Some(detail) => Err(detail),
            None => Ok(()),
        }
    }

    fn device_silent(&self, cmd: &str, has_root_broker: bool) -> std::result::Result<(), String> {
        let output = self
            .shell
            .privileged(cmd, has_root_broker)
            .map_err(|e| format!("`{}`: {}", cmd, e))?;
        if output.is_silent_success() {
            Ok(())
        } else {
            Err(format!(
                "`{}` exited with {:?}: {}",
                cmd,
                output.exit_code,
                truncate_for_log(output.combined().trim(), 256)
            ))
        }
    }

    /// Undo everything [`apply`](Self::apply) put in place.
    ///
    /// Host rules go first. Every step runs even when an earlier one fails;
    /// the first failure is returned. Without applied rules this does nothing.
    pub fn clear(&mut self) -> Result<()> {
        let Some(target) = self.applied_to.take() else {
            return Ok(());
        };
        let mut first_failure: Option<String> = None;

        if self.host_rules.applied {
            if let Err(e) = self.host.flush_nat() {
                warn!(error = %e, "host NAT flush failed");
                first_failure.get_or_insert(e.to_string());
            }
            self.host_rules.applied = false;
        }

        if self.device_rules.applied {
            for cmd in device_clear_commands(&target.uid) {
                if let Err(e) = self.device_silent(&cmd, target.has_root_broker) {
                    warn!(command = %cmd, error = %e, "device rule removal failed");
                    first_failure.get_or_insert(e);
                }
            }
            self.device_rules.applied = false;
        }

        match first_failure {
            Some(detail) => Err(Error::NetworkRestoreFailed(detail)),
            None => {
                info!(uid = %target.uid, "network restored");
                Ok(())
            }
        }
    }
}

/// Position of the uid rule delete in [`device_clear_commands`].
const UID_RULE_STEP: usize = 1;

/// Device commands that return the firewall to its open state.
pub fn device_clear_commands(uid: &AppUid) -> Vec<String> {
    vec![
        "iptables -P OUTPUT ACCEPT".to_string(),
        format!("iptables -D OUTPUT -m owner --uid-owner {} -j ACCEPT", uid),
        "iptables -t nat -F".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_commands_reopen_before_deleting() {
        let cmds = device_clear_commands(&AppUid("u0_a123".into()));
        assert_eq!(cmds[0], "iptables -P OUTPUT ACCEPT");
        assert!(cmds[1].contains("-D OUTPUT"));
        assert!(cmds[1].contains("u0_a123"));
        assert_eq!(cmds[2], "iptables -t nat -F");
    }

    #[test]
    fn test_rule_scope_serializes_snake_case() {
        let json = serde_json::to_string(&NetworkRuleSet {
            scope: RuleScope::Device,
            applied: true,
        })
        .unwrap();
        assert_eq!(json, r#"{"scope":"device","applied":true}"#);
    }
}
