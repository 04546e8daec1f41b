//! Run identity types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process ID on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DevicePid(pub u32);

impl fmt::Display for DevicePid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for DevicePid {
    fn from(pid: u32) -> Self {
        DevicePid(pid)
    }
}

/// Android application uid as printed by `dumpsys package`.
///
/// Kept as text: depending on the Android release the marker carries either
/// a numeric uid (`userId=10123`) or a user-app name (`userId=u0_a123`), and
/// both forms are accepted by `iptables --uid-owner` on the device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppUid(pub String);

impl AppUid {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Run ID for correlating logs, locks and outcome documents.
///
/// Format: `exn-YYYYMMDD-HHMMSS-XXXX`
/// Example: `exn-20260115-143022-a7xq`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    const LEN: usize = 24;

    /// Generate a new run ID.
    pub fn new() -> Self {
        let now = chrono::Utc::now();
        RunId(format!(
            "exn-{}-{}-{}",
            now.format("%Y%m%d"),
            now.format("%H%M%S"),
            generate_base32_suffix()
        ))
    }

    /// Parse an existing run ID string.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != Self::LEN || !s.starts_with("exn-") {
            return None;
        }
        let bytes = s.as_bytes();
        if bytes.get(12) != Some(&b'-') || bytes.get(19) != Some(&b'-') {
            return None;
        }
        let date = &s[4..12];
        let time = &s[13..19];
        let suffix = &s[20..24];
        if !date.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        if !time.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        if !suffix.chars().all(|c| matches!(c, 'a'..='z' | '2'..='7')) {
            return None;
        }
        Some(RunId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn generate_base32_suffix() -> String {
    let uuid = uuid::Uuid::new_v4();
    let bytes = uuid.as_bytes();
    let value = ((bytes[0] as u32) << 12) | ((bytes[1] as u32) << 4) | ((bytes[2] as u32) >> 4);
    let alphabet = b"abcdefghijklmnopqrstuvwxyz234567";
    [15_u32, 10, 5, 0]
        .iter()
        .map(|shift| alphabet[((value >> shift) & 0x1F) as usize] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_id_format() {
        let id = RunId::new();
        assert!(id.0.starts_with("exn-"));
        assert_eq!(id.0.len(), 24);
    }

    #[test]
    fn test_run_id_roundtrips_through_parse() {
        let id = RunId::new();
        assert_eq!(RunId::parse(id.as_str()), Some(id));
    }

    #[test]
    fn test_run_id_parse_rejects_garbage() {
        assert!(RunId::parse("pt-20260115-143022-a7xq").is_none());
        assert!(RunId::parse("exn-2026011x-143022-a7xq").is_none());
        assert!(RunId::parse("exn-20260115-143022-A7XQ").is_none());
        assert!(RunId::parse("exn-20260115_143022-a7xq").is_none());
        assert!(RunId::parse("exn-20260115-143022-a7xq1").is_none());
    }

    #[test]
    fn test_app_uid_display() {
        let uid = AppUid("u0_a123".to_string());
        assert_eq!(uid.to_string(), "u0_a123");
        assert_eq!(uid.as_str(), "u0_a123");
    }
}
