//! `aapt dump badging` metadata.

use crate::exec::{CommandRunner, ToolSpec};
use exn_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Identity of the APK under analysis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApkBadging {
    pub package: String,
    pub label: String,
    pub version_name: String,
    pub version_code: String,
}

/// Run `aapt dump badging` and parse the result.
pub fn read_badging(
    runner: &dyn CommandRunner,
    aapt: &str,
    apk: &Path,
    timeout: Duration,
) -> Result<ApkBadging> {
    let spec = ToolSpec::new(
        aapt,
        vec![
            "dump".to_string(),
            "badging".to_string(),
            apk.to_string_lossy().into_owned(),
        ],
    )
    .with_timeout(timeout);
    let output = runner
        .run(&spec)
        .map_err(|e| Error::BadgingFailed(format!("{}: {}", spec.command_line(), e)))?;
    let text = output.stdout_str();
    if text.trim().is_empty() {
        return Err(Error::BadgingFailed(format!(
            "{} printed nothing (exit {:?})",
            spec.command_line(),
            output.exit_code
        )));
    }
    parse_badging(&text)
}

/// Parse badging text; every field is required.
pub fn parse_badging(text: &str) -> Result<ApkBadging> {
    let package_line = text
        .lines()
        .find(|l| l.starts_with("package:"))
        .ok_or_else(|| Error::BadgingFailed("no package line".to_string()))?;

    let field = |name: &str| {
        quoted_attr(package_line, name)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| Error::BadgingFailed(format!("package line lacks {}", name)))
    };
    let package = field("name")?;
    let version_code = field("versionCode")?;
    let version_name = field("versionName")?;

    let label = text
        .lines()
        .find_map(|l| l.strip_prefix("application-label:"))
        .map(|l| l.trim().trim_matches('\'').to_string())
        .or_else(|| {
            text.lines()
                .find(|l| l.starts_with("application:"))
                .and_then(|l| quoted_attr(l, "label"))
        })
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::BadgingFailed("no application label".to_string()))?;

    Ok(ApkBadging {
        package,
        label,
        version_name,
        version_code,
    })
}

/// Value of ` name='value'` on a badging line.
fn quoted_attr(line: &str, name: &str) -> Option<String> {
    let needle = format!(" {}='", name);
    let start = line.find(&needle)? + needle.len();
    let end = line[start..].find('\'')?;
    Some(line[start..start + end].to_string())
}
