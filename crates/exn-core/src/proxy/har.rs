//! HAR capture written by the proxy addon.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::Path;
use url::{Host, Url};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarRequest {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub url: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HarResponse {
    #[serde(default)]
    pub status: i64,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// One intercepted request/response pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarEntry {
    #[serde(default)]
    pub started_date_time: String,
    #[serde(default)]
    pub request: HarRequest,
    #[serde(default)]
    pub response: HarResponse,
    #[serde(
        default,
        rename = "serverIPAddress",
        skip_serializing_if = "Option::is_none"
    )]
    pub server_ip_address: Option<String>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl HarEntry {
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.started_date_time)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Host of the request URL, lowercased; IPv6 literals lose their brackets.
    pub fn host(&self) -> Option<String> {
        let url = Url::parse(&self.request.url).ok()?;
        match url.host()? {
            Host::Domain(domain) if !domain.is_empty() => Some(domain.to_string()),
            Host::Domain(_) => None,
            Host::Ipv4(addr) => Some(addr.to_string()),
            Host::Ipv6(addr) => Some(addr.to_string()),
        }
    }
}

#[derive(Deserialize)]
struct HarDocument {
    log: HarLog,
}

#[derive(Deserialize)]
struct HarLog {
    #[serde(default)]
    entries: Vec<HarEntry>,
}

/// Parsed capture, entries ordered by start time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureData {
    pub entries: Vec<HarEntry>,
}

impl CaptureData {
    /// Parse a HAR document.
    ///
    /// Entries whose start time cannot be parsed keep their relative order
    /// after all dated ones.
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        let doc: HarDocument = serde_json::from_slice(bytes)?;
        let mut entries = doc.log.entries;
        entries.sort_by_cached_key(|e| {
            let started = e.started_at();
            (started.is_none(), started)
        });
        Ok(Self { entries })
    }

    pub fn read(path: &Path) -> Result<Self, String> {
        let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
        Self::parse(&bytes).map_err(|e| e.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Distinct hosts contacted during the run.
    pub fn hosts(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter_map(HarEntry::host)
            .collect()
    }
}
