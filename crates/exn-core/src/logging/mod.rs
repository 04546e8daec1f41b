//! Structured logging for exynex.
//!
//! stdout carries the run outcome; every log line goes to stderr, either as
//! console text or as JSON lines. Stage events are also kept in the run
//! outcome (see [`events`]), and [`log_event!`](crate::log_event) stamps each
//! line with the run id, host id and device so a JSONL stream from several
//! runs can be split apart again.
//!
//! The sudo password never reaches a log line: host commands are logged by
//! their argv, and the password travels on stdin.

pub mod config;
pub mod events;

pub use config::{LogConfig, LogFormat, LogLevel};
pub use events::{event_names, Level, LogContext, LogEvent, Stage};

use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// A second call keeps the first subscriber.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_new(config.filter_directives())
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match (config.format, config.timestamps) {
        (LogFormat::Jsonl, _) => registry
            .with(
                fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(false)
                    .with_span_list(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        (LogFormat::Human, with_time) => {
            let layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_ansi(std::io::stderr().is_terminal());
            if with_time {
                registry.with(layer).try_init()
            } else {
                registry.with(layer.without_time()).try_init()
            }
        }
    };
    if installed.is_err() {
        tracing::debug!("logging already initialized");
    }
}

/// Short stable identifier of this machine for log correlation.
///
/// `/etc/machine-id` when readable, a hash of the hostname otherwise, and a
/// random id as the last resort.
pub fn get_host_id() -> String {
    let machine_id = std::fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| id.len() >= 8 && id.is_ascii());
    if let Some(id) = machine_id {
        return format!("host-{}", &id[..8]);
    }

    let hostname = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty());
    match hostname {
        Some(name) => format!("host-{:08x}", fnv1a(name.as_bytes()) as u32),
        None => format!("host-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]),
    }
}

/// FNV-1a; stable across Rust releases, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, b| {
        (hash ^ u64::from(*b)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Trim command output to at most `max_len` bytes for a log line.
pub fn truncate_for_log(s: &str, max_len: usize) -> String {
    let s = s.trim();
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...(truncated)", &s[..end])
}

/// Emit a tracing event carrying the run's correlation fields.
///
/// ```ignore
/// log_event!(ctx, INFO, event_names::DEVICE_VERIFIED, Stage::Device, "device online");
/// log_event!(ctx, DEBUG, event_names::UID_RESOLVED, Stage::Install, "uid resolved",
///     uid = uid.as_str());
/// ```
///
/// The level is one of the `tracing::Level` constant names.
#[macro_export]
macro_rules! log_event {
    ($ctx:expr, $level:ident, $event:expr, $stage:expr, $msg:expr $(, $key:ident = $val:expr)* $(,)?) => {
        tracing::event!(
            tracing::Level::$level,
            event = $event,
            run_id = %$ctx.run_id,
            host_id = %$ctx.host_id,
            device = ?$ctx.device,
            stage = %$stage,
            $($key = $val,)*
            "{}", $msg
        )
    };
}
