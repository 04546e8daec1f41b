//! exynex common types, IDs, and errors.
//!
//! This crate provides foundational types shared with exn-core:
//! - Run and device identity types
//! - The error taxonomy with stable codes
//! - Output format selection

pub mod error;
pub mod id;
pub mod output;

pub use error::{Error, ErrorCategory, Result, StructuredError, SuggestedAction};
pub use id::{AppUid, DevicePid, RunId};
pub use output::OutputFormat;
