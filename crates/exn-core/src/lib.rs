//! exynex core library
//!
//! Drives one dynamic-analysis run of an Android app:
//! - Device control over adb (install, launch, stop, uninstall)
//! - Per-app network isolation on the device and NAT redirect on the host
//! - The transparent interception proxy and its HAR capture
//! - The timed observation window and reverse-order teardown
//!
//! The binary entry point is in `main.rs`.

pub mod apk;
pub mod cancel;
pub mod config;
pub mod device;
pub mod exec;
pub mod exit_codes;
pub mod logging;
pub mod network;
pub mod observe;
pub mod pipeline;
pub mod proxy;

// Re-export test utilities for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
