//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for schema/version strings
//! that appear in machine-readable I/O.

pub const MPLTEST_REPORT_SCHEMA_VERSION: &str = "mpltest.report@0.1.0";
pub const MPLTEST_CONFIG_SCHEMA_VERSION: &str = "mpltest.config@0.1.0";
