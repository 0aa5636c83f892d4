//! Telemetry initialization shared by binaries and tests.

pub mod tracing;
