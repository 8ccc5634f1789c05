//! Observability module
//!
//! Structured logging setup and helpers for keeping remote output safe to log.

pub mod telemetry;
