//! Operations and observability.
//!
//! - `telemetry` - Tracing setup

pub mod telemetry;
