//! Observability setup for flowline: tracing subscriber and optional
//! OpenTelemetry export.

pub mod tracing_setup;

pub use tracing_setup::{TracingOptions, default_directive, init_tracing, shutdown_tracing};
