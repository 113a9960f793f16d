//! Observability for sigbot: tracing subscriber setup and export of runtime
//! metrics snapshots to OpenTelemetry.

pub mod metric_names;
pub mod metrics_export;
pub mod tracing_setup;
