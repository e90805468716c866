//! Mapping of in-process telemetry onto the OpenCensus wire messages.
pub mod metrics;
pub mod traces;

pub use metrics::{view_data_batch_to_metrics, view_data_to_metric, view_to_metric_descriptor};
pub use traces::spans_to_proto;
