//! # OpenTelemetry OpenCensus Agent Exporter
//!
//! Streams finished spans and aggregated stats views to an [OpenCensus
//! agent] (or an OpenTelemetry collector with the `opencensus` receiver)
//! over gRPC.
//!
//! The exporter opens three long lived streams on one connection: trace
//! export, metrics export, and trace config. Over the config stream the agent
//! can change the sampling policy of the process at runtime; the change is
//! applied to the [`AgentSampler`] returned by [`OcAgentExporter::sampler`],
//! which can be installed on a tracer provider.
//!
//! [OpenCensus agent]: https://github.com/census-instrumentation/opencensus-service
//!
//! ## Quickstart
//!
//! ```no_run
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let exporter = opentelemetry_ocagent::OcAgentExporter::builder()
//!     .with_endpoint("http://localhost:55678")
//!     .with_service_name("checkout")
//!     .with_reconnection_period(Duration::from_secs(5))
//!     .build()?;
//!
//! exporter.start().await?;
//!
//! let provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
//!     .with_sampler(exporter.sampler())
//!     .build();
//!
//! // ... record spans, hand finished ones to `exporter.export_span`
//!
//! exporter.stop().await?;
//! # drop(provider);
//! # Ok(())
//! # }
//! ```
//!
//! ## Connection handling
//!
//! Export calls never wait on the agent. Spans and view snapshots are
//! buffered and uploaded in batches; when the agent is unreachable the
//! batches are dropped, the failure is logged, and a background task redials
//! the agent once per reconnection period until a connection succeeds.
//! [`OcAgentExporter::connection_state`] reports where things stand.
//!
//! ## Environment
//!
//! | Variable | Meaning |
//! |---|---|
//! | `OC_AGENT_ENDPOINT` | Agent address, `http://localhost:55678` by default |
//! | `OC_AGENT_RECONNECTION_PERIOD` | Seconds between reconnection attempts |
//! | `OC_AGENT_HEADERS` | gRPC metadata sent on every stream, `k1=v1,k2=v2` |
//! | `OC_RESOURCE_TYPE` | Type of the resource describing the process |
//! | `OC_RESOURCE_LABELS` | Resource labels, `k1=v1,k2="v 2"` |
//!
//! Values set on the [`ExporterBuilder`] take precedence.
//!
//! ## Feature flags
//!
//! * `internal-logs` (enabled by default): emit internal diagnostics through
//!   the `opentelemetry` logging macros.
//! * `gzip-tonic`, `zstd-tonic`: request compression.
//! * `testing`: the [`testing::InMemoryAgent`] fake agent.
#![warn(missing_debug_implementations, missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod bundler;
mod config;
mod config_sync;
mod connection;
mod error;
mod exporter;
mod node;
pub mod proto;
mod retry;
mod sampler;
mod session;
#[cfg(any(test, feature = "testing"))]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;
pub mod transform;
pub mod transport;
pub mod view;

pub use crate::config::{
    BatchConfig, Compression, ExporterBuilder, DEFAULT_BATCH_DELAY, DEFAULT_SPAN_BATCH_SIZE,
    DEFAULT_VIEW_BATCH_SIZE, OC_AGENT_ENDPOINT, OC_AGENT_ENDPOINT_DEFAULT, OC_AGENT_HEADERS,
    OC_AGENT_RECONNECTION_PERIOD, OC_AGENT_RECONNECTION_PERIOD_DEFAULT,
};
pub use crate::connection::ConnectionState;
pub use crate::error::{Error, ExporterBuildError};
pub use crate::exporter::OcAgentExporter;
pub use crate::node::{HOSTNAME, OC_RESOURCE_LABELS, OC_RESOURCE_TYPE};
pub use crate::sampler::AgentSampler;
pub use crate::transport::grpc::GrpcTransport;
pub use crate::view::{
    Aggregation, AggregationData, DistributionData, Exemplar, Measure, Row, Tag, ValueKind, View,
    ViewData,
};
