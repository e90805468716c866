//! The connection to the agent, abstracted over the wire.
//!
//! [`grpc::GrpcTransport`] is the implementation used in production. The
//! exporter only ever talks to these traits, so any transport that can dial
//! a connection and open the three streams can stand in for it.
use std::fmt::Debug;

use async_trait::async_trait;

use crate::proto::agent::metrics::v1::{ExportMetricsServiceRequest, ExportMetricsServiceResponse};
use crate::proto::agent::trace::v1::{
    CurrentLibraryConfig, ExportTraceServiceRequest, ExportTraceServiceResponse,
    UpdatedLibraryConfig,
};
use crate::Error;

pub mod grpc;

/// The sending half of a bidirectional stream.
#[async_trait]
pub trait StreamSender<T>: Send
where
    T: Send + Sync + 'static,
{
    /// Send one message, resolving once the transport has taken it.
    ///
    /// If the stream ends before that, or has already ended, fails with the
    /// status that ended it, or [`Error::StreamClosed`] when the stream was
    /// torn down without one.
    async fn send(&mut self, message: &T) -> Result<(), Error>;
}

/// The receiving half of a bidirectional stream.
#[async_trait]
pub trait StreamReceiver<T>: Send
where
    T: Send + 'static,
{
    /// Wait for the next message. A clean end of stream is
    /// [`Error::StreamClosed`].
    async fn recv(&mut self) -> Result<T, Error>;
}

/// Both halves of an opened stream.
pub type StreamPair<Req, Resp> = (Box<dyn StreamSender<Req>>, Box<dyn StreamReceiver<Resp>>);

/// An established connection to the agent.
#[async_trait]
pub trait AgentConnection: Debug + Send + Sync {
    /// Open the trace export stream.
    async fn open_trace_stream(
        &self,
    ) -> Result<StreamPair<ExportTraceServiceRequest, ExportTraceServiceResponse>, Error>;

    /// Open the metrics export stream.
    async fn open_metrics_stream(
        &self,
    ) -> Result<StreamPair<ExportMetricsServiceRequest, ExportMetricsServiceResponse>, Error>;

    /// Open the trace config stream.
    async fn open_config_stream(
        &self,
    ) -> Result<StreamPair<CurrentLibraryConfig, UpdatedLibraryConfig>, Error>;

    /// Tear down the connection and every stream opened on it.
    async fn close(&self);
}

/// Establishes connections to the agent.
#[async_trait]
pub trait AgentTransport: Debug + Send + Sync {
    /// Dial the agent.
    async fn dial(&self) -> Result<Box<dyn AgentConnection>, Error>;
}
