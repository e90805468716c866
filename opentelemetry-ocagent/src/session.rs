use std::fmt;
use std::sync::Mutex as StdMutex;

use opentelemetry::otel_debug;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config_sync;
use crate::proto::agent::common::v1::Node;
use crate::proto::agent::metrics::v1::{ExportMetricsServiceRequest, ExportMetricsServiceResponse};
use crate::proto::agent::trace::v1::{
    CurrentLibraryConfig, ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use crate::proto::resource::v1::Resource;
use crate::sampler::AgentSampler;
use crate::transport::{AgentConnection, StreamPair, StreamReceiver, StreamSender};
use crate::Error;

/// One export stream. Sends and receives are each serialized by their own
/// lock, the transport does not allow concurrent writers or readers.
struct ExportStream<Req: Send + Sync + 'static, Resp: Send + 'static> {
    sender: Mutex<Box<dyn StreamSender<Req>>>,
    receiver: Mutex<Box<dyn StreamReceiver<Resp>>>,
}

impl<Req, Resp> ExportStream<Req, Resp>
where
    Req: Send + Sync + 'static,
    Resp: Send + 'static,
{
    fn new((sender, receiver): StreamPair<Req, Resp>) -> Self {
        ExportStream {
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
        }
    }

    /// Send a request. When the stream turns out to be closed, the pending
    /// responses are drained and the error that ended the stream is returned.
    async fn send(&self, request: &Req) -> Result<(), Error> {
        let result = self.sender.lock().await.send(request).await;
        match result {
            Err(Error::StreamClosed) => Err(self.drain().await),
            other => other,
        }
    }

    async fn drain(&self) -> Error {
        let mut receiver = self.receiver.lock().await;
        loop {
            if let Err(err) = receiver.recv().await {
                return err;
            }
        }
    }
}

/// The streams opened on one connection to the agent.
pub(crate) struct Session {
    connection: Box<dyn AgentConnection>,
    traces: ExportStream<ExportTraceServiceRequest, ExportTraceServiceResponse>,
    metrics: ExportStream<ExportMetricsServiceRequest, ExportMetricsServiceResponse>,
    config_sync: StdMutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("connection", &self.connection)
            .finish()
    }
}

impl Session {
    /// Open the trace, config and metrics streams on `connection` and send
    /// their first message. The connection is closed if any of it fails.
    pub(crate) async fn open(
        connection: Box<dyn AgentConnection>,
        node: &Node,
        resource: Option<&Resource>,
        sampler: AgentSampler,
    ) -> Result<Session, Error> {
        let handshake = Self::handshake(&*connection, node, resource, sampler).await;
        match handshake {
            Ok((traces, metrics, config_sync)) => Ok(Session {
                connection,
                traces,
                metrics,
                config_sync: StdMutex::new(Some(config_sync)),
            }),
            Err(err) => {
                connection.close().await;
                Err(err)
            }
        }
    }

    #[allow(clippy::type_complexity)]
    async fn handshake(
        connection: &dyn AgentConnection,
        node: &Node,
        resource: Option<&Resource>,
        sampler: AgentSampler,
    ) -> Result<
        (
            ExportStream<ExportTraceServiceRequest, ExportTraceServiceResponse>,
            ExportStream<ExportMetricsServiceRequest, ExportMetricsServiceResponse>,
            JoinHandle<()>,
        ),
        Error,
    > {
        let traces = ExportStream::new(connection.open_trace_stream().await?);
        traces
            .sender
            .lock()
            .await
            .send(&ExportTraceServiceRequest {
                node: Some(node.clone()),
                spans: Vec::new(),
                resource: resource.cloned(),
            })
            .await?;

        let (mut config_sender, config_receiver) = connection.open_config_stream().await?;
        config_sender
            .send(&CurrentLibraryConfig {
                node: Some(node.clone()),
                config: None,
            })
            .await?;

        let metrics = ExportStream::new(connection.open_metrics_stream().await?);
        metrics
            .sender
            .lock()
            .await
            .send(&ExportMetricsServiceRequest {
                node: Some(node.clone()),
                metrics: Vec::new(),
                resource: resource.cloned(),
            })
            .await?;

        let config_sync = tokio::spawn(config_sync::run(config_sender, config_receiver, sampler));
        otel_debug!(name: "OcAgent.Session.Opened");
        Ok((traces, metrics, config_sync))
    }

    /// Send spans on the trace stream.
    pub(crate) async fn export_traces(&self, request: &ExportTraceServiceRequest) -> Result<(), Error> {
        self.traces.send(request).await
    }

    /// Send metrics on the metrics stream.
    pub(crate) async fn export_metrics(
        &self,
        request: &ExportMetricsServiceRequest,
    ) -> Result<(), Error> {
        self.metrics.send(request).await
    }

    /// Stop serving the config stream and close the connection.
    pub(crate) async fn close(&self) {
        let config_sync = match self.config_sync.lock() {
            Ok(mut config_sync) => config_sync.take(),
            Err(_) => None,
        };
        if let Some(config_sync) = config_sync {
            config_sync.abort();
        }
        self.connection.close().await;
        otel_debug!(name: "OcAgent.Session.Closed");
    }
}
