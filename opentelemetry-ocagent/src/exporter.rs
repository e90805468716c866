use std::fmt;
use std::sync::Arc;

use futures_util::FutureExt;
use opentelemetry::{otel_debug, otel_warn};
use opentelemetry_sdk::trace::{Sampler, SpanData};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::bundler::{Bundler, FlushHandler};
use crate::config::{ExporterBuilder, ExporterConfig};
use crate::connection::{run_reconnection_loop, ConnectionManager, ConnectionState};
use crate::proto::agent::common::v1::Node;
use crate::proto::agent::metrics::v1::ExportMetricsServiceRequest;
use crate::proto::agent::trace::v1::ExportTraceServiceRequest;
use crate::proto::resource::v1::Resource;
use crate::retry;
use crate::sampler::AgentSampler;
use crate::transform::{spans_to_proto, view_data_batch_to_metrics};
use crate::transport::AgentTransport;
use crate::view::ViewData;
use crate::Error;

/// Held across `start` and `stop`, so the two never interleave.
enum Lifecycle {
    Unstarted(mpsc::Receiver<()>),
    Started(JoinHandle<()>),
    Stopped,
}

/// Exports spans and stats views to the OpenCensus agent.
///
/// Spans and view snapshots are buffered and sent in batches over long lived
/// gRPC streams. The exporter keeps the connection alive in the background:
/// whenever a stream fails it redials the agent every reconnection period
/// until it succeeds. Export calls never wait on the network, and failures
/// are only logged and reflected in [`OcAgentExporter::connection_state`].
///
/// ```no_run
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// use opentelemetry_ocagent::OcAgentExporter;
///
/// let exporter = OcAgentExporter::builder()
///     .with_service_name("checkout")
///     .build()?;
/// exporter.start().await?;
///
/// // hand finished spans and view snapshots over
/// // exporter.export_span(span);
/// // exporter.export_view_data(view_data);
///
/// exporter.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct OcAgentExporter {
    connection: Arc<ConnectionManager>,
    spans: Bundler<SpanData>,
    views: Bundler<ViewData>,
    sampler: AgentSampler,
    config: ExporterConfig,
    lifecycle: Mutex<Lifecycle>,
}

impl fmt::Debug for OcAgentExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OcAgentExporter")
            .field("connection", &self.connection)
            .field("config", &self.config)
            .finish()
    }
}

impl OcAgentExporter {
    /// Start configuring an exporter.
    pub fn builder() -> ExporterBuilder {
        ExporterBuilder::default()
    }

    pub(crate) fn new(
        config: ExporterConfig,
        transport: Arc<dyn AgentTransport>,
        node: Node,
        resource: Option<Resource>,
        sampler: Sampler,
    ) -> Self {
        let sampler = AgentSampler::new(sampler);
        let (connection, disconnected) =
            ConnectionManager::new(transport, node, resource, sampler.clone());
        let connection = Arc::new(connection);

        let span_handler: FlushHandler<SpanData> = {
            let connection = connection.clone();
            Arc::new(move |batch: Vec<SpanData>| {
                let connection = connection.clone();
                async move { upload_traces(&connection, batch).await }.boxed()
            })
        };
        let view_handler: FlushHandler<ViewData> = {
            let connection = connection.clone();
            Arc::new(move |batch: Vec<ViewData>| {
                let connection = connection.clone();
                async move { upload_view_data(&connection, batch).await }.boxed()
            })
        };

        OcAgentExporter {
            spans: Bundler::new("spans", config.span_batch, span_handler),
            views: Bundler::new("views", config.view_batch, view_handler),
            connection,
            sampler,
            config,
            lifecycle: Mutex::new(Lifecycle::Unstarted(disconnected)),
        }
    }

    /// Connect to the agent and start the background work.
    ///
    /// A failed first connection is not an error: it is recorded and retried
    /// by the reconnection loop. Calling `start` again returns
    /// [`Error::AlreadyStarted`]. A `start` dropped before it completes
    /// leaves the exporter unstarted.
    pub async fn start(&self) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !matches!(*lifecycle, Lifecycle::Unstarted(_)) {
            return Err(Error::AlreadyStarted);
        }

        // failures are recorded and signalled to the loop
        let _ = self.connection.connect().await;

        let disconnected = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Unstarted(disconnected) => disconnected,
            other => {
                *lifecycle = other;
                return Err(Error::AlreadyStarted);
            }
        };
        *lifecycle = Lifecycle::Started(tokio::spawn(run_reconnection_loop(
            self.connection.clone(),
            self.config.reconnection_period,
            disconnected,
        )));

        self.spans.start();
        self.views.start();
        otel_debug!(name: "OcAgent.Started");
        Ok(())
    }

    /// Deliver what is buffered, close the connection and wait for the
    /// background work to end.
    ///
    /// Returns [`Error::NotStarted`] if the exporter was never started;
    /// stopping again succeeds without doing anything. A `start` still in
    /// progress is waited for.
    pub async fn stop(&self) -> Result<(), Error> {
        let mut lifecycle = self.lifecycle.lock().await;
        let reconnection_loop = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Started(reconnection_loop) => reconnection_loop,
            Lifecycle::Stopped => return Ok(()),
            unstarted @ Lifecycle::Unstarted(_) => {
                *lifecycle = unstarted;
                return Err(Error::NotStarted);
            }
        };

        self.spans.shutdown().await;
        self.views.shutdown().await;
        self.connection.shutdown().await;
        if let Err(err) = reconnection_loop.await {
            otel_warn!(name: "OcAgent.ReconnectionLoopFailed", reason = format!("{}", err));
        }
        otel_debug!(name: "OcAgent.Stopped");
        Ok(())
    }

    /// Queue a finished span. Never blocks.
    pub fn export_span(&self, span: SpanData) {
        self.spans.add(span);
    }

    /// Queue a view snapshot. Never blocks.
    pub fn export_view_data(&self, view_data: ViewData) {
        self.views.add(view_data);
    }

    /// Send everything buffered now.
    pub async fn flush(&self) {
        futures_util::join!(self.spans.flush(), self.views.flush());
    }

    /// Send spans synchronously, bypassing the buffer.
    ///
    /// Empty requests are ignored. A request the agent rejects as too large
    /// is split in two after a reconnect and each half is sent the same way,
    /// so an error may follow a partial delivery. A stream the agent closed
    /// cleanly is not an error: the reconnection loop takes over.
    pub async fn export_trace_service_request(
        &self,
        request: ExportTraceServiceRequest,
    ) -> Result<(), Error> {
        retry::export_traces(&self.connection, request).await
    }

    /// Whether streams to the agent are currently open.
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// The error of the last failed or lost connection, cleared on reconnect.
    pub fn last_connect_error(&self) -> Option<Error> {
        self.connection.last_error()
    }

    /// The current connection state.
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// The sampler the agent configures through the config stream.
    pub fn sampler(&self) -> AgentSampler {
        self.sampler.clone()
    }
}

async fn upload_traces(connection: &ConnectionManager, batch: Vec<SpanData>) {
    let spans = spans_to_proto(batch);
    if spans.is_empty() {
        return;
    }
    let count = spans.len();
    let request = ExportTraceServiceRequest {
        node: None,
        spans,
        resource: None,
    };
    if let Err(err) = retry::export_traces(connection, request).await {
        otel_debug!(name: "OcAgent.SpansDropped", count = count, reason = format!("{}", err));
    }
}

async fn upload_view_data(connection: &ConnectionManager, batch: Vec<ViewData>) {
    if connection.is_stopped() {
        return;
    }
    let session = match connection.active_session() {
        Ok(session) => session,
        Err(err) => {
            otel_debug!(name: "OcAgent.ViewDataDropped", count = batch.len(), reason = format!("{}", err));
            return;
        }
    };

    let metrics = view_data_batch_to_metrics(&batch);
    if metrics.is_empty() {
        return;
    }
    let request = ExportMetricsServiceRequest {
        node: None,
        metrics,
        resource: None,
    };
    if let Err(err) = session.export_metrics(&request).await {
        otel_debug!(name: "OcAgent.MetricsExportFailed", reason = format!("{}", err));
        connection.report_failure(&session, err);
    }
}
