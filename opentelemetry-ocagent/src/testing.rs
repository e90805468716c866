//! An in-process agent for tests.
//!
//! [`InMemoryAgent`] implements [`AgentTransport`] and records everything the
//! exporter sends, so the exporter can be driven end to end without a network.
//! It can also misbehave on demand: refuse or stall dials, end the trace
//! stream, or reject trace requests above a size the way the real agent does.
//!
//! ```no_run
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! use opentelemetry_ocagent::testing::InMemoryAgent;
//! use opentelemetry_ocagent::OcAgentExporter;
//!
//! let agent = InMemoryAgent::default();
//! let exporter = OcAgentExporter::builder()
//!     .with_transport(agent.clone())
//!     .build()?;
//! exporter.start().await?;
//! assert_eq!(agent.dial_count(), 1);
//! # Ok(())
//! # }
//! ```
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use prost::Message;
use tokio::sync::{mpsc, watch};

use crate::proto::agent::metrics::v1::{ExportMetricsServiceRequest, ExportMetricsServiceResponse};
use crate::proto::agent::trace::v1::{
    CurrentLibraryConfig, ExportTraceServiceRequest, ExportTraceServiceResponse,
    UpdatedLibraryConfig,
};
use crate::proto::trace::v1::{Span, TraceConfig};
use crate::transport::{
    AgentConnection, AgentTransport, StreamPair, StreamReceiver, StreamSender,
};
use crate::Error;

/// The end of one stream, observed by both of its halves.
#[derive(Debug)]
struct StreamControl {
    end: watch::Sender<Option<Error>>,
}

impl StreamControl {
    fn new() -> Arc<Self> {
        let (end, _) = watch::channel(None);
        Arc::new(StreamControl { end })
    }

    /// End the stream with `error`. The first end wins.
    fn end(&self, error: Error) {
        self.end.send_if_modified(|end| {
            if end.is_some() {
                return false;
            }
            *end = Some(error);
            true
        });
    }

    /// The error that ended the stream, if it has ended.
    fn ended(&self) -> Option<Error> {
        self.end.borrow().clone()
    }

    async fn wait(mut end: watch::Receiver<Option<Error>>) -> Error {
        let error = match end.wait_for(Option::is_some).await {
            Ok(error) => error.clone(),
            Err(_) => None,
        };
        error.unwrap_or(Error::StreamClosed)
    }
}

#[derive(Debug, Default)]
struct AgentState {
    dials: AtomicUsize,
    closes: AtomicUsize,
    dial_failure: Mutex<Option<Error>>,
    dial_delay: Mutex<Option<Duration>>,
    max_request_size: Mutex<Option<usize>>,
    trace_requests: Mutex<Vec<ExportTraceServiceRequest>>,
    metrics_requests: Mutex<Vec<ExportMetricsServiceRequest>>,
    config_messages: Mutex<Vec<CurrentLibraryConfig>>,
    trace_stream: Mutex<Option<Arc<StreamControl>>>,
    config_pushes: Mutex<Option<mpsc::UnboundedSender<UpdatedLibraryConfig>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A fake agent recording what the exporter sends.
///
/// Clones share their state: keep one clone in the test and hand another to
/// [`crate::ExporterBuilder::with_transport`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryAgent {
    state: Arc<AgentState>,
}

impl InMemoryAgent {
    /// Number of dial attempts, failed ones included.
    pub fn dial_count(&self) -> usize {
        self.state.dials.load(Ordering::SeqCst)
    }

    /// Number of connections the exporter closed.
    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Make every following dial fail with `error`, or succeed again with
    /// `None`.
    pub fn set_dial_failure(&self, error: Option<Error>) {
        *lock(&self.state.dial_failure) = error;
    }

    /// Make every following dial take `delay` before it completes.
    pub fn set_dial_delay(&self, delay: Duration) {
        *lock(&self.state.dial_delay) = Some(delay);
    }

    /// End the current trace stream as if the agent closed it cleanly.
    pub fn close_trace_stream(&self) {
        if let Some(stream) = lock(&self.state.trace_stream).as_ref() {
            stream.end(Error::StreamClosed);
        }
    }

    /// Reject trace requests whose encoded size exceeds `max_bytes`.
    ///
    /// As with a gRPC server, the oversized message is first taken off the
    /// stream and the stream is then ended with a `RESOURCE_EXHAUSTED`
    /// status, which the pending send reports.
    pub fn reject_requests_larger_than(&self, max_bytes: usize) {
        *lock(&self.state.max_request_size) = Some(max_bytes);
    }

    /// Push a trace config on the current config stream. Returns false when
    /// no config stream is open.
    pub fn push_config(&self, config: TraceConfig) -> bool {
        match lock(&self.state.config_pushes).as_ref() {
            Some(pushes) => pushes
                .send(UpdatedLibraryConfig {
                    node: None,
                    config: Some(config),
                })
                .is_ok(),
            None => false,
        }
    }

    /// Every accepted trace request, handshakes included.
    pub fn trace_requests(&self) -> Vec<ExportTraceServiceRequest> {
        lock(&self.state.trace_requests).clone()
    }

    /// The spans of every accepted trace request, in arrival order.
    pub fn exported_spans(&self) -> Vec<Span> {
        lock(&self.state.trace_requests)
            .iter()
            .flat_map(|request| request.spans.iter().cloned())
            .collect()
    }

    /// Every metrics request, handshakes included.
    pub fn metrics_requests(&self) -> Vec<ExportMetricsServiceRequest> {
        lock(&self.state.metrics_requests).clone()
    }

    /// Every message sent on the config streams, handshakes included.
    pub fn config_messages(&self) -> Vec<CurrentLibraryConfig> {
        lock(&self.state.config_messages).clone()
    }

    /// The configs the exporter reported as applied.
    pub fn config_acks(&self) -> Vec<TraceConfig> {
        lock(&self.state.config_messages)
            .iter()
            .filter_map(|message| message.config.clone())
            .collect()
    }
}

#[async_trait]
impl AgentTransport for InMemoryAgent {
    async fn dial(&self) -> Result<Box<dyn AgentConnection>, Error> {
        self.state.dials.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.state.dial_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = lock(&self.state.dial_failure).clone() {
            return Err(error);
        }
        Ok(Box::new(InMemoryConnection {
            state: self.state.clone(),
            streams: Mutex::new(Vec::new()),
        }))
    }
}

#[derive(Debug)]
struct InMemoryConnection {
    state: Arc<AgentState>,
    streams: Mutex<Vec<Arc<StreamControl>>>,
}

impl InMemoryConnection {
    fn new_stream(&self) -> Arc<StreamControl> {
        let control = StreamControl::new();
        lock(&self.streams).push(control.clone());
        control
    }
}

#[async_trait]
impl AgentConnection for InMemoryConnection {
    async fn open_trace_stream(
        &self,
    ) -> Result<StreamPair<ExportTraceServiceRequest, ExportTraceServiceResponse>, Error> {
        let control = self.new_stream();
        *lock(&self.state.trace_stream) = Some(control.clone());
        Ok((
            Box::new(TraceSender {
                state: self.state.clone(),
                control: control.clone(),
            }),
            Box::new(Silent {
                end: control.end.subscribe(),
            }),
        ))
    }

    async fn open_metrics_stream(
        &self,
    ) -> Result<StreamPair<ExportMetricsServiceRequest, ExportMetricsServiceResponse>, Error> {
        let control = self.new_stream();
        Ok((
            Box::new(MetricsSender {
                state: self.state.clone(),
                control: control.clone(),
            }),
            Box::new(Silent {
                end: control.end.subscribe(),
            }),
        ))
    }

    async fn open_config_stream(
        &self,
    ) -> Result<StreamPair<CurrentLibraryConfig, UpdatedLibraryConfig>, Error> {
        let control = self.new_stream();
        let (pushes, pushed) = mpsc::unbounded_channel();
        *lock(&self.state.config_pushes) = Some(pushes);
        Ok((
            Box::new(ConfigSender {
                state: self.state.clone(),
                control: control.clone(),
            }),
            Box::new(ConfigReceiver {
                pushed,
                end: control.end.subscribe(),
            }),
        ))
    }

    async fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        for stream in lock(&self.streams).drain(..) {
            stream.end(Error::StreamClosed);
        }
    }
}

struct TraceSender {
    state: Arc<AgentState>,
    control: Arc<StreamControl>,
}

#[async_trait]
impl StreamSender<ExportTraceServiceRequest> for TraceSender {
    async fn send(&mut self, request: &ExportTraceServiceRequest) -> Result<(), Error> {
        if let Some(error) = self.control.ended() {
            return Err(error);
        }
        let limit = *lock(&self.state.max_request_size);
        if let Some(limit) = limit {
            let size = request.encoded_len();
            if size > limit {
                let end = self.control.end.subscribe();
                let control = self.control.clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    control.end(Error::Rpc {
                        code: tonic::Code::ResourceExhausted,
                        message: format!(
                            "received message larger than max ({} vs. {})",
                            size, limit
                        ),
                    });
                });
                return Err(StreamControl::wait(end).await);
            }
        }
        lock(&self.state.trace_requests).push(request.clone());
        Ok(())
    }
}

struct MetricsSender {
    state: Arc<AgentState>,
    control: Arc<StreamControl>,
}

#[async_trait]
impl StreamSender<ExportMetricsServiceRequest> for MetricsSender {
    async fn send(&mut self, request: &ExportMetricsServiceRequest) -> Result<(), Error> {
        if let Some(error) = self.control.ended() {
            return Err(error);
        }
        lock(&self.state.metrics_requests).push(request.clone());
        Ok(())
    }
}

struct ConfigSender {
    state: Arc<AgentState>,
    control: Arc<StreamControl>,
}

#[async_trait]
impl StreamSender<CurrentLibraryConfig> for ConfigSender {
    async fn send(&mut self, message: &CurrentLibraryConfig) -> Result<(), Error> {
        if let Some(error) = self.control.ended() {
            return Err(error);
        }
        lock(&self.state.config_messages).push(message.clone());
        Ok(())
    }
}

/// Receiving half of an export stream: the agent never responds, the stream
/// only ends.
struct Silent {
    end: watch::Receiver<Option<Error>>,
}

#[async_trait]
impl<T: Send + 'static> StreamReceiver<T> for Silent {
    async fn recv(&mut self) -> Result<T, Error> {
        Err(StreamControl::wait(self.end.clone()).await)
    }
}

struct ConfigReceiver {
    pushed: mpsc::UnboundedReceiver<UpdatedLibraryConfig>,
    end: watch::Receiver<Option<Error>>,
}

#[async_trait]
impl StreamReceiver<UpdatedLibraryConfig> for ConfigReceiver {
    async fn recv(&mut self) -> Result<UpdatedLibraryConfig, Error> {
        tokio::select! {
            biased;
            error = StreamControl::wait(self.end.clone()) => Err(error),
            pushed = self.pushed.recv() => pushed.ok_or(Error::StreamClosed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_oversized_request_ends_stream_with_status() {
        let agent = InMemoryAgent::default();
        agent.reject_requests_larger_than(16);
        let connection = agent.dial().await.unwrap();
        let (mut sender, mut receiver) = connection.open_trace_stream().await.unwrap();

        sender
            .send(&ExportTraceServiceRequest::default())
            .await
            .unwrap();
        let big = ExportTraceServiceRequest {
            spans: vec![Span::default(); 32],
            ..Default::default()
        };
        assert!(sender.send(&big).await.unwrap_err().is_resource_exhausted());
        assert!(receiver.recv().await.unwrap_err().is_resource_exhausted());
        // the stream stays ended with the same status
        let small = ExportTraceServiceRequest::default();
        assert!(sender.send(&small).await.unwrap_err().is_resource_exhausted());
        assert_eq!(agent.trace_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_close_ends_every_stream() {
        let agent = InMemoryAgent::default();
        let connection = agent.dial().await.unwrap();
        let (mut metrics, _) = connection.open_metrics_stream().await.unwrap();
        let (_, mut config) = connection.open_config_stream().await.unwrap();

        connection.close().await;

        assert_eq!(agent.close_count(), 1);
        assert_eq!(
            metrics.send(&ExportMetricsServiceRequest::default()).await,
            Err(Error::StreamClosed)
        );
        assert_eq!(config.recv().await, Err(Error::StreamClosed));
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let agent = InMemoryAgent::default();
        agent.set_dial_failure(Some(Error::Transport("connection refused".into())));
        assert!(agent.dial().await.is_err());
        agent.set_dial_failure(None);
        assert!(agent.dial().await.is_ok());
        assert_eq!(agent.dial_count(), 2);
    }

    #[tokio::test]
    async fn test_dial_delay() {
        let agent = InMemoryAgent::default();
        agent.set_dial_delay(Duration::from_millis(200));
        let dial = agent.dial();
        assert!(tokio::time::timeout(Duration::from_millis(20), dial)
            .await
            .is_err());
        // the attempt counts as soon as it starts
        assert_eq!(agent.dial_count(), 1);
    }
}
