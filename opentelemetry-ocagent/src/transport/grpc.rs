use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};

use async_trait::async_trait;
use opentelemetry::otel_debug;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tonic::codec::{CompressionEncoding, Streaming};
use tonic::metadata::MetadataMap;
use tonic::transport::{Channel, Endpoint};

use super::{AgentConnection, AgentTransport, StreamPair, StreamReceiver, StreamSender};
use crate::proto::agent::metrics::v1::metrics_service_client::MetricsServiceClient;
use crate::proto::agent::metrics::v1::{ExportMetricsServiceRequest, ExportMetricsServiceResponse};
use crate::proto::agent::trace::v1::trace_service_client::TraceServiceClient;
use crate::proto::agent::trace::v1::{
    CurrentLibraryConfig, ExportTraceServiceRequest, ExportTraceServiceResponse,
    UpdatedLibraryConfig,
};
use crate::{Error, ExporterBuildError};

/// Responses queued before the reader task waits.
const RESPONSE_BUFFER: usize = 64;

#[derive(Debug, Clone)]
enum Target {
    Endpoint(Endpoint),
    Channel(Channel),
}

/// Transport talking gRPC to the agent with tonic.
#[derive(Debug, Clone)]
pub struct GrpcTransport {
    target: Target,
    metadata: MetadataMap,
    compression: Option<CompressionEncoding>,
}

impl GrpcTransport {
    /// Create a transport dialing `endpoint` on every connect.
    pub fn new(
        endpoint: &str,
        metadata: MetadataMap,
        compression: Option<CompressionEncoding>,
    ) -> Result<Self, ExporterBuildError> {
        let endpoint = Channel::from_shared(endpoint.to_string()).map_err(|err| {
            ExporterBuildError::InvalidUri(endpoint.to_string(), err.to_string())
        })?;
        Ok(GrpcTransport {
            target: Target::Endpoint(endpoint),
            metadata,
            compression,
        })
    }

    /// Create a transport reusing an existing channel.
    pub fn from_channel(
        channel: Channel,
        metadata: MetadataMap,
        compression: Option<CompressionEncoding>,
    ) -> Self {
        GrpcTransport {
            target: Target::Channel(channel),
            metadata,
            compression,
        }
    }
}

#[async_trait]
impl AgentTransport for GrpcTransport {
    async fn dial(&self) -> Result<Box<dyn AgentConnection>, Error> {
        let channel = match &self.target {
            Target::Endpoint(endpoint) => {
                otel_debug!(name: "OcAgent.Dialing", endpoint = format!("{}", endpoint.uri()));
                endpoint.connect().await?
            }
            Target::Channel(channel) => channel.clone(),
        };

        Ok(Box::new(GrpcConnection {
            channel,
            metadata: self.metadata.clone(),
            compression: self.compression,
            readers: Mutex::new(Vec::new()),
        }))
    }
}

/// One dialed channel and the reader tasks of the streams opened on it.
#[derive(Debug)]
struct GrpcConnection {
    channel: Channel,
    metadata: MetadataMap,
    compression: Option<CompressionEncoding>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl GrpcConnection {
    fn trace_client(&self) -> TraceServiceClient<Channel> {
        let client = TraceServiceClient::new(self.channel.clone());
        match self.compression {
            Some(compression) => client
                .send_compressed(compression)
                .accept_compressed(compression),
            None => client,
        }
    }

    fn metrics_client(&self) -> MetricsServiceClient<Channel> {
        let client = MetricsServiceClient::new(self.channel.clone());
        match self.compression {
            Some(compression) => client
                .send_compressed(compression)
                .accept_compressed(compression),
            None => client,
        }
    }

    fn request<T>(&self, stream: RequestStream<T>) -> tonic::Request<RequestStream<T>> {
        let mut request = tonic::Request::new(stream);
        *request.metadata_mut() = self.metadata.clone();
        request
    }

    fn track(&self, reader: JoinHandle<()>) {
        if let Ok(mut readers) = self.readers.lock() {
            readers.retain(|reader| !reader.is_finished());
            readers.push(reader);
        }
    }
}

/// Open a stream without waiting for the agent's response headers: the call
/// runs in its own task and its responses are forwarded through a queue.
/// The task records the status that ended the call for the sending half.
macro_rules! open_stream {
    ($conn:expr, $client:expr, $method:ident, $req:ty, $resp:ty) => {{
        let (terminal_tx, terminal) = watch::channel(None);
        let (sender, request_stream) = request_stream::<$req>(terminal);
        let (response_tx, response_rx) = mpsc::channel::<Result<$resp, Error>>(RESPONSE_BUFFER);
        let mut client = $client;
        let request = $conn.request(request_stream);

        $conn.track(tokio::spawn(async move {
            match client.$method(request).await {
                Ok(response) => {
                    forward_responses(response.into_inner(), response_tx, terminal_tx).await
                }
                Err(status) => {
                    let err = Error::from(status);
                    terminal_tx.send_replace(Some(err.clone()));
                    let _ = response_tx.send(Err(err)).await;
                }
            }
        }));

        let pair: StreamPair<$req, $resp> = (
            Box::new(sender),
            Box::new(QueueReceiver { rx: response_rx }),
        );
        Ok(pair)
    }};
}

#[async_trait]
impl AgentConnection for GrpcConnection {
    async fn open_trace_stream(
        &self,
    ) -> Result<StreamPair<ExportTraceServiceRequest, ExportTraceServiceResponse>, Error> {
        open_stream!(
            self,
            self.trace_client(),
            export,
            ExportTraceServiceRequest,
            ExportTraceServiceResponse
        )
    }

    async fn open_metrics_stream(
        &self,
    ) -> Result<StreamPair<ExportMetricsServiceRequest, ExportMetricsServiceResponse>, Error> {
        open_stream!(
            self,
            self.metrics_client(),
            export,
            ExportMetricsServiceRequest,
            ExportMetricsServiceResponse
        )
    }

    async fn open_config_stream(
        &self,
    ) -> Result<StreamPair<CurrentLibraryConfig, UpdatedLibraryConfig>, Error> {
        open_stream!(
            self,
            self.trace_client(),
            config,
            CurrentLibraryConfig,
            UpdatedLibraryConfig
        )
    }

    async fn close(&self) {
        // Aborting the calls drops their request streams, which resets the
        // http2 streams; the channel itself closes with its last clone.
        if let Ok(mut readers) = self.readers.lock() {
            for reader in readers.drain(..) {
                reader.abort();
            }
        }
    }
}

async fn forward_responses<T>(
    mut stream: Streaming<T>,
    tx: mpsc::Sender<Result<T, Error>>,
    terminal: watch::Sender<Option<Error>>,
) where
    T: Send + 'static,
{
    let err = loop {
        match stream.message().await {
            // nobody listening is fine, keep reading until the call ends
            Ok(Some(message)) => {
                let _ = tx.send(Ok(message)).await;
            }
            Ok(None) => break Error::StreamClosed,
            Err(status) => break Error::from(status),
        }
    };
    terminal.send_replace(Some(err.clone()));
    let _ = tx.send(Err(err)).await;
}

/// A message waiting to be taken by the call, with the signal to raise once
/// the transport asked for the next one.
struct Handoff<T> {
    message: T,
    taken: oneshot::Sender<()>,
}

fn request_stream<T>(
    terminal: watch::Receiver<Option<Error>>,
) -> (QueueSender<T>, RequestStream<T>) {
    let (tx, rx) = mpsc::channel(1);
    (
        QueueSender { tx, terminal },
        RequestStream {
            queue: rx,
            in_flight: None,
        },
    )
}

/// The request body of a call.
///
/// The transport only polls for the next message once the previous one has
/// been written out, so that poll is what acknowledges the previous send.
struct RequestStream<T> {
    queue: mpsc::Receiver<Handoff<T>>,
    in_flight: Option<oneshot::Sender<()>>,
}

impl<T> Stream for RequestStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        if let Some(taken) = this.in_flight.take() {
            let _ = taken.send(());
        }
        match this.queue.poll_recv(cx) {
            Poll::Ready(Some(Handoff { message, taken })) => {
                this.in_flight = Some(taken);
                Poll::Ready(Some(message))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Sending half of a call. `send` resolves once the transport has taken the
/// message; if the call ends first, it fails with the status that ended it.
struct QueueSender<T> {
    tx: mpsc::Sender<Handoff<T>>,
    terminal: watch::Receiver<Option<Error>>,
}

impl<T> QueueSender<T> {
    async fn terminal_error(&self) -> Error {
        let mut terminal = self.terminal.clone();
        let err = match terminal.wait_for(Option::is_some).await {
            Ok(err) => err.clone(),
            Err(_) => None,
        };
        err.unwrap_or(Error::StreamClosed)
    }
}

#[async_trait]
impl<T> StreamSender<T> for QueueSender<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn send(&mut self, message: &T) -> Result<(), Error> {
        let (taken, was_taken) = oneshot::channel();
        let handoff = Handoff {
            message: message.clone(),
            taken,
        };
        if self.tx.send(handoff).await.is_err() {
            return Err(self.terminal_error().await);
        }
        match was_taken.await {
            Ok(()) => Ok(()),
            Err(_) => Err(self.terminal_error().await),
        }
    }
}

struct QueueReceiver<T> {
    rx: mpsc::Receiver<Result<T, Error>>,
}

#[async_trait]
impl<T> StreamReceiver<T> for QueueReceiver<T>
where
    T: Send + 'static,
{
    async fn recv(&mut self) -> Result<T, Error> {
        self.rx.recv().await.unwrap_or(Err(Error::StreamClosed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_stream::StreamExt;

    #[test]
    fn test_invalid_endpoint() {
        let err = GrpcTransport::new("not a uri", MetadataMap::new(), None).unwrap_err();
        assert!(matches!(err, ExporterBuildError::InvalidUri(uri, _) if uri == "not a uri"));
    }

    #[tokio::test]
    async fn test_dial_failure_is_transport_error() {
        // nothing listens on the discard port
        let transport =
            GrpcTransport::new("http://127.0.0.1:9", MetadataMap::new(), None).unwrap();
        let err = transport.dial().await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_queue_receiver_ends_with_stream_closed() {
        let (tx, rx) = mpsc::channel::<Result<u32, Error>>(1);
        let mut receiver = QueueReceiver { rx };
        tx.send(Ok(7)).await.unwrap();
        drop(tx);

        assert_eq!(receiver.recv().await, Ok(7));
        assert_eq!(receiver.recv().await, Err(Error::StreamClosed));
    }

    fn resource_exhausted() -> Error {
        Error::Rpc {
            code: tonic::Code::ResourceExhausted,
            message: "grpc: received message larger than max".to_string(),
        }
    }

    #[tokio::test]
    async fn test_send_resolves_once_the_transport_asks_for_more() {
        let (_terminal_tx, terminal) = watch::channel(None);
        let (mut sender, mut stream) = request_stream::<u32>(terminal);

        let send = tokio::spawn(async move {
            let result = sender.send(&1).await;
            (sender, result)
        });
        assert_eq!(stream.next().await, Some(1));

        // taken, but the transport has not come back for more yet
        tokio::task::yield_now().await;
        assert!(!send.is_finished());

        let next = tokio::time::timeout(Duration::from_millis(20), stream.next()).await;
        assert!(next.is_err());
        let (_sender, result) = send.await.unwrap();
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn test_send_fails_with_the_status_that_ended_the_call() {
        let (terminal_tx, terminal) = watch::channel(None);
        let (mut sender, mut stream) = request_stream::<u32>(terminal);

        // the agent reads the message, then rejects it
        let agent = tokio::spawn(async move {
            let taken = stream.next().await;
            terminal_tx.send_replace(Some(resource_exhausted()));
            drop(stream);
            taken
        });

        assert_eq!(sender.send(&2).await, Err(resource_exhausted()));
        assert_eq!(agent.await.unwrap(), Some(2));
        // the call is over, later sends keep reporting why
        assert_eq!(sender.send(&3).await, Err(resource_exhausted()));
    }

    #[tokio::test]
    async fn test_send_after_abort_is_stream_closed() {
        let (terminal_tx, terminal) = watch::channel(None);
        let (mut sender, stream) = request_stream::<u32>(terminal);
        drop(stream);
        drop(terminal_tx);
        assert_eq!(sender.send(&1).await, Err(Error::StreamClosed));
    }
}
