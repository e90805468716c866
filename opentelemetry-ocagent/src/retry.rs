//! Trace export with splitting of oversized requests.
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use opentelemetry::{otel_debug, otel_warn};
use prost::Message;

use crate::connection::ConnectionManager;
use crate::proto::agent::trace::v1::ExportTraceServiceRequest;
use crate::Error;

/// Largest request the agent is assumed to accept, gRPC's default receive
/// limit.
pub(crate) const MAX_REQUEST_SIZE: usize = 4 * 1024 * 1024;

/// Whether a rejected request should be split in two and resent.
pub(crate) fn should_split(request: &ExportTraceServiceRequest, err: &Error) -> bool {
    err.is_resource_exhausted()
        && request.encoded_len() > MAX_REQUEST_SIZE
        && request.spans.len() > 2
}

/// Split the spans of `request` at the midpoint. Both halves keep the node
/// and the resource of the original.
pub(crate) fn split_request(
    request: ExportTraceServiceRequest,
) -> (ExportTraceServiceRequest, ExportTraceServiceRequest) {
    let ExportTraceServiceRequest {
        node,
        mut spans,
        resource,
    } = request;
    let second = spans.split_off(spans.len() / 2);

    (
        ExportTraceServiceRequest {
            node: node.clone(),
            spans,
            resource: resource.clone(),
        },
        ExportTraceServiceRequest {
            node,
            spans: second,
            resource,
        },
    )
}

/// Send `request` on the current trace stream.
///
/// A request the agent rejects as too large is split in two; the exporter
/// reconnects, since the agent has usually dropped the stream by then, and
/// sends each half the same way. Both halves must succeed: when the second
/// fails the first has still been delivered, and a caller retrying the whole
/// request will send those spans twice.
///
/// A stream the agent closed cleanly is reported to the connection manager
/// but is not an error for the caller.
pub(crate) fn export_traces(
    manager: &ConnectionManager,
    request: ExportTraceServiceRequest,
) -> BoxFuture<'_, Result<(), Error>> {
    async move {
        if request.spans.is_empty() {
            return Ok(());
        }
        if manager.is_stopped() {
            return Err(Error::Stopped);
        }

        let session = manager.active_session()?;
        let err = match session.export_traces(&request).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if should_split(&request, &err) {
            otel_debug!(
                name: "OcAgent.SplittingRequest",
                spans = request.spans.len(),
                size = request.encoded_len()
            );
            let (first, second) = split_request(request);
            manager.connect().await?;
            for half in [first, second] {
                if let Err(err) = export_traces(manager, half).await {
                    manager.mark_disconnected(err.clone());
                    return Err(err);
                }
            }
            return Ok(());
        }

        manager.report_failure(&session, err.clone());
        if err.is_stream_closed() {
            Ok(())
        } else {
            otel_warn!(name: "OcAgent.TraceExportFailed", reason = format!("{}", err));
            Err(err)
        }
    }
    .boxed()
}
