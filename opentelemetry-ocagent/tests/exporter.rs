use std::sync::Arc;
use std::time::{Duration, SystemTime};

use opentelemetry::trace::{SamplingDecision, SpanKind, TraceId, Tracer, TracerProvider as _};
use opentelemetry_ocagent::proto::agent::trace::v1::ExportTraceServiceRequest;
use opentelemetry_ocagent::proto::trace::v1::{
    constant_sampler::ConstantDecision, trace_config, ConstantSampler, Span, TraceConfig,
    TruncatableString,
};
use opentelemetry_ocagent::testing::InMemoryAgent;
use opentelemetry_ocagent::{
    Aggregation, AggregationData, ConnectionState, Error, Measure, OcAgentExporter, Row, Tag,
    View, ViewData,
};
use opentelemetry_sdk::trace::{
    InMemorySpanExporter, SdkTracerProvider, ShouldSample, SpanData,
};

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn exporter_for(agent: &InMemoryAgent) -> OcAgentExporter {
    OcAgentExporter::builder()
        .with_service_name("checkout")
        .with_transport(agent.clone())
        .with_reconnection_period(Duration::from_millis(50))
        .build()
        .unwrap()
}

fn finished_spans(count: usize) -> Vec<SpanData> {
    let recorder = InMemorySpanExporter::default();
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(recorder.clone())
        .build();
    let tracer = provider.tracer("ocagent-test");
    for i in 0..count {
        tracer.in_span(format!("op-{i}"), |_| {});
    }
    recorder.get_finished_spans().unwrap()
}

fn proto_span(name: &str, payload: usize) -> Span {
    Span {
        name: Some(TruncatableString {
            value: format!("{}{}", name, "x".repeat(payload)),
            truncated_byte_count: 0,
        }),
        ..Default::default()
    }
}

fn span_names(spans: &[Span]) -> Vec<String> {
    spans
        .iter()
        .map(|span| {
            span.name
                .as_ref()
                .map(|name| name.value.chars().take_while(|c| *c != 'x').collect())
                .unwrap_or_default()
        })
        .collect()
}

/// Sizes of the non-handshake trace requests.
fn batch_sizes(agent: &InMemoryAgent) -> Vec<usize> {
    agent
        .trace_requests()
        .iter()
        .filter(|request| request.node.is_none())
        .map(|request| request.spans.len())
        .collect()
}

#[tokio::test]
async fn handshake_identifies_the_process() {
    let agent = InMemoryAgent::default();
    let exporter = exporter_for(&agent);
    exporter.start().await.unwrap();

    assert!(exporter.is_connected());
    assert_eq!(exporter.connection_state(), ConnectionState::Connected);

    let traces = agent.trace_requests();
    assert_eq!(traces.len(), 1);
    let node = traces[0].node.clone().unwrap();
    assert_eq!(node.service_info.unwrap().name, "checkout");
    let identifier = node.identifier.unwrap();
    assert_eq!(identifier.pid, std::process::id());
    assert!(identifier.start_timestamp.is_some());
    assert!(traces[0].spans.is_empty());

    let metrics = agent.metrics_requests();
    assert_eq!(metrics.len(), 1);
    assert!(metrics[0].node.is_some());

    let config = agent.config_messages();
    assert_eq!(config.len(), 1);
    assert!(config[0].node.is_some());
    assert!(config[0].config.is_none());

    exporter.stop().await.unwrap();
}

#[tokio::test]
async fn start_and_stop_are_guarded() {
    let agent = InMemoryAgent::default();
    let exporter = exporter_for(&agent);

    assert_eq!(exporter.stop().await, Err(Error::NotStarted));
    exporter.start().await.unwrap();
    assert_eq!(exporter.start().await, Err(Error::AlreadyStarted));

    exporter.stop().await.unwrap();
    exporter.stop().await.unwrap();

    assert_eq!(agent.dial_count(), 1);
    assert_eq!(agent.close_count(), 1);
    assert_eq!(
        exporter
            .export_trace_service_request(ExportTraceServiceRequest {
                spans: vec![proto_span("late", 0)],
                ..Default::default()
            })
            .await,
        Err(Error::Stopped)
    );
}

#[tokio::test]
async fn stop_waits_for_a_start_in_progress() {
    let agent = InMemoryAgent::default();
    agent.set_dial_delay(Duration::from_millis(200));
    let exporter = Arc::new(exporter_for(&agent));

    let starting = tokio::spawn({
        let exporter = exporter.clone();
        async move { exporter.start().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    exporter.stop().await.unwrap();
    starting.await.unwrap().unwrap();

    assert_eq!(agent.dial_count(), 1);
    assert_eq!(agent.close_count(), 1);
    assert!(!exporter.is_connected());
    assert_eq!(exporter.connection_state(), ConnectionState::Unconnected);

    exporter.stop().await.unwrap();
    assert_eq!(
        exporter
            .export_trace_service_request(ExportTraceServiceRequest {
                spans: vec![proto_span("late", 0)],
                ..Default::default()
            })
            .await,
        Err(Error::Stopped)
    );
}

#[tokio::test]
async fn an_abandoned_start_can_be_retried() {
    let agent = InMemoryAgent::default();
    agent.set_dial_delay(Duration::from_millis(200));
    let exporter = exporter_for(&agent);

    let abandoned = tokio::time::timeout(Duration::from_millis(50), exporter.start()).await;
    assert!(abandoned.is_err());
    assert_eq!(exporter.stop().await, Err(Error::NotStarted));

    exporter.start().await.unwrap();
    assert_eq!(agent.dial_count(), 2);
    assert!(exporter.is_connected());
    assert_eq!(exporter.start().await, Err(Error::AlreadyStarted));

    exporter.stop().await.unwrap();
    assert_eq!(agent.close_count(), 1);
}

#[tokio::test]
async fn spans_are_batched_by_size_then_by_delay() {
    let agent = InMemoryAgent::default();
    let exporter = OcAgentExporter::builder()
        .with_transport(agent.clone())
        .with_span_batch(300, Duration::from_millis(200))
        .build()
        .unwrap();
    exporter.start().await.unwrap();

    for span in finished_spans(301) {
        exporter.export_span(span);
    }

    eventually("full batch", || batch_sizes(&agent) == vec![300]).await;
    eventually("remainder", || batch_sizes(&agent) == vec![300, 1]).await;

    exporter.stop().await.unwrap();
}

#[tokio::test]
async fn stop_delivers_buffered_spans() {
    let agent = InMemoryAgent::default();
    let exporter = exporter_for(&agent);
    exporter.start().await.unwrap();

    for span in finished_spans(3) {
        exporter.export_span(span);
    }
    exporter.stop().await.unwrap();

    assert_eq!(batch_sizes(&agent), vec![3]);
    let names: Vec<_> = agent
        .exported_spans()
        .into_iter()
        .map(|span| span.name.unwrap().value)
        .collect();
    assert_eq!(names, vec!["op-0", "op-1", "op-2"]);
}

#[tokio::test]
async fn reconnects_after_the_agent_closes_the_stream() {
    let agent = InMemoryAgent::default();
    let exporter = exporter_for(&agent);
    exporter.start().await.unwrap();

    agent.close_trace_stream();
    let lost = ExportTraceServiceRequest {
        spans: vec![proto_span("lost", 0)],
        ..Default::default()
    };
    // a clean close is not the caller's error
    exporter.export_trace_service_request(lost).await.unwrap();

    eventually("reconnect", || {
        agent.dial_count() == 2 && exporter.is_connected()
    })
    .await;
    assert_eq!(exporter.last_connect_error(), None);

    let delivered = ExportTraceServiceRequest {
        spans: vec![proto_span("delivered", 0)],
        ..Default::default()
    };
    exporter
        .export_trace_service_request(delivered)
        .await
        .unwrap();
    assert_eq!(span_names(&agent.exported_spans()), vec!["delivered"]);

    exporter.stop().await.unwrap();
    assert_eq!(agent.close_count(), 2);
}

#[tokio::test]
async fn failed_dials_are_retried() {
    let agent = InMemoryAgent::default();
    agent.set_dial_failure(Some(Error::Transport("connection refused".to_string())));
    let exporter = exporter_for(&agent);

    // the first failure is recorded, not returned
    exporter.start().await.unwrap();
    assert!(!exporter.is_connected());
    assert_eq!(
        exporter.last_connect_error(),
        Some(Error::Transport("connection refused".to_string()))
    );
    assert!(matches!(
        exporter.connection_state(),
        ConnectionState::Disconnected { .. }
    ));

    let result = exporter
        .export_trace_service_request(ExportTraceServiceRequest {
            spans: vec![proto_span("dropped", 0)],
            ..Default::default()
        })
        .await;
    assert!(matches!(result, Err(Error::LastConnection(_))));

    eventually("another attempt", || agent.dial_count() >= 2).await;
    agent.set_dial_failure(None);
    eventually("connected", || exporter.is_connected()).await;

    exporter.stop().await.unwrap();
}

#[tokio::test]
async fn oversized_requests_are_split() {
    let agent = InMemoryAgent::default();
    agent.reject_requests_larger_than(4 * 1024 * 1024);
    let exporter = OcAgentExporter::builder()
        .with_transport(agent.clone())
        .with_reconnection_period(Duration::from_secs(60))
        .build()
        .unwrap();
    exporter.start().await.unwrap();

    let spans: Vec<_> = (0..6)
        .map(|i| proto_span(&format!("s{i}"), 1024 * 1024))
        .collect();
    exporter
        .export_trace_service_request(ExportTraceServiceRequest {
            spans,
            ..Default::default()
        })
        .await
        .unwrap();

    // one redial for the split, halves delivered in order
    assert_eq!(agent.dial_count(), 2);
    assert_eq!(batch_sizes(&agent), vec![3, 3]);
    assert_eq!(
        span_names(&agent.exported_spans()),
        vec!["s0", "s1", "s2", "s3", "s4", "s5"]
    );
    assert!(exporter.is_connected());

    exporter.stop().await.unwrap();
}

#[tokio::test]
async fn halves_that_are_still_too_large_are_split_again() {
    let agent = InMemoryAgent::default();
    agent.reject_requests_larger_than(4 * 1024 * 1024);
    let exporter = OcAgentExporter::builder()
        .with_transport(agent.clone())
        .with_reconnection_period(Duration::from_secs(60))
        .build()
        .unwrap();
    exporter.start().await.unwrap();

    let names: Vec<_> = (0..12).map(|i| format!("s{i}")).collect();
    let spans = names
        .iter()
        .map(|name| proto_span(name, 1024 * 1024))
        .collect();
    exporter
        .export_trace_service_request(ExportTraceServiceRequest {
            spans,
            ..Default::default()
        })
        .await
        .unwrap();

    // 12 -> 6 + 6 -> (3 + 3) + (3 + 3), one redial per split
    assert_eq!(agent.dial_count(), 4);
    assert_eq!(batch_sizes(&agent), vec![3, 3, 3, 3]);
    assert_eq!(span_names(&agent.exported_spans()), names);

    exporter.stop().await.unwrap();
}

#[tokio::test]
async fn two_oversized_spans_are_not_split() {
    let agent = InMemoryAgent::default();
    agent.reject_requests_larger_than(4 * 1024 * 1024);
    let exporter = OcAgentExporter::builder()
        .with_transport(agent.clone())
        .with_reconnection_period(Duration::from_secs(60))
        .build()
        .unwrap();
    exporter.start().await.unwrap();

    let result = exporter
        .export_trace_service_request(ExportTraceServiceRequest {
            spans: vec![
                proto_span("big-0", 3 * 1024 * 1024),
                proto_span("big-1", 3 * 1024 * 1024),
            ],
            ..Default::default()
        })
        .await;

    assert!(result.unwrap_err().is_resource_exhausted());
    // no redial on the way, and nothing but the handshake got through
    assert_eq!(agent.dial_count(), 1);
    assert_eq!(agent.trace_requests().len(), 1);
    assert!(!exporter.is_connected());

    exporter.stop().await.unwrap();
}

#[tokio::test]
async fn agent_pushed_config_changes_sampling() {
    let agent = InMemoryAgent::default();
    let exporter = exporter_for(&agent);
    exporter.start().await.unwrap();
    let sampler = exporter.sampler();

    let sample = || {
        sampler
            .should_sample(
                None,
                TraceId::from(42u128),
                "op",
                &SpanKind::Internal,
                &[],
                &[],
            )
            .decision
    };
    assert_eq!(sample(), SamplingDecision::RecordAndSample);

    let never = TraceConfig {
        sampler: Some(trace_config::Sampler::ConstantSampler(ConstantSampler {
            decision: ConstantDecision::AlwaysOff as i32,
        })),
        ..Default::default()
    };
    assert!(agent.push_config(never));

    eventually("ack", || agent.config_acks().len() == 1).await;
    assert_eq!(sample(), SamplingDecision::Drop);
    assert_eq!(
        agent.config_acks()[0].sampler,
        Some(trace_config::Sampler::ConstantSampler(ConstantSampler {
            decision: ConstantDecision::AlwaysOff as i32,
        }))
    );

    exporter.stop().await.unwrap();
}

#[tokio::test]
async fn view_data_is_exported_as_metrics() {
    let agent = InMemoryAgent::default();
    let exporter = exporter_for(&agent);
    exporter.start().await.unwrap();

    let view = Arc::new(View {
        name: "requests".to_string(),
        description: "Requests served".to_string(),
        measure: Some(Measure::int64("http/requests", "Requests", "1")),
        aggregation: Some(Aggregation::Count),
        tag_keys: vec!["method".to_string()],
    });
    let now = SystemTime::now();
    exporter.export_view_data(ViewData {
        view: Some(view),
        start: now - Duration::from_secs(10),
        end: now,
        rows: vec![Row {
            tags: vec![Tag::new("method", "GET")],
            data: AggregationData::Count(7),
        }],
    });
    // no view: dropped without affecting the rest
    exporter.export_view_data(ViewData {
        view: None,
        start: now,
        end: now,
        rows: Vec::new(),
    });
    exporter.flush().await;

    let requests = agent.metrics_requests();
    assert_eq!(requests.len(), 2);
    let metrics = &requests[1].metrics;
    assert_eq!(metrics.len(), 1);
    let descriptor = metrics[0].metric_descriptor.clone().unwrap();
    assert_eq!(descriptor.name, "requests");
    assert_eq!(descriptor.label_keys.len(), 1);
    assert_eq!(metrics[0].timeseries.len(), 1);

    exporter.stop().await.unwrap();
}

#[tokio::test]
async fn view_data_is_dropped_while_disconnected() {
    let agent = InMemoryAgent::default();
    agent.set_dial_failure(Some(Error::Transport("unreachable".to_string())));
    let exporter = OcAgentExporter::builder()
        .with_transport(agent.clone())
        .with_reconnection_period(Duration::from_secs(60))
        .build()
        .unwrap();
    exporter.start().await.unwrap();

    let view = Arc::new(View {
        name: "latency".to_string(),
        measure: Some(Measure::float64("http/latency", "Latency", "ms")),
        aggregation: Some(Aggregation::Sum),
        ..Default::default()
    });
    exporter.export_view_data(ViewData {
        view: Some(view),
        start: SystemTime::now(),
        end: SystemTime::now(),
        rows: vec![Row {
            tags: Vec::new(),
            data: AggregationData::Sum(12.5),
        }],
    });
    exporter.flush().await;
    assert!(agent.metrics_requests().is_empty());

    exporter.stop().await.unwrap();
}
