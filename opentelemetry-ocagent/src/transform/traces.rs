use std::collections::HashMap;

use opentelemetry::trace::{self, Link, SpanId, SpanKind, TraceState};
use opentelemetry::{KeyValue, Value};
use opentelemetry_sdk::trace::SpanData;

use crate::proto::trace::v1::{
    attribute_value, span, AttributeValue, Span, Status, TruncatableString,
};
use crate::transform::metrics::to_timestamp;

/// gRPC `UNKNOWN`, reported for spans that ended with an error status.
const STATUS_CODE_UNKNOWN: i32 = 2;

impl From<SpanKind> for span::SpanKind {
    fn from(span_kind: SpanKind) -> Self {
        match span_kind {
            SpanKind::Server => span::SpanKind::Server,
            SpanKind::Client => span::SpanKind::Client,
            SpanKind::Producer | SpanKind::Consumer | SpanKind::Internal => {
                span::SpanKind::Unspecified
            }
        }
    }
}

impl From<&trace::Status> for Status {
    fn from(status: &trace::Status) -> Self {
        match status {
            trace::Status::Error { description } => Status {
                code: STATUS_CODE_UNKNOWN,
                message: description.to_string(),
            },
            _ => Status::default(),
        }
    }
}

impl From<Link> for span::Link {
    fn from(link: Link) -> Self {
        span::Link {
            trace_id: link.span_context.trace_id().to_bytes().to_vec(),
            span_id: link.span_context.span_id().to_bytes().to_vec(),
            r#type: span::link::Type::Unspecified as i32,
            attributes: Some(attributes(link.attributes, link.dropped_attributes_count)),
            tracestate: tracestate(link.span_context.trace_state()),
        }
    }
}

impl From<SpanData> for Span {
    fn from(source_span: SpanData) -> Self {
        let span_kind: span::SpanKind = source_span.span_kind.into();
        Span {
            trace_id: source_span.span_context.trace_id().to_bytes().to_vec(),
            span_id: source_span.span_context.span_id().to_bytes().to_vec(),
            tracestate: tracestate(source_span.span_context.trace_state()),
            parent_span_id: {
                if source_span.parent_span_id != SpanId::INVALID {
                    source_span.parent_span_id.to_bytes().to_vec()
                } else {
                    vec![]
                }
            },
            name: Some(truncatable(source_span.name.into_owned())),
            kind: span_kind as i32,
            start_time: Some(to_timestamp(source_span.start_time)),
            end_time: Some(to_timestamp(source_span.end_time)),
            attributes: Some(attributes(
                source_span.attributes,
                source_span.dropped_attributes_count,
            )),
            time_events: Some(span::TimeEvents {
                dropped_annotations_count: source_span.events.dropped_count as i32,
                time_event: source_span
                    .events
                    .events
                    .into_iter()
                    .map(|event| span::TimeEvent {
                        time: Some(to_timestamp(event.timestamp)),
                        value: Some(span::time_event::Value::Annotation(
                            span::time_event::Annotation {
                                description: Some(truncatable(event.name.into_owned())),
                                attributes: Some(attributes(
                                    event.attributes,
                                    event.dropped_attributes_count,
                                )),
                            },
                        )),
                    })
                    .collect(),
                dropped_message_events_count: 0,
            }),
            links: Some(span::Links {
                dropped_links_count: source_span.links.dropped_count as i32,
                link: source_span.links.links.into_iter().map(Into::into).collect(),
            }),
            status: Some(Status::from(&source_span.status)),
            resource: None,
            same_process_as_parent_span: None,
        }
    }
}

/// Convert a batch of finished spans, keeping their order.
pub fn spans_to_proto(batch: Vec<SpanData>) -> Vec<Span> {
    batch.into_iter().map(Span::from).collect()
}

fn truncatable(value: String) -> TruncatableString {
    TruncatableString {
        value,
        truncated_byte_count: 0,
    }
}

fn attributes(attributes: Vec<KeyValue>, dropped: u32) -> span::Attributes {
    span::Attributes {
        attribute_map: attributes
            .into_iter()
            .map(|kv| (kv.key.to_string(), attribute_value(kv.value)))
            .collect::<HashMap<_, _>>(),
        dropped_attributes_count: dropped as i32,
    }
}

fn attribute_value(value: Value) -> AttributeValue {
    let value = match value {
        Value::Bool(value) => attribute_value::Value::BoolValue(value),
        Value::I64(value) => attribute_value::Value::IntValue(value),
        Value::F64(value) => attribute_value::Value::DoubleValue(value),
        other => attribute_value::Value::StringValue(truncatable(other.as_str().into_owned())),
    };
    AttributeValue { value: Some(value) }
}

fn tracestate(trace_state: &TraceState) -> Option<span::Tracestate> {
    let header = trace_state.header();
    if header.is_empty() {
        return None;
    }

    Some(span::Tracestate {
        entries: header
            .split_terminator(',')
            .filter_map(|entry| entry.split_once('='))
            .map(|(key, value)| span::tracestate::Entry {
                key: key.trim().to_string(),
                value: value.trim().to_string(),
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry::trace::{Span as _, Tracer, TracerProvider as _};
    use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider};

    fn finished_spans(record: impl FnOnce(&opentelemetry_sdk::trace::SdkTracer)) -> Vec<SpanData> {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        let tracer = provider.tracer("ocagent-test");
        record(&tracer);
        exporter.get_finished_spans().unwrap()
    }

    #[test]
    fn test_span_fields() {
        let spans = finished_spans(|tracer| {
            let mut span = tracer
                .span_builder("GET /users")
                .with_kind(SpanKind::Server)
                .with_attributes(vec![
                    KeyValue::new("http.method", "GET"),
                    KeyValue::new("http.status_code", 500_i64),
                    KeyValue::new("retry", true),
                    KeyValue::new("ratio", 0.5),
                ])
                .start(tracer);
            span.add_event("cache miss", vec![KeyValue::new("key", "user:1")]);
            span.set_status(trace::Status::error("backend unavailable"));
            span.end();
        });
        assert_eq!(spans.len(), 1);
        let source = spans[0].clone();

        let span = Span::from(source.clone());
        assert_eq!(
            span.trace_id,
            source.span_context.trace_id().to_bytes().to_vec()
        );
        assert_eq!(span.span_id, source.span_context.span_id().to_bytes().to_vec());
        assert!(span.parent_span_id.is_empty());
        assert_eq!(span.name.unwrap().value, "GET /users");
        assert_eq!(span.kind, span::SpanKind::Server as i32);
        assert_eq!(span.start_time, Some(to_timestamp(source.start_time)));
        assert_eq!(span.end_time, Some(to_timestamp(source.end_time)));

        let attributes = span.attributes.unwrap().attribute_map;
        assert_eq!(
            attributes["http.method"].value,
            Some(attribute_value::Value::StringValue(truncatable(
                "GET".to_string()
            )))
        );
        assert_eq!(
            attributes["http.status_code"].value,
            Some(attribute_value::Value::IntValue(500))
        );
        assert_eq!(
            attributes["retry"].value,
            Some(attribute_value::Value::BoolValue(true))
        );
        assert_eq!(
            attributes["ratio"].value,
            Some(attribute_value::Value::DoubleValue(0.5))
        );

        let time_events = span.time_events.unwrap().time_event;
        assert_eq!(time_events.len(), 1);
        match &time_events[0].value {
            Some(span::time_event::Value::Annotation(annotation)) => {
                assert_eq!(
                    annotation.description.as_ref().unwrap().value,
                    "cache miss"
                );
            }
            other => panic!("expected an annotation, got {:?}", other),
        }

        let status = span.status.unwrap();
        assert_eq!(status.code, STATUS_CODE_UNKNOWN);
        assert_eq!(status.message, "backend unavailable");
    }

    #[test]
    fn test_child_span_keeps_parent_and_order() {
        let spans = finished_spans(|tracer| {
            tracer.in_span("parent", |_cx| {
                tracer.in_span("child", |_cx| {});
            });
        });
        // children end first
        let converted = spans_to_proto(spans.clone());
        let names: Vec<_> = converted
            .iter()
            .map(|span| span.name.as_ref().unwrap().value.clone())
            .collect();
        assert_eq!(names, vec!["child", "parent"]);

        assert_eq!(converted[0].parent_span_id, converted[1].span_id);
        assert_eq!(converted[0].trace_id, converted[1].trace_id);
        assert_eq!(converted[1].status, Some(Status::default()));
    }

    #[test]
    fn test_span_kind_mapping() {
        assert_eq!(
            span::SpanKind::from(SpanKind::Client),
            span::SpanKind::Client
        );
        assert_eq!(
            span::SpanKind::from(SpanKind::Producer),
            span::SpanKind::Unspecified
        );
        assert_eq!(
            span::SpanKind::from(SpanKind::Internal),
            span::SpanKind::Unspecified
        );
    }

    #[test]
    fn test_tracestate_entries() {
        let state = TraceState::from_key_value(vec![("vendor", "abc"), ("other", "1")]).unwrap();
        let entries = tracestate(&state).unwrap().entries;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].key, "vendor");
        assert_eq!(entries[0].value, "abc");

        assert_eq!(tracestate(&TraceState::default()), None);
    }
}
