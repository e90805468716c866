//! Conversion of stats [`ViewData`] snapshots into OpenCensus metrics.
use std::time::SystemTime;

use opentelemetry::otel_debug;
use prost_types::Timestamp;

use crate::proto::metrics::v1::{
    distribution_value, metric_descriptor, point, DistributionValue, LabelKey, LabelValue, Metric,
    MetricDescriptor, Point, TimeSeries,
};
use crate::view::{Aggregation, AggregationData, Exemplar, Tag, ValueKind, View, ViewData};
use crate::Error;

/// Convert a view snapshot into a metric with one timeseries per row.
pub fn view_data_to_metric(view_data: Option<&ViewData>) -> Result<Metric, Error> {
    let view_data = view_data.ok_or(Error::NilViewData)?;
    let view = view_data.view.as_deref();

    Ok(Metric {
        metric_descriptor: Some(view_to_metric_descriptor(view)?),
        timeseries: view_data_to_timeseries(view_data),
        resource: None,
    })
}

/// Convert a batch of snapshots, dropping the ones that cannot be mapped.
pub fn view_data_batch_to_metrics(batch: &[ViewData]) -> Vec<Metric> {
    batch
        .iter()
        .filter_map(|view_data| match view_data_to_metric(Some(view_data)) {
            Ok(metric) => Some(metric),
            Err(err) => {
                otel_debug!(name: "OcAgent.ViewDataDropped", reason = format!("{}", err));
                None
            }
        })
        .collect()
}

/// Build the descriptor of a view. Name and description fall back to the
/// measure's when the view leaves them empty.
pub fn view_to_metric_descriptor(view: Option<&View>) -> Result<MetricDescriptor, Error> {
    let view = view.ok_or(Error::NilView)?;
    let measure = view.measure.as_ref().ok_or(Error::NilMeasure)?;

    Ok(MetricDescriptor {
        name: or_fallback(&view.name, &measure.name),
        description: or_fallback(&view.description, &measure.description),
        unit: measure.unit.clone(),
        r#type: descriptor_type(view) as i32,
        label_keys: view
            .tag_keys
            .iter()
            .map(|key| LabelKey {
                key: key.clone(),
                description: String::new(),
            })
            .collect(),
    })
}

fn or_fallback(first: &str, fallback: &str) -> String {
    if first.is_empty() {
        fallback.to_string()
    } else {
        first.to_string()
    }
}

/// The wire type of a view, from its aggregation and its measure's value kind.
pub fn descriptor_type(view: &View) -> metric_descriptor::Type {
    use metric_descriptor::Type;

    let kind = match &view.measure {
        Some(measure) => measure.kind,
        None => return Type::Unspecified,
    };

    match (&view.aggregation, kind) {
        (None, _) => Type::Unspecified,
        (Some(Aggregation::Count), _) => Type::CumulativeInt64,
        (Some(Aggregation::Distribution { .. }), _) => Type::CumulativeDistribution,
        (Some(Aggregation::LastValue), ValueKind::Float64) => Type::GaugeDouble,
        (Some(Aggregation::LastValue), ValueKind::Int64) => Type::GaugeInt64,
        (Some(Aggregation::Sum), ValueKind::Float64) => Type::CumulativeDouble,
        (Some(Aggregation::Sum), ValueKind::Int64) => Type::CumulativeInt64,
    }
}

/// One timeseries per row. The snapshot only carries one window, so every
/// timeseries shares the start time and every point the end time.
pub fn view_data_to_timeseries(view_data: &ViewData) -> Vec<TimeSeries> {
    if view_data.rows.is_empty() {
        return Vec::new();
    }

    let start_timestamp = to_timestamp(view_data.start);
    let end_timestamp = to_timestamp(view_data.end);
    let kind = view_data
        .view
        .as_ref()
        .and_then(|view| view.measure.as_ref())
        .map(|measure| measure.kind)
        .unwrap_or(ValueKind::Float64);

    view_data
        .rows
        .iter()
        .map(|row| TimeSeries {
            start_timestamp: Some(start_timestamp),
            // Positional: must stay in the descriptor's label key order.
            label_values: label_values_from_tags(&row.tags),
            points: vec![Point {
                timestamp: Some(end_timestamp),
                value: Some(point_value(&row.data, kind)),
            }],
        })
        .collect()
}

fn point_value(data: &AggregationData, kind: ValueKind) -> point::Value {
    match data {
        AggregationData::Count(count) => point::Value::Int64Value(*count),
        AggregationData::Distribution(distribution) => {
            point::Value::DistributionValue(DistributionValue {
                count: distribution.count,
                // only the mean is retained
                sum: distribution.count as f64 * distribution.mean,
                sum_of_squared_deviation: distribution.sum_of_squared_dev,
                bucket_options: None,
                buckets: exemplars_to_buckets(&distribution.exemplars_per_bucket),
            })
        }
        AggregationData::LastValue(value) | AggregationData::Sum(value) => match kind {
            ValueKind::Int64 => point::Value::Int64Value(*value as i64),
            ValueKind::Float64 => point::Value::DoubleValue(*value),
        },
    }
}

/// Every present exemplar becomes a bucket with a count of one.
fn exemplars_to_buckets(exemplars: &[Option<Exemplar>]) -> Vec<distribution_value::Bucket> {
    exemplars
        .iter()
        .flatten()
        .map(|exemplar| distribution_value::Bucket {
            count: 1,
            exemplar: Some(distribution_value::Exemplar {
                value: exemplar.value,
                timestamp: Some(to_timestamp(exemplar.timestamp)),
                attachments: exemplar.attachments.clone(),
            }),
        })
        .collect()
}

/// Only present tags are materialized, so every value has `has_value` set.
pub(crate) fn label_values_from_tags(tags: &[Tag]) -> Vec<LabelValue> {
    tags.iter()
        .map(|tag| LabelValue {
            value: tag.value.clone(),
            has_value: true,
        })
        .collect()
}

pub(crate) fn to_timestamp(time: SystemTime) -> Timestamp {
    Timestamp::from(time)
}
