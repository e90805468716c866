//! Aggregated stats views consumed by the exporter.
//!
//! A [`ViewData`] is the snapshot an instrumentation library hands over when a
//! reporting window closes: one [`Row`] per combination of tag values, all
//! rows sharing the window's start and end time.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

/// The numeric type recorded by a [`Measure`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Measurements are `i64`.
    Int64,
    /// Measurements are `f64`.
    Float64,
}

/// A declared measurement.
#[derive(Clone, Debug, PartialEq)]
pub struct Measure {
    /// Name of the measure.
    pub name: String,
    /// Human readable description.
    pub description: String,
    /// Unit of the recorded values, e.g. `ms` or `By`.
    pub unit: String,
    /// Numeric type of the recorded values.
    pub kind: ValueKind,
}

impl Measure {
    /// Declare an integer measure.
    pub fn int64(
        name: impl Into<String>,
        description: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Measure {
            name: name.into(),
            description: description.into(),
            unit: unit.into(),
            kind: ValueKind::Int64,
        }
    }

    /// Declare a floating point measure.
    pub fn float64(
        name: impl Into<String>,
        description: impl Into<String>,
        unit: impl Into<String>,
    ) -> Self {
        Measure {
            name: name.into(),
            description: description.into(),
            unit: unit.into(),
            kind: ValueKind::Float64,
        }
    }
}

/// How the measurements of a view are aggregated.
#[derive(Clone, Debug, PartialEq)]
pub enum Aggregation {
    /// Number of recorded measurements.
    Count,
    /// Histogram over the given bucket bounds.
    Distribution {
        /// Upper bounds of the buckets, strictly increasing.
        bounds: Vec<f64>,
    },
    /// The most recent measurement.
    LastValue,
    /// Sum of the recorded measurements.
    Sum,
}

/// A named aggregation of a measure over a set of tag keys.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct View {
    /// Name of the view; the measure's name is used when empty.
    pub name: String,
    /// Description of the view; the measure's description is used when empty.
    pub description: String,
    /// The aggregated measure.
    pub measure: Option<Measure>,
    /// The aggregation applied to the measure.
    pub aggregation: Option<Aggregation>,
    /// Tag keys, in the order rows carry their tag values.
    pub tag_keys: Vec<String>,
}

/// A tag key paired with the value recorded for it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    /// The tag key.
    pub key: String,
    /// The tag value. May be empty.
    pub value: String,
}

impl Tag {
    /// Create a tag.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Tag {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// One aggregated value for a single combination of tag values.
///
/// `tags` follows the order of the view's `tag_keys`.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    /// Present tags of this row.
    pub tags: Vec<Tag>,
    /// The aggregated value.
    pub data: AggregationData,
}

/// The aggregated value held by a [`Row`].
#[derive(Clone, Debug, PartialEq)]
pub enum AggregationData {
    /// Result of [`Aggregation::Count`].
    Count(i64),
    /// Result of [`Aggregation::Distribution`].
    Distribution(DistributionData),
    /// Result of [`Aggregation::LastValue`].
    LastValue(f64),
    /// Result of [`Aggregation::Sum`].
    Sum(f64),
}

/// Summary of a distribution aggregation.
///
/// The sum is not stored; it is `count * mean`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DistributionData {
    /// Number of recorded measurements.
    pub count: i64,
    /// Smallest recorded measurement.
    pub min: f64,
    /// Largest recorded measurement.
    pub max: f64,
    /// Mean of the recorded measurements.
    pub mean: f64,
    /// Sum of squared deviations from the mean.
    pub sum_of_squared_dev: f64,
    /// Number of measurements per bucket, one entry per bucket.
    pub count_per_bucket: Vec<i64>,
    /// One optional exemplar per bucket.
    pub exemplars_per_bucket: Vec<Option<Exemplar>>,
}

/// An example measurement retained for a distribution bucket.
#[derive(Clone, Debug, PartialEq)]
pub struct Exemplar {
    /// The recorded value.
    pub value: f64,
    /// When the value was recorded.
    pub timestamp: SystemTime,
    /// Contextual data such as the trace and span ids active at recording time.
    pub attachments: HashMap<String, String>,
}

/// A snapshot of a view over one reporting window.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewData {
    /// The view that produced this snapshot.
    pub view: Option<Arc<View>>,
    /// Start of the reporting window.
    pub start: SystemTime,
    /// End of the reporting window.
    pub end: SystemTime,
    /// One row per tag value combination.
    pub rows: Vec<Row>,
}
