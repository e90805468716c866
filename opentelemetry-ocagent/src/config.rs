//! Exporter builder and configuration.
//!
//! Every setting can be given on the [`ExporterBuilder`]; some can also come
//! from the environment, in which case the builder value wins.
use std::env;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use opentelemetry::otel_debug;
use opentelemetry_sdk::trace::Sampler;
use tonic::codec::CompressionEncoding;
use tonic::metadata::{AsciiMetadataKey, AsciiMetadataValue, MetadataMap};
use tonic::transport::Channel;

use crate::exporter::OcAgentExporter;
use crate::node;
use crate::transport::{grpc::GrpcTransport, AgentTransport};
use crate::ExporterBuildError;

/// Target to which the exporter is going to send spans and views.
pub const OC_AGENT_ENDPOINT: &str = "OC_AGENT_ENDPOINT";
/// Default agent endpoint.
pub const OC_AGENT_ENDPOINT_DEFAULT: &str = "http://localhost:55678";
/// Seconds to wait between two reconnection attempts.
pub const OC_AGENT_RECONNECTION_PERIOD: &str = "OC_AGENT_RECONNECTION_PERIOD";
/// Default reconnection period.
pub const OC_AGENT_RECONNECTION_PERIOD_DEFAULT: Duration = Duration::from_secs(10);
/// Key-value pairs sent as gRPC metadata on every stream, e.g. `k1=v1,k2=v2`.
pub const OC_AGENT_HEADERS: &str = "OC_AGENT_HEADERS";

/// Spans buffered before a flush is forced.
pub const DEFAULT_SPAN_BATCH_SIZE: usize = 300;
/// View snapshots buffered before a flush is forced.
pub const DEFAULT_VIEW_BATCH_SIZE: usize = 500;
/// Longest time an item waits in a buffer before being flushed.
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_secs(2);

/// The compression algorithm to use when sending data.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Compression {
    /// Compresses data using gzip.
    Gzip,
    /// Compresses data using zstd.
    Zstd,
}

impl Display for Compression {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::Gzip => write!(f, "gzip"),
            Compression::Zstd => write!(f, "zstd"),
        }
    }
}

impl FromStr for Compression {
    type Err = ExporterBuildError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(Compression::Gzip),
            "zstd" => Ok(Compression::Zstd),
            _ => Err(ExporterBuildError::UnsupportedCompressionAlgorithm(
                s.to_string(),
            )),
        }
    }
}

impl TryFrom<Compression> for CompressionEncoding {
    type Error = ExporterBuildError;

    fn try_from(value: Compression) -> Result<Self, Self::Error> {
        match value {
            #[cfg(feature = "gzip-tonic")]
            Compression::Gzip => Ok(CompressionEncoding::Gzip),
            #[cfg(not(feature = "gzip-tonic"))]
            Compression::Gzip => Err(ExporterBuildError::FeatureRequiredForCompressionAlgorithm(
                "gzip-tonic",
                Compression::Gzip,
            )),
            #[cfg(feature = "zstd-tonic")]
            Compression::Zstd => Ok(CompressionEncoding::Zstd),
            #[cfg(not(feature = "zstd-tonic"))]
            Compression::Zstd => Err(ExporterBuildError::FeatureRequiredForCompressionAlgorithm(
                "zstd-tonic",
                Compression::Zstd,
            )),
        }
    }
}

/// Flush thresholds of one buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchConfig {
    /// Flush as soon as this many items are buffered.
    pub max_items: usize,
    /// Flush this long after the first item of a batch was added.
    pub delay: Duration,
}

impl BatchConfig {
    fn validate(self, name: &str) -> Result<Self, ExporterBuildError> {
        if self.max_items == 0 {
            return Err(ExporterBuildError::InvalidConfig {
                name: name.to_string(),
                reason: "batch size must be greater than zero".to_string(),
            });
        }
        if self.delay.is_zero() {
            return Err(ExporterBuildError::invalid_period(name, self.delay));
        }
        Ok(self)
    }
}

/// Resolved settings the exporter runs with.
#[derive(Clone, Debug)]
pub(crate) struct ExporterConfig {
    pub(crate) reconnection_period: Duration,
    pub(crate) span_batch: BatchConfig,
    pub(crate) view_batch: BatchConfig,
}

/// Builder for [`OcAgentExporter`].
///
/// ```no_run
/// # fn main() -> Result<(), opentelemetry_ocagent::ExporterBuildError> {
/// let exporter = opentelemetry_ocagent::OcAgentExporter::builder()
///     .with_endpoint("http://localhost:55678")
///     .with_service_name("checkout")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct ExporterBuilder {
    endpoint: Option<String>,
    service_name: Option<String>,
    reconnection_period: Option<Duration>,
    metadata: Option<MetadataMap>,
    compression: Option<Compression>,
    channel: Option<Channel>,
    resource: Option<opentelemetry_sdk::Resource>,
    span_batch: Option<BatchConfig>,
    view_batch: Option<BatchConfig>,
    transport: Option<Arc<dyn AgentTransport>>,
    sampler: Option<Sampler>,
}

impl ExporterBuilder {
    /// Set the agent endpoint, e.g. `http://localhost:55678`.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the service name reported in the node of every stream.
    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = Some(service_name.into());
        self
    }

    /// Set how long to wait between two reconnection attempts.
    pub fn with_reconnection_period(mut self, period: Duration) -> Self {
        self.reconnection_period = Some(period);
        self
    }

    /// Set custom metadata entries to send on every stream.
    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set the compression algorithm to use when communicating with the agent.
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = Some(compression);
        self
    }

    /// Use `channel` instead of dialing the endpoint.
    pub fn with_channel(mut self, channel: Channel) -> Self {
        self.channel = Some(channel);
        self
    }

    /// Describe the resource spans and views come from. Takes precedence over
    /// `OC_RESOURCE_TYPE` and `OC_RESOURCE_LABELS`.
    pub fn with_resource(mut self, resource: opentelemetry_sdk::Resource) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Set the flush thresholds of the span buffer.
    pub fn with_span_batch(mut self, max_items: usize, delay: Duration) -> Self {
        self.span_batch = Some(BatchConfig { max_items, delay });
        self
    }

    /// Set the flush thresholds of the view buffer.
    pub fn with_view_batch(mut self, max_items: usize, delay: Duration) -> Self {
        self.view_batch = Some(BatchConfig { max_items, delay });
        self
    }

    /// Replace the gRPC transport. Endpoint, metadata, compression and
    /// channel settings are ignored when a transport is given.
    pub fn with_transport(mut self, transport: impl AgentTransport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Set the sampler used until the agent pushes a configuration.
    pub fn with_sampler(mut self, sampler: Sampler) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Build an unstarted exporter.
    pub fn build(self) -> Result<OcAgentExporter, ExporterBuildError> {
        let reconnection_period = resolve_reconnection_period(self.reconnection_period);
        if reconnection_period.is_zero() {
            return Err(ExporterBuildError::invalid_period(
                "reconnection_period",
                reconnection_period,
            ));
        }

        let config = ExporterConfig {
            reconnection_period,
            span_batch: self
                .span_batch
                .unwrap_or(BatchConfig {
                    max_items: DEFAULT_SPAN_BATCH_SIZE,
                    delay: DEFAULT_BATCH_DELAY,
                })
                .validate("span_batch")?,
            view_batch: self
                .view_batch
                .unwrap_or(BatchConfig {
                    max_items: DEFAULT_VIEW_BATCH_SIZE,
                    delay: DEFAULT_BATCH_DELAY,
                })
                .validate("view_batch")?,
        };

        let transport: Arc<dyn AgentTransport> = match self.transport {
            Some(transport) => transport,
            None => {
                let compression = match self.compression {
                    Some(compression) => Some(compression.try_into()?),
                    None => None,
                };
                let (headers_from_env, headers_for_logging) = parse_headers_from_env();
                let metadata = merge_metadata_with_headers_from_env(
                    self.metadata.unwrap_or_default(),
                    headers_from_env,
                );
                let endpoint = resolve_endpoint(self.endpoint);

                otel_debug!(
                    name: "OcAgent.TransportConfigured",
                    endpoint = endpoint.clone(),
                    compression = format!("{:?}", compression),
                    headers = format!("{:?}", headers_for_logging)
                );

                Arc::new(match self.channel {
                    Some(channel) => GrpcTransport::from_channel(channel, metadata, compression),
                    None => GrpcTransport::new(&endpoint, metadata, compression)?,
                })
            }
        };

        let service_name = self.service_name.unwrap_or_default();
        let node = node::node_with_start_time(&service_name, SystemTime::now());
        let resource = match &self.resource {
            Some(resource) => node::resource_from_sdk(resource),
            None => node::resource_from_env(),
        };

        Ok(OcAgentExporter::new(
            config,
            transport,
            node,
            resource,
            self.sampler.unwrap_or(Sampler::AlwaysOn),
        ))
    }
}

fn resolve_endpoint(provided_endpoint: Option<String>) -> String {
    provided_endpoint
        .or_else(|| env::var(OC_AGENT_ENDPOINT).ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| OC_AGENT_ENDPOINT_DEFAULT.to_string())
}

fn resolve_reconnection_period(provided: Option<Duration>) -> Duration {
    provided.unwrap_or_else(|| {
        match env::var(OC_AGENT_RECONNECTION_PERIOD)
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
        {
            Some(seconds) => Duration::from_secs(seconds),
            None => OC_AGENT_RECONNECTION_PERIOD_DEFAULT,
        }
    })
}

fn merge_metadata_with_headers_from_env(
    mut metadata: MetadataMap,
    headers_from_env: Vec<(AsciiMetadataKey, AsciiMetadataValue)>,
) -> MetadataMap {
    for (key, value) in headers_from_env {
        // configured entries win
        if !metadata.contains_key(&key) {
            metadata.insert(key, value);
        }
    }
    metadata
}

fn parse_headers_from_env() -> (Vec<(AsciiMetadataKey, AsciiMetadataValue)>, Vec<(String, String)>) {
    let mut headers = Vec::new();

    (
        env::var(OC_AGENT_HEADERS)
            .map(|input| {
                parse_header_string(&input)
                    .filter_map(|(key, value)| {
                        headers.push((key.to_owned(), value.to_owned()));
                        Some((
                            AsciiMetadataKey::from_bytes(key.as_bytes()).ok()?,
                            AsciiMetadataValue::try_from(value).ok()?,
                        ))
                    })
                    .collect()
            })
            .unwrap_or_default(),
        headers,
    )
}

fn parse_header_string(value: &str) -> impl Iterator<Item = (&str, &str)> {
    value
        .split_terminator(',')
        .map(str::trim)
        .filter_map(|key_value| {
            key_value
                .split_once('=')
                .map(|(key, value)| (key.trim(), value.trim()))
                .filter(|(key, value)| !key.is_empty() && !value.is_empty())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_env_test<T, F>(env_vars: T, f: F)
    where
        F: FnOnce(),
        T: Into<Vec<(&'static str, &'static str)>>,
    {
        temp_env::with_vars(
            env_vars
                .into()
                .iter()
                .map(|&(k, v)| (k, Some(v)))
                .collect::<Vec<(&'static str, Option<&'static str>)>>(),
            f,
        )
    }

    #[test]
    fn test_default_endpoint() {
        temp_env::with_var_unset(OC_AGENT_ENDPOINT, || {
            assert_eq!(resolve_endpoint(None), OC_AGENT_ENDPOINT_DEFAULT);
        });
    }

    #[test]
    fn test_endpoint_from_env_and_builder_precedence() {
        run_env_test(vec![(OC_AGENT_ENDPOINT, "http://agent:55678")], || {
            assert_eq!(resolve_endpoint(None), "http://agent:55678");
            assert_eq!(
                resolve_endpoint(Some("http://override:1234".to_string())),
                "http://override:1234"
            );
        });
    }

    #[test]
    fn test_reconnection_period() {
        temp_env::with_var_unset(OC_AGENT_RECONNECTION_PERIOD, || {
            assert_eq!(
                resolve_reconnection_period(None),
                OC_AGENT_RECONNECTION_PERIOD_DEFAULT
            );
        });
        run_env_test(vec![(OC_AGENT_RECONNECTION_PERIOD, "3")], || {
            assert_eq!(resolve_reconnection_period(None), Duration::from_secs(3));
            assert_eq!(
                resolve_reconnection_period(Some(Duration::from_millis(50))),
                Duration::from_millis(50)
            );
        });
        run_env_test(vec![(OC_AGENT_RECONNECTION_PERIOD, "soon")], || {
            assert_eq!(
                resolve_reconnection_period(None),
                OC_AGENT_RECONNECTION_PERIOD_DEFAULT
            );
        });
    }

    #[test]
    fn test_parse_header_string() {
        let headers: Vec<_> = parse_header_string("k1=v1, k2 = v2,bad,=novalue,empty=").collect();
        assert_eq!(headers, vec![("k1", "v1"), ("k2", "v2")]);
    }

    #[test]
    fn test_headers_from_env_merge_with_configured_metadata() {
        run_env_test(
            vec![(OC_AGENT_HEADERS, "k1=env,k2=v2,Bad Key=x")],
            || {
                let mut configured = MetadataMap::new();
                configured.insert("k1", "configured".parse().unwrap());

                let (from_env, for_logging) = parse_headers_from_env();
                assert_eq!(for_logging.len(), 3);
                assert_eq!(from_env.len(), 2);

                let merged = merge_metadata_with_headers_from_env(configured, from_env);
                assert_eq!(merged.get("k1").unwrap(), "configured");
                assert_eq!(merged.get("k2").unwrap(), "v2");
                assert_eq!(merged.len(), 2);
            },
        );
    }

    #[test]
    fn test_parse_compression() {
        assert_eq!("gzip".parse::<Compression>().unwrap(), Compression::Gzip);
        assert_eq!("zstd".parse::<Compression>().unwrap(), Compression::Zstd);
        assert!(matches!(
            "brotli".parse::<Compression>(),
            Err(ExporterBuildError::UnsupportedCompressionAlgorithm(name)) if name == "brotli"
        ));
    }

    #[test]
    fn test_build_rejects_invalid_settings() {
        let err = ExporterBuilder::default()
            .with_reconnection_period(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, ExporterBuildError::InvalidConfig { ref name, .. } if name == "reconnection_period"));

        let err = ExporterBuilder::default()
            .with_span_batch(0, Duration::from_secs(1))
            .build()
            .unwrap_err();
        assert!(matches!(err, ExporterBuildError::InvalidConfig { ref name, .. } if name == "span_batch"));

        let err = ExporterBuilder::default()
            .with_endpoint("not a uri")
            .build()
            .unwrap_err();
        assert!(matches!(err, ExporterBuildError::InvalidUri(..)));
    }

    #[cfg(not(feature = "gzip-tonic"))]
    #[test]
    fn test_compression_requires_feature() {
        let err = ExporterBuilder::default()
            .with_compression(Compression::Gzip)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            ExporterBuildError::FeatureRequiredForCompressionAlgorithm("gzip-tonic", Compression::Gzip)
        ));
    }
}
