use std::time::Duration;

use thiserror::Error;

/// Errors returned by the exporter while it runs.
///
/// Network failures are normally absorbed into the connection state and only
/// logged; they reach callers through [`OcAgentExporter::last_connect_error`] or
/// through the synchronous [`OcAgentExporter::export_trace_service_request`].
///
/// [`OcAgentExporter::last_connect_error`]: crate::OcAgentExporter::last_connect_error
/// [`OcAgentExporter::export_trace_service_request`]: crate::OcAgentExporter::export_trace_service_request
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// `start` was called on an exporter that was already started.
    #[error("already started")]
    AlreadyStarted,

    /// `stop` was called on an exporter that was never started.
    #[error("not started")]
    NotStarted,

    /// The exporter has been stopped and accepts no more work.
    #[error("stopped")]
    Stopped,

    /// The agent ended a stream without an error status.
    #[error("stream closed by the agent")]
    StreamClosed,

    /// A stream failed with a gRPC status.
    #[error("rpc failed with status {code:?}: {message}")]
    Rpc {
        /// The gRPC status code.
        code: tonic::Code,
        /// The status message sent by the agent.
        message: String,
    },

    /// The channel to the agent could not be established.
    #[error("transport error: {0}")]
    Transport(String),

    /// There is no live connection and no failure has been recorded yet.
    #[error("no active connection to the agent")]
    NoConnection,

    /// There is no live connection; carries the error of the last attempt.
    #[error("no active connection, last connection error: {0}")]
    LastConnection(Box<Error>),

    /// A view snapshot was missing.
    #[error("expecting a non-nil view data")]
    NilViewData,

    /// A view snapshot had no view.
    #[error("expecting a non-nil view")]
    NilView,

    /// A view had no measure.
    #[error("expecting a non-nil measure")]
    NilMeasure,
}

impl Error {
    /// Whether the agent rejected the request as too large or over capacity.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self,
            Error::Rpc {
                code: tonic::Code::ResourceExhausted,
                ..
            }
        )
    }

    /// Whether this is the clean end-of-stream signal.
    pub fn is_stream_closed(&self) -> bool {
        matches!(self, Error::StreamClosed)
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Rpc {
            code: status.code(),
            message: status.message().to_string(),
        }
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(err: tonic::transport::Error) -> Self {
        Error::Transport(err.to_string())
    }
}

/// Errors that can occur while building an exporter.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExporterBuildError {
    /// Feature required to use the specified compression algorithm.
    #[cfg(any(not(feature = "gzip-tonic"), not(feature = "zstd-tonic")))]
    #[error("feature '{0}' is required to use the compression algorithm '{1}'")]
    FeatureRequiredForCompressionAlgorithm(&'static str, crate::Compression),

    /// Unsupported compression algorithm.
    #[error("unsupported compression algorithm '{0}'")]
    UnsupportedCompressionAlgorithm(String),

    /// Invalid URI.
    #[error("invalid URI {0}. Reason {1}")]
    InvalidUri(String, String),

    /// Invalid configuration.
    #[error("{name}: {reason}")]
    InvalidConfig {
        /// The configuration name.
        name: String,
        /// The reason the configuration is invalid.
        reason: String,
    },
}

impl ExporterBuildError {
    pub(crate) fn invalid_period(name: &str, period: Duration) -> Self {
        ExporterBuildError::InvalidConfig {
            name: name.to_string(),
            reason: format!("period must be greater than zero, got {:?}", period),
        }
    }
}
