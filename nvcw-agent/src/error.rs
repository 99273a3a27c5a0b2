//! Error taxonomy for the sampling-and-publishing pipeline
//!
//! - `HardwareError`: raised by a hardware source (NVML or a stub)
//! - `DeviceError`: what the device reader reports to its callers
//! - `SinkError` / `PublishError`: metrics backend failures
//! - `ConfigError`: invalid startup configuration, fatal before the loop starts

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a hardware source
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HardwareError {
    #[error("monitoring subsystem unavailable: {0}")]
    Unavailable(String),

    #[error("{field} query failed: {message}")]
    Query { field: &'static str, message: String },
}

impl HardwareError {
    pub fn query(field: &'static str, message: impl fmt::Display) -> Self {
        HardwareError::Query { field, message: message.to_string() }
    }
}

/// Why a single device could not produce a snapshot
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryCause {
    #[error("{field} query failed: {message}")]
    Field { field: &'static str, message: String },

    #[error("{field} is not positive, percentage is undefined")]
    ZeroDenominator { field: &'static str },
}

/// Device reader errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
    #[error("hardware monitoring unavailable: {0}")]
    HardwareUnavailable(String),

    #[error("device {index}: {cause}")]
    DeviceQueryFailed { index: u32, cause: QueryCause },
}

impl DeviceError {
    /// Wrap a source error raised while reading device `index`
    pub fn query_failed(index: u32, err: HardwareError) -> Self {
        let cause = match err {
            HardwareError::Query { field, message } => QueryCause::Field { field, message },
            HardwareError::Unavailable(message) => QueryCause::Field { field: "device", message },
        };
        DeviceError::DeviceQueryFailed { index, cause }
    }

    pub fn zero_denominator(index: u32, field: &'static str) -> Self {
        DeviceError::DeviceQueryFailed {
            index,
            cause: QueryCause::ZeroDenominator { field },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeviceError::HardwareUnavailable(_) => "hardware_unavailable",
            DeviceError::DeviceQueryFailed { .. } => "device_query_failed",
        }
    }
}

/// Sink failure classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkErrorKind {
    /// No answer within the request timeout
    Timeout,
    /// Connection refused, reset, DNS...
    Transport,
    /// Backend-side failure (5xx equivalent)
    Unavailable,
    /// Backend asked us to slow down
    Throttled,
    /// Point or payload rejected as invalid
    Malformed,
    /// Credentials missing or refused
    Unauthorized,
}

impl SinkErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            SinkErrorKind::Timeout
                | SinkErrorKind::Transport
                | SinkErrorKind::Unavailable
                | SinkErrorKind::Throttled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SinkErrorKind::Timeout => "timeout",
            SinkErrorKind::Transport => "transport",
            SinkErrorKind::Unavailable => "unavailable",
            SinkErrorKind::Throttled => "throttled",
            SinkErrorKind::Malformed => "malformed",
            SinkErrorKind::Unauthorized => "unauthorized",
        }
    }
}

impl fmt::Display for SinkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a metrics sink, for a whole request or a single point
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct SinkError {
    pub kind: SinkErrorKind,
    pub message: String,
}

impl SinkError {
    pub fn new(kind: SinkErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Publishing failed as a whole (nothing was accepted)
#[derive(Debug, Clone, PartialEq, Error)]
#[error("publish failed ({kind}, retryable: {retryable}, {failed_points} points lost): {cause}")]
pub struct PublishError {
    pub retryable: bool,
    pub kind: SinkErrorKind,
    pub cause: String,
    /// Every point of the call, including ones failed before any request
    pub failed_points: usize,
}

impl From<SinkError> for PublishError {
    fn from(err: SinkError) -> Self {
        Self {
            retryable: err.is_retryable(),
            kind: err.kind,
            cause: err.message,
            failed_points: 0,
        }
    }
}

/// Invalid startup configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("publish interval must be a positive number of seconds, got {0}")]
    InvalidInterval(i64),

    #[error("host label is empty and the hostname could not be detected")]
    EmptyHost,

    #[error("namespace must not be empty")]
    EmptyNamespace,

    #[error("{field} must be greater than zero")]
    InvalidLimit { field: &'static str },

    #[error("invalid value for {name}: {value:?}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("http sink requires `sink.http.endpoint`")]
    MissingEndpoint,

    #[error("cannot build sink: {0}")]
    InvalidSink(String),

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
