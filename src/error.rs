//! Error taxonomy for the exporter.
//!
//! Kinds mirror the propagation policy: [`ConfigError`] and [`RegistryError`]
//! are fatal and terminate the process from `main`; [`ParseError`] and
//! [`TransportError`] are recovered per-line / per-worker and are only
//! observable through the `parser_errors` and `connected` series plus logs.

use thiserror::Error;

/// Fatal at startup: malformed config, unknown column kind, reserved-name
/// misuse, unknown histogram reference, or a schema entry with more than one
/// key.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config from {path}: {source}")]
    Load {
        path: String,
        #[source]
        source: config::ConfigError,
    },

    #[error("failed to parse config: {0}")]
    Deserialize(#[from] serde_path_to_error::Error<config::ConfigError>),

    #[error("unknown column kind `{0}`")]
    UnknownKind(String),

    #[error("format entry for column `{0}` must have exactly one key")]
    MultiKeyFormatEntry(String),

    #[error("label name `{0}` is reserved and may not appear in the format")]
    ReservedLabelName(String),

    #[error("metric name `{0}` is reserved and may not be used by a schema column")]
    ReservedMetricName(String),

    #[error("column `{0}` references unknown histogram `{1}`")]
    UnknownHistogram(String, String),

    #[error("column `{0}` combines `label` with a histogram, which is not allowed")]
    LabelWithHistogram(String),

    #[error("histogram `{0}` bucket bounds must be strictly increasing")]
    NonIncreasingBuckets(String),

    #[error("no ssh defaults or per-environment override provided for `{0}` in environment `{1}`")]
    MissingField(String, String),

    #[error("failed to parse inventory script output: {0}")]
    ScriptOutput(#[source] serde_yaml::Error),
}

/// Per-line, recovered: too few tokens, numeric parse failure, or a
/// malformed quoted group. Counted in `parser_errors`, never fatal.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("line has fewer tokens than the schema expects")]
    TooFewTokens,

    #[error("failed to parse `{token}` as a number for column `{column}`")]
    BadNumber { column: String, token: String },

    #[error("number for column `{column}` is not finite: {token}")]
    NonFiniteNumber { column: String, token: String },

    #[error("unterminated quoted group starting at `{0}`")]
    UnterminatedQuote(String),

    #[error("malformed request header group `{0}`")]
    MalformedRequestHeader(String),

    #[error("malformed CLF date group `{0}`")]
    MalformedClfDate(String),

    #[error("negative value {value} is not valid for counter/histogram column `{column}`")]
    NegativeValue { column: String, value: f64 },
}

/// Per-worker, recovered: SSH connect or read failure. Transitions the
/// worker to `Disconnected`, bumps backoff, leaves `connected=0`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: eyre::Report,
    },

    #[error("failed to authenticate to {host} as {user}")]
    Authentication { host: String, user: String },

    #[error("failed to open tail channel on {host}: {source}")]
    Channel {
        host: String,
        #[source]
        source: eyre::Report,
    },

    #[error("ssh stream to {host} ended: {reason}")]
    StreamEnded { host: String, reason: String },
}

/// Programmer error: re-registering a metric family under a different type.
/// Always fatal.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("metric family `{name}` already registered as {existing:?}, cannot re-register as {requested:?}")]
    TypeMismatch {
        name: String,
        existing: crate::metrics::MetricKind,
        requested: crate::metrics::MetricKind,
    },

    #[error("reserved metric name `{0}` cannot be registered by schema config")]
    ReservedName(String),

    #[error("prometheus registration failed for `{name}`: {source}")]
    Prometheus {
        name: String,
        #[source]
        source: prometheus::Error,
    },
}
