//! The metric family registry: labeled children, TTL-based expiry, and a
//! scrape-time Prometheus text exposition. Families and their label sets are
//! declared at runtime from the loaded schema rather than hardcoded.

mod family;
mod registry;

pub use family::MetricKind;
pub use registry::Registry;

/// Standard Prometheus default histogram buckets, used when a histogram
/// type name appears in config but its bucket list is empty.
pub const DEFAULT_HISTOGRAM_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// Reserved metric family names, always present as Counter, Counter, Gauge
/// respectively.
pub const METRIC_PARSER_ERRORS: &str = "parser_errors";
pub const METRIC_LINES_PARSED: &str = "lines_parsed";
pub const METRIC_CONNECTED: &str = "connected";
