use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use prometheus::Encoder;

use crate::error::RegistryError;
use crate::metrics::family::{Family, MetricKind};
use crate::metrics::{METRIC_CONNECTED, METRIC_LINES_PARSED, METRIC_PARSER_ERRORS};

/// Registry of metric families: families are declared at runtime (from the
/// loaded schema) rather than hardcoded, every family carries its own
/// TTL-sweepable children, and `snapshot_text` renders a complete exposition
/// via the real `prometheus::TextEncoder`.
pub struct Registry {
    prefix: String,
    default_ttl: Duration,
    prom_registry: prometheus::Registry,
    families: RwLock<HashMap<String, Arc<Family>>>,
}

impl Registry {
    /// Build a registry with the three reserved families (`parser_errors`,
    /// `lines_parsed` as Counters, `connected` as a TTL-exempt Gauge)
    /// already present.
    pub fn new(prefix: impl Into<String>, default_ttl: Duration) -> Result<Self, RegistryError> {
        let registry = Self {
            prefix: prefix.into(),
            default_ttl,
            prom_registry: prometheus::Registry::new(),
            families: RwLock::new(HashMap::new()),
        };
        let base_labels = vec!["environment".to_string(), "host".to_string()];
        registry.get_or_create_family(
            METRIC_PARSER_ERRORS,
            "Number of log lines that failed to parse",
            MetricKind::Counter,
            base_labels.clone(),
            None,
            false,
        )?;
        registry.get_or_create_family(
            METRIC_LINES_PARSED,
            "Number of log lines successfully parsed",
            MetricKind::Counter,
            base_labels.clone(),
            None,
            false,
        )?;
        registry.get_or_create_family(
            METRIC_CONNECTED,
            "Whether the worker currently has a live SSH tail session (1) or not (0)",
            MetricKind::Gauge,
            base_labels,
            None,
            true,
        )?;
        Ok(registry)
    }

    /// Idempotently register a metric family. Re-registering an existing
    /// name with a different [`MetricKind`] is a [`RegistryError`].
    pub fn get_or_create_family(
        &self,
        name: &str,
        help: &str,
        kind: MetricKind,
        mut label_names: Vec<String>,
        buckets: Option<Vec<f64>>,
        ttl_exempt: bool,
    ) -> Result<(), RegistryError> {
        label_names.sort();
        label_names.dedup();

        if let Some(existing) = self.families.read().get(name) {
            return if existing.kind == kind {
                Ok(())
            } else {
                Err(RegistryError::TypeMismatch {
                    name: name.to_string(),
                    existing: existing.kind,
                    requested: kind,
                })
            };
        }

        let full_name = format!("{}_{}", self.prefix, name);
        let family = match kind {
            MetricKind::Counter => {
                Family::new_counter(&full_name, help, label_names, ttl_exempt, &self.prom_registry)?
            }
            MetricKind::Gauge => {
                Family::new_gauge(&full_name, help, label_names, ttl_exempt, &self.prom_registry)?
            }
            MetricKind::Histogram => Family::new_histogram(
                &full_name,
                help,
                label_names,
                buckets.unwrap_or_else(|| crate::metrics::DEFAULT_HISTOGRAM_BUCKETS.to_vec()),
                ttl_exempt,
                &self.prom_registry,
            )?,
        };

        self.families
            .write()
            .insert(name.to_string(), Arc::new(family));
        Ok(())
    }

    /// Apply `value` to the child keyed by `labels` in family `name`, per
    /// the family's Add semantics. `name` must already be registered.
    pub fn add(&self, name: &str, labels: &HashMap<String, String>, value: f64) {
        let family = self.families.read().get(name).cloned();
        if let Some(family) = family {
            family.add(labels, value);
        } else {
            tracing::warn!(metric = name, "add() called for unregistered family");
        }
    }

    /// Convenience for the two-label reserved counters.
    pub fn inc_reserved_counter(&self, name: &str, environment: &str, host: &str) {
        let mut labels = HashMap::new();
        labels.insert("environment".to_string(), environment.to_string());
        labels.insert("host".to_string(), host.to_string());
        self.add(name, &labels, 1.0);
    }

    /// Set the `connected` gauge for one target.
    pub fn set_connected(&self, environment: &str, host: &str, value: f64) {
        let mut labels = HashMap::new();
        labels.insert("environment".to_string(), environment.to_string());
        labels.insert("host".to_string(), host.to_string());
        self.add(METRIC_CONNECTED, &labels, value);
    }

    /// Remove every child whose last update is older than `now - ttl`,
    /// except in TTL-exempt families.
    pub fn sweep(&self, now: Instant) {
        for family in self.families.read().values() {
            family.sweep(now, self.default_ttl);
        }
    }

    /// Render a complete Prometheus text-format exposition of all families
    /// and children.
    pub fn snapshot_text(&self) -> Result<Vec<u8>, prometheus::Error> {
        let metric_families = self.prom_registry.gather();
        let mut out = Vec::with_capacity(1024 * 16);
        let encoder = prometheus::TextEncoder::new();
        encoder.encode(&metric_families, &mut out)?;
        Ok(out)
    }

    #[cfg(test)]
    pub(crate) fn family_child_count(&self, name: &str) -> usize {
        self.families.read().get(name).map_or(0, |f| f.child_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn reserved_families_present_on_construction() {
        let registry = Registry::new("test", Duration::from_secs(60)).unwrap();
        let text = String::from_utf8(registry.snapshot_text().unwrap()).unwrap();
        assert!(text.contains("test_parser_errors"));
        assert!(text.contains("test_lines_parsed"));
        assert!(text.contains("test_connected"));
    }

    #[test]
    fn reregistering_same_kind_is_idempotent() {
        let registry = Registry::new("test", Duration::from_secs(60)).unwrap();
        registry
            .get_or_create_family(
                "bytes",
                "help",
                MetricKind::Counter,
                vec!["environment".into(), "host".into(), "ip".into()],
                None,
                false,
            )
            .unwrap();
        registry
            .get_or_create_family(
                "bytes",
                "help",
                MetricKind::Counter,
                vec!["environment".into(), "host".into(), "ip".into()],
                None,
                false,
            )
            .unwrap();
    }

    #[test]
    fn reregistering_different_kind_is_an_error() {
        let registry = Registry::new("test", Duration::from_secs(60)).unwrap();
        registry
            .get_or_create_family(
                "bytes",
                "help",
                MetricKind::Counter,
                vec!["environment".into(), "host".into()],
                None,
                false,
            )
            .unwrap();
        let err = registry
            .get_or_create_family(
                "bytes",
                "help",
                MetricKind::Gauge,
                vec!["environment".into(), "host".into()],
                None,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::TypeMismatch { .. }));
    }

    #[test]
    fn counter_add_is_monotonic_and_visible_in_snapshot() {
        let registry = Registry::new("test", Duration::from_secs(60)).unwrap();
        registry
            .get_or_create_family(
                "bytes",
                "help",
                MetricKind::Counter,
                vec!["environment".into(), "host".into(), "ip".into()],
                None,
                false,
            )
            .unwrap();
        let l = labels(&[("environment", "prod"), ("host", "h1"), ("ip", "10.0.0.1")]);
        registry.add("bytes", &l, 512.0);
        let text = String::from_utf8(registry.snapshot_text().unwrap()).unwrap();
        assert!(text.contains("test_bytes"));
        assert!(text.contains("512"));
    }

    #[test]
    fn ttl_sweep_removes_stale_children() {
        let registry = Registry::new("test", Duration::from_millis(1)).unwrap();
        registry
            .get_or_create_family(
                "bytes",
                "help",
                MetricKind::Counter,
                vec!["environment".into(), "host".into()],
                None,
                false,
            )
            .unwrap();
        let l = labels(&[("environment", "prod"), ("host", "h1")]);
        registry.add("bytes", &l, 1.0);
        assert_eq!(registry.family_child_count("bytes"), 1);
        std::thread::sleep(Duration::from_millis(5));
        registry.sweep(Instant::now());
        assert_eq!(registry.family_child_count("bytes"), 0);
    }

    #[test]
    fn ttl_exempt_family_survives_sweep() {
        let registry = Registry::new("test", Duration::from_millis(1)).unwrap();
        registry.set_connected("prod", "h1", 0.0);
        std::thread::sleep(Duration::from_millis(5));
        registry.sweep(Instant::now());
        assert_eq!(registry.family_child_count(METRIC_CONNECTED), 1);
    }
}
