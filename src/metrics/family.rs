use std::collections::HashMap;
use std::time::Instant;

use parking_lot::RwLock;
use prometheus::{CounterVec, GaugeVec, HistogramVec};

use crate::error::RegistryError;

/// The type of a metric family. Fixed for the family's lifetime; a second
/// `get_or_create_family` call with a different kind is a [`RegistryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
}

enum Vec_ {
    Counter(CounterVec),
    Gauge(GaugeVec),
    Histogram(HistogramVec),
}

/// A metric family: the prometheus vector backing it, the label names every
/// child is keyed by (in a fixed, sorted order), and the last-update
/// timestamps used for TTL sweeping.
pub(crate) struct Family {
    pub(crate) kind: MetricKind,
    pub(crate) ttl_exempt: bool,
    pub(crate) label_names: Vec<String>,
    vec: Vec_,
    last_update: RwLock<HashMap<Vec<String>, Instant>>,
}

impl Family {
    pub(crate) fn new_counter(
        name: &str,
        help: &str,
        label_names: Vec<String>,
        ttl_exempt: bool,
        registry: &prometheus::Registry,
    ) -> Result<Self, RegistryError> {
        let names: Vec<&str> = label_names.iter().map(String::as_str).collect();
        let vec = CounterVec::new(prometheus::Opts::new(name, help), &names)
            .map_err(|source| RegistryError::Prometheus {
                name: name.to_string(),
                source,
            })?;
        registry
            .register(Box::new(vec.clone()))
            .map_err(|source| RegistryError::Prometheus {
                name: name.to_string(),
                source,
            })?;
        Ok(Self {
            kind: MetricKind::Counter,
            ttl_exempt,
            label_names,
            vec: Vec_::Counter(vec),
            last_update: RwLock::new(HashMap::new()),
        })
    }

    pub(crate) fn new_gauge(
        name: &str,
        help: &str,
        label_names: Vec<String>,
        ttl_exempt: bool,
        registry: &prometheus::Registry,
    ) -> Result<Self, RegistryError> {
        let names: Vec<&str> = label_names.iter().map(String::as_str).collect();
        let vec = GaugeVec::new(prometheus::Opts::new(name, help), &names)
            .map_err(|source| RegistryError::Prometheus {
                name: name.to_string(),
                source,
            })?;
        registry
            .register(Box::new(vec.clone()))
            .map_err(|source| RegistryError::Prometheus {
                name: name.to_string(),
                source,
            })?;
        Ok(Self {
            kind: MetricKind::Gauge,
            ttl_exempt,
            label_names,
            vec: Vec_::Gauge(vec),
            last_update: RwLock::new(HashMap::new()),
        })
    }

    pub(crate) fn new_histogram(
        name: &str,
        help: &str,
        label_names: Vec<String>,
        buckets: Vec<f64>,
        ttl_exempt: bool,
        registry: &prometheus::Registry,
    ) -> Result<Self, RegistryError> {
        let names: Vec<&str> = label_names.iter().map(String::as_str).collect();
        let vec = HistogramVec::new(
            prometheus::HistogramOpts::new(name, help).buckets(buckets),
            &names,
        )
        .map_err(|source| RegistryError::Prometheus {
            name: name.to_string(),
            source,
        })?;
        registry
            .register(Box::new(vec.clone()))
            .map_err(|source| RegistryError::Prometheus {
                name: name.to_string(),
                source,
            })?;
        Ok(Self {
            kind: MetricKind::Histogram,
            ttl_exempt,
            label_names,
            vec: Vec_::Histogram(vec),
            last_update: RwLock::new(HashMap::new()),
        })
    }

    /// Look up the ordered label values for this family from a `name ->
    /// value` map, defaulting any missing label to the empty string.
    fn ordered_values(&self, labels: &HashMap<String, String>) -> Vec<String> {
        self.label_names
            .iter()
            .map(|name| labels.get(name).cloned().unwrap_or_default())
            .collect()
    }

    /// Apply one value to the child keyed by `labels`, per the kind's Add
    /// semantics (Counter: increment, Gauge: set, Histogram: observe+count).
    pub(crate) fn add(&self, labels: &HashMap<String, String>, value: f64) {
        let values = self.ordered_values(labels);
        let refs: Vec<&str> = values.iter().map(String::as_str).collect();
        match &self.vec {
            Vec_::Counter(v) => v.with_label_values(&refs).inc_by(value),
            Vec_::Gauge(v) => v.with_label_values(&refs).set(value),
            Vec_::Histogram(v) => v.with_label_values(&refs).observe(value),
        }
        self.last_update.write().insert(values, Instant::now());
    }

    /// Remove every child whose last update predates `now - ttl`. No-op for
    /// TTL-exempt families.
    pub(crate) fn sweep(&self, now: Instant, ttl: std::time::Duration) {
        if self.ttl_exempt {
            return;
        }
        let mut expired = Vec::new();
        {
            let map = self.last_update.read();
            for (values, last) in map.iter() {
                if now.saturating_duration_since(*last) > ttl {
                    expired.push(values.clone());
                }
            }
        }
        if expired.is_empty() {
            return;
        }
        let mut map = self.last_update.write();
        for values in expired {
            let refs: Vec<&str> = values.iter().map(String::as_str).collect();
            match &self.vec {
                Vec_::Counter(v) => {
                    let _ = v.remove_label_values(&refs);
                }
                Vec_::Gauge(v) => {
                    let _ = v.remove_label_values(&refs);
                }
                Vec_::Histogram(v) => {
                    let _ = v.remove_label_values(&refs);
                }
            }
            map.remove(&values);
        }
    }

    #[cfg(test)]
    pub(crate) fn child_count(&self) -> usize {
        self.last_update.read().len()
    }
}
