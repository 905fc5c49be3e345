//! YAML configuration schema and loader.
//!
//! A `config::Config` object is built from a single YAML file source and
//! deserialized through `serde_path_to_error` so that a malformed field
//! reports its exact path rather than a generic message.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::metrics::DEFAULT_HISTOGRAM_BUCKETS;
use crate::parser::ColumnReader;

/// Reserved label name: every emitted child carries this label with the
/// value of its owning worker's environment. No schema column may use it.
pub const RESERVED_LABEL_ENVIRONMENT: &str = "environment";

/// Reserved metric family names, always present regardless of schema.
pub const RESERVED_METRIC_NAMES: &[&str] = &["parser_errors", "lines_parsed", "connected"];

/// Top-level configuration, as loaded from `$SCRAPECONFIG`.
#[derive(Debug, Clone)]
pub struct Config {
    pub global: GlobalConfig,
    pub ssh: SshConfig,
    pub script: Option<String>,
    pub reload_interval: Option<u64>,
}

/// The `global` section: TTL, metric name prefix, histogram definitions, and
/// the ordered column format.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    pub ttl_secs: u64,
    pub prefix: String,
    pub histograms: HashMap<String, Vec<f64>>,
    /// Resolved, ordered schema: `None` entries are `null` (skip one token).
    pub format: Vec<Option<ColumnSpec>>,
}

/// One resolved, validated schema column.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: String,
    pub reader: ColumnReader,
}

/// The `ssh` section: defaults plus per-environment overrides.
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    pub file: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub pkey: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub environments: HashMap<String, EnvironmentConfig>,
}

/// One `ssh.environments.<name>` entry.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentConfig {
    pub hosts: Vec<String>,
    pub file: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub pkey: Option<String>,
    pub connect_timeout_secs: Option<u64>,
}

/// Fully resolved per-target connection parameters, after applying
/// per-environment overrides over the ssh-level defaults.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub environment: String,
    pub host: String,
    pub file: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub pkey: Option<String>,
    pub connect_timeout_secs: u64,
}

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Shared by `static_targets` and `resolve_script_targets`: expand each
/// environment's host list into a target, applying per-environment overrides
/// over `ssh`-level defaults.
fn resolve_targets(
    environments: &HashMap<String, EnvironmentConfig>,
    defaults: &SshConfig,
) -> Vec<ResolvedTarget> {
    environments
        .iter()
        .flat_map(|(env_name, env)| {
            env.hosts.iter().map(move |host| ResolvedTarget {
                environment: env_name.clone(),
                host: host.clone(),
                file: env.file.clone().or_else(|| defaults.file.clone()),
                user: env.user.clone().or_else(|| defaults.user.clone()),
                password: env.password.clone().or_else(|| defaults.password.clone()),
                pkey: env.pkey.clone().or_else(|| defaults.pkey.clone()),
                connect_timeout_secs: env
                    .connect_timeout_secs
                    .or(defaults.connect_timeout_secs)
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
            })
        })
        .collect()
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml));
        let built = builder
            .build()
            .map_err(|source| ConfigError::Load {
                path: path.display().to_string(),
                source,
            })?;
        let raw: RawConfig = serde_path_to_error::deserialize(built)?;
        raw.validate()
    }

    /// Resolve the full set of `(environment, host)` targets described by
    /// the static `ssh.environments` inventory, applying per-environment
    /// overrides over the `ssh`-level defaults.
    pub fn static_targets(&self) -> Vec<ResolvedTarget> {
        resolve_targets(&self.ssh.environments, &self.ssh)
    }

    /// Parse the YAML an inventory `script` prints to stdout — the same
    /// `environments:` shape as the static config's `ssh` section — and
    /// resolve it into targets the same way `static_targets` resolves the
    /// file's own inventory, falling back to this config's `ssh`-level
    /// defaults for any field the script output leaves unset.
    pub fn resolve_script_targets(&self, yaml: &str) -> Result<Vec<ResolvedTarget>, ConfigError> {
        let parsed: RawScriptOutput = serde_yaml::from_str(yaml).map_err(ConfigError::ScriptOutput)?;
        Ok(resolve_targets(&convert_environments(parsed.environments), &self.ssh))
    }

    /// The full, sorted label-name set shared by every schema-declared
    /// metric family: the reserved base labels (`environment`, `host`) plus
    /// any `label` columns plus, if the schema declares a `request`/
    /// `request_header` column, the three `request_*` labels it emits.
    ///
    /// All schema-driven families share this set because every line
    /// populates it regardless of which column wrote the value being added.
    pub fn schema_label_names(&self) -> Vec<String> {
        let mut names = vec![RESERVED_LABEL_ENVIRONMENT.to_string(), "host".to_string()];
        for col in self.global.format.iter().flatten() {
            match &col.reader {
                ColumnReader::Label { name } => names.push(name.clone()),
                ColumnReader::RequestHeader => {
                    names.push("request_method".to_string());
                    names.push("request_path".to_string());
                    names.push("request_protocol".to_string());
                }
                _ => {}
            }
        }
        names.sort();
        names.dedup();
        names
    }

    /// The metric families the schema requires, beyond the three reserved
    /// ones the registry always carries.
    pub fn metric_families(&self) -> Vec<FamilyDecl> {
        let mut decls = Vec::new();
        for col in self.global.format.iter().flatten() {
            match &col.reader {
                ColumnReader::Number { metric } | ColumnReader::ClfNumber { metric } => {
                    decls.push(FamilyDecl {
                        name: metric.clone(),
                        kind: crate::metrics::MetricKind::Counter,
                        buckets: None,
                    });
                }
                ColumnReader::NumberHistogram { metric, histogram }
                | ColumnReader::ClfNumberHistogram { metric, histogram } => {
                    let buckets = self
                        .global
                        .histograms
                        .get(histogram)
                        .cloned()
                        .filter(|b| !b.is_empty())
                        .unwrap_or_else(|| DEFAULT_HISTOGRAM_BUCKETS.to_vec());
                    decls.push(FamilyDecl {
                        name: metric.clone(),
                        kind: crate::metrics::MetricKind::Histogram,
                        buckets: Some(buckets),
                    });
                }
                ColumnReader::Label { .. }
                | ColumnReader::RequestHeader
                | ColumnReader::ClfDate => {}
            }
        }
        decls
    }
}

/// One metric family the schema requires the registry to create.
#[derive(Debug, Clone)]
pub struct FamilyDecl {
    pub name: String,
    pub kind: crate::metrics::MetricKind,
    pub buckets: Option<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    global: RawGlobalConfig,
    #[serde(default)]
    ssh: RawSshConfig,
    #[serde(default)]
    script: Option<String>,
    #[serde(default)]
    reload_interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawGlobalConfig {
    ttl: u64,
    prefix: String,
    #[serde(default)]
    histograms: HashMap<String, Vec<f64>>,
    format: Vec<Option<HashMap<String, String>>>,
}

#[derive(Debug, Deserialize, Default)]
struct RawSshConfig {
    file: Option<String>,
    user: Option<String>,
    password: Option<String>,
    pkey: Option<String>,
    connect_timeout: Option<u64>,
    #[serde(default)]
    environments: HashMap<String, RawEnvironmentConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct RawEnvironmentConfig {
    #[serde(default)]
    hosts: Vec<String>,
    file: Option<String>,
    user: Option<String>,
    password: Option<String>,
    pkey: Option<String>,
    connect_timeout: Option<u64>,
}

/// The shape an inventory script is expected to print on stdout: just the
/// `environments:` map, reusing the static config's per-environment schema.
#[derive(Debug, Deserialize, Default)]
struct RawScriptOutput {
    #[serde(default)]
    environments: HashMap<String, RawEnvironmentConfig>,
}

fn convert_environments(raw: HashMap<String, RawEnvironmentConfig>) -> HashMap<String, EnvironmentConfig> {
    raw.into_iter()
        .map(|(name, env)| {
            (
                name,
                EnvironmentConfig {
                    hosts: env.hosts,
                    file: env.file,
                    user: env.user,
                    password: env.password,
                    pkey: env.pkey,
                    connect_timeout_secs: env.connect_timeout,
                },
            )
        })
        .collect()
}

impl RawConfig {
    fn validate(self) -> Result<Config, ConfigError> {
        let format = self
            .global
            .format
            .into_iter()
            .map(|entry| validate_column(entry, &self.global.histograms))
            .collect::<Result<Vec<_>, _>>()?;

        let global = GlobalConfig {
            ttl_secs: self.global.ttl,
            prefix: self.global.prefix,
            histograms: self.global.histograms,
            format,
        };

        let ssh = SshConfig {
            file: self.ssh.file,
            user: self.ssh.user,
            password: self.ssh.password,
            pkey: self.ssh.pkey,
            connect_timeout_secs: self.ssh.connect_timeout,
            environments: convert_environments(self.ssh.environments),
        };

        Ok(Config {
            global,
            ssh,
            script: self.script,
            reload_interval: self.reload_interval,
        })
    }
}

fn validate_column(
    entry: Option<HashMap<String, String>>,
    histograms: &HashMap<String, Vec<f64>>,
) -> Result<Option<ColumnSpec>, ConfigError> {
    let Some(entry) = entry else {
        return Ok(None);
    };

    if entry.len() != 1 {
        let name = entry.keys().next().cloned().unwrap_or_default();
        return Err(ConfigError::MultiKeyFormatEntry(name));
    }
    let (name, type_expr) = entry.into_iter().next().expect("checked len == 1");

    if RESERVED_METRIC_NAMES.contains(&name.as_str()) {
        return Err(ConfigError::ReservedMetricName(name));
    }

    let (kind, histogram_name) = match type_expr.split_once('+') {
        Some((kind, hist)) => (kind.trim(), Some(hist.trim().to_string())),
        None => (type_expr.trim(), None),
    };

    let reader = match kind {
        "number" => ColumnReader::Number { metric: name.clone() },
        "clf_number" => ColumnReader::ClfNumber { metric: name.clone() },
        "label" => {
            if name == RESERVED_LABEL_ENVIRONMENT {
                return Err(ConfigError::ReservedLabelName(name));
            }
            if histogram_name.is_some() {
                return Err(ConfigError::LabelWithHistogram(name));
            }
            ColumnReader::Label { name: name.clone() }
        }
        "request_header" | "request" => ColumnReader::RequestHeader,
        "clf_date" => ColumnReader::ClfDate,
        other => return Err(ConfigError::UnknownKind(other.to_string())),
    };

    if let Some(hist_name) = &histogram_name {
        let buckets = histograms.get(hist_name).cloned().unwrap_or_default();
        if buckets.is_empty() && !histograms.contains_key(hist_name) {
            return Err(ConfigError::UnknownHistogram(name, hist_name.clone()));
        }
        let effective = if buckets.is_empty() {
            DEFAULT_HISTOGRAM_BUCKETS.to_vec()
        } else {
            buckets
        };
        ensure_increasing(hist_name, &effective)?;
    }

    let reader = match (reader, histogram_name) {
        (ColumnReader::Number { metric }, Some(hist)) => ColumnReader::NumberHistogram {
            metric,
            histogram: hist,
        },
        (ColumnReader::ClfNumber { metric }, Some(hist)) => ColumnReader::ClfNumberHistogram {
            metric,
            histogram: hist,
        },
        (other, None) => other,
        (_, Some(_)) => unreachable!("only number/clf_number may combine with a histogram"),
    };

    Ok(Some(ColumnSpec { name, reader }))
}

fn ensure_increasing(name: &str, buckets: &[f64]) -> Result<(), ConfigError> {
    if buckets.windows(2).all(|w| w[0] < w[1]) {
        Ok(())
    } else {
        Err(ConfigError::NonIncreasingBuckets(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn histograms() -> HashMap<String, Vec<f64>> {
        HashMap::new()
    }

    #[test]
    fn null_entry_is_a_skip() {
        assert!(validate_column(None, &histograms()).unwrap().is_none());
    }

    #[test]
    fn rejects_multi_key_entry() {
        let mut m = HashMap::new();
        m.insert("a".to_string(), "label".to_string());
        m.insert("b".to_string(), "label".to_string());
        let err = validate_column(Some(m), &histograms()).unwrap_err();
        assert!(matches!(err, ConfigError::MultiKeyFormatEntry(_)));
    }

    #[test]
    fn rejects_reserved_label_environment() {
        let mut m = HashMap::new();
        m.insert(RESERVED_LABEL_ENVIRONMENT.to_string(), "label".to_string());
        let err = validate_column(Some(m), &histograms()).unwrap_err();
        assert!(matches!(err, ConfigError::ReservedLabelName(_)));
    }

    #[test]
    fn rejects_reserved_metric_name() {
        let mut m = HashMap::new();
        m.insert("connected".to_string(), "number".to_string());
        let err = validate_column(Some(m), &histograms()).unwrap_err();
        assert!(matches!(err, ConfigError::ReservedMetricName(_)));
    }

    #[test]
    fn rejects_unknown_kind() {
        let mut m = HashMap::new();
        m.insert("foo".to_string(), "bogus".to_string());
        let err = validate_column(Some(m), &histograms()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKind(_)));
    }

    #[test]
    fn rejects_label_with_histogram() {
        let mut m = HashMap::new();
        m.insert("foo".to_string(), "label+default".to_string());
        let err = validate_column(Some(m), &histograms()).unwrap_err();
        assert!(matches!(err, ConfigError::LabelWithHistogram(_)));
    }

    #[test]
    fn accepts_number_plus_known_histogram() {
        let mut hists = histograms();
        hists.insert("default".to_string(), vec![0.1, 0.5, 1.0]);
        let mut m = HashMap::new();
        m.insert("rt".to_string(), "number+default".to_string());
        let spec = validate_column(Some(m), &hists).unwrap().unwrap();
        assert_eq!(spec.name, "rt");
        assert!(matches!(
            spec.reader,
            ColumnReader::NumberHistogram { .. }
        ));
    }

    #[test]
    fn rejects_unknown_histogram_reference() {
        let mut m = HashMap::new();
        m.insert("rt".to_string(), "number+missing".to_string());
        let err = validate_column(Some(m), &histograms()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownHistogram(_, _)));
    }

    #[test]
    fn resolves_static_targets_with_overrides() {
        let mut environments = HashMap::new();
        environments.insert(
            "prod".to_string(),
            EnvironmentConfig {
                hosts: vec!["h1".to_string(), "h2".to_string()],
                file: Some("/var/log/custom.log".to_string()),
                user: None,
                password: None,
                pkey: None,
                connect_timeout_secs: None,
            },
        );
        let cfg = Config {
            global: GlobalConfig {
                ttl_secs: 60,
                prefix: "p".to_string(),
                histograms: HashMap::new(),
                format: vec![],
            },
            ssh: SshConfig {
                file: Some("/var/log/default.log".to_string()),
                user: Some("scraper".to_string()),
                password: None,
                pkey: None,
                connect_timeout_secs: None,
                environments,
            },
            script: None,
            reload_interval: None,
        };
        let targets = cfg.static_targets();
        assert_eq!(targets.len(), 2);
        for t in &targets {
            assert_eq!(t.file.as_deref(), Some("/var/log/custom.log"));
            assert_eq!(t.user.as_deref(), Some("scraper"));
            assert_eq!(t.connect_timeout_secs, DEFAULT_CONNECT_TIMEOUT_SECS);
        }
    }
}
