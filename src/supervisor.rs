//! Reconciles the desired target set against the live set of
//! [`SshLogScraper`] workers.
//!
//! The desired set is the static `ssh.environments` inventory in the config
//! file, unioned with the output of an optional inventory `script`
//! re-invoked every `reload_interval` seconds (or once, if unset). Each
//! worker is tracked in a `target_id -> (CancellationToken, JoinHandle)` map
//! rather than joined eagerly, since the target set can grow and shrink at
//! runtime as hosts enter or leave the inventory.

use std::collections::{HashMap, HashSet};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::config::{Config, ResolvedTarget};
use crate::metrics::Registry;
use crate::parser::LineParser;
use crate::scraper::SshLogScraper;

struct LiveWorker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns the live worker set and drives reconciliation for the lifetime of
/// the process.
pub struct Supervisor {
    config: Config,
    registry: Arc<Registry>,
    live: HashMap<String, LiveWorker>,
}

impl Supervisor {
    pub fn new(config: Config, registry: Arc<Registry>) -> Self {
        Self {
            config,
            registry,
            live: HashMap::new(),
        }
    }

    /// Register every schema-declared metric family, reconcile the static
    /// inventory, then (if a `script` is configured) repeatedly re-invoke it
    /// and reconcile against the union of the static inventory and its
    /// output — the static inventory never drops out of the desired set just
    /// because a script is also configured. Runs until `cancel` fires, at
    /// which point every live worker is cancelled and awaited before
    /// returning.
    #[instrument(name = "supervisor", skip_all)]
    pub async fn run(mut self, cancel: CancellationToken) -> eyre::Result<()> {
        for decl in self.config.metric_families() {
            self.registry.get_or_create_family(
                &decl.name,
                "schema-declared metric",
                decl.kind,
                self.config.schema_label_names(),
                decl.buckets.clone(),
                false,
            )?;
        }

        let static_targets = self.config.static_targets();
        self.reconcile(static_targets.clone());

        if let Some(script) = self.config.script.clone() {
            loop {
                match run_inventory_script(&script).await {
                    Ok(stdout) => match self.config.resolve_script_targets(&stdout) {
                        Ok(script_targets) => {
                            let mut desired = static_targets.clone();
                            desired.extend(script_targets);
                            self.reconcile(desired);
                        }
                        Err(err) => warn!(error = %err, "inventory script produced invalid output"),
                    },
                    Err(err) => warn!(error = %err, "inventory script failed"),
                }

                let Some(secs) = self.config.reload_interval else {
                    // No reload_interval configured: invoke the script once
                    // and stop re-invoking it. The workers this pass started
                    // keep running; only the periodic re-invocation stops.
                    break;
                };
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }

        cancel.cancelled().await;
        self.shutdown().await;
        Ok(())
    }

    /// Start workers for targets not yet live; cancel live workers absent
    /// from `desired`. Reconciling against an unchanged desired set starts
    /// or cancels nothing.
    fn reconcile(&mut self, desired: Vec<ResolvedTarget>) {
        let desired_ids: HashSet<String> = desired.iter().map(target_id).collect();

        for target in &desired {
            let id = target_id(target);
            if !self.live.contains_key(&id) {
                self.start_worker(id, target);
            }
        }

        let stale: Vec<String> = self
            .live
            .keys()
            .filter(|id| !desired_ids.contains(*id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(worker) = self.live.remove(&id) {
                info!(target_id = %id, "target left inventory, cancelling worker");
                worker.cancel.cancel();
            }
        }
    }

    fn start_worker(&mut self, id: String, target: &ResolvedTarget) {
        let base_labels = vec![
            ("environment".to_string(), target.environment.clone()),
            ("host".to_string(), target.host.clone()),
        ];
        let parser = LineParser::new(self.config.global.format.clone(), base_labels);
        let cancel = CancellationToken::new();
        let worker = SshLogScraper::new(target, parser, self.registry.clone(), cancel.clone());

        info!(
            target_id = %id,
            environment = %target.environment,
            host = %target.host,
            "starting worker"
        );
        let handle = tokio::spawn(worker.run());
        self.live.insert(id, LiveWorker { cancel, handle });
    }

    /// Cancel every live worker and wait for it to self-terminate. Unlike
    /// routine reconciliation, process shutdown needs the workers to have
    /// actually closed their SSH streams before `main` exits.
    async fn shutdown(&mut self) {
        for (id, worker) in self.live.drain() {
            worker.cancel.cancel();
            if let Err(err) = worker.handle.await {
                warn!(target_id = %id, error = %err, "worker task panicked during shutdown");
            }
        }
    }
}

fn target_id(target: &ResolvedTarget) -> String {
    format!(
        "ssh://{}/{}",
        target.host,
        target.file.as_deref().unwrap_or_default()
    )
}

/// Run the inventory script to completion and return its stdout as a string.
async fn run_inventory_script(script: &str) -> eyre::Result<String> {
    let output = Command::new("sh")
        .arg("-c")
        .arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        eyre::bail!(
            "inventory script exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    Ok(String::from_utf8(output.stdout)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str, file: Option<&str>) -> ResolvedTarget {
        ResolvedTarget {
            environment: "prod".to_string(),
            host: host.to_string(),
            file: file.map(str::to_string),
            user: None,
            password: None,
            pkey: None,
            connect_timeout_secs: 30,
        }
    }

    #[test]
    fn target_id_combines_host_and_file() {
        let t = target("h1", Some("/var/log/a.log"));
        assert_eq!(target_id(&t), "ssh://h1//var/log/a.log");
    }

    #[test]
    fn target_id_tolerates_missing_file() {
        let t = target("h1", None);
        assert_eq!(target_id(&t), "ssh://h1/");
    }

    fn test_supervisor() -> Supervisor {
        let config = Config {
            global: crate::config::GlobalConfig {
                ttl_secs: 60,
                prefix: "test".to_string(),
                histograms: HashMap::new(),
                format: vec![],
            },
            ssh: crate::config::SshConfig::default(),
            script: None,
            reload_interval: None,
        };
        let registry = Arc::new(Registry::new("test", Duration::from_secs(60)).unwrap());
        Supervisor::new(config, registry)
    }

    // These targets never resolve; the worker's connect attempt fails and it
    // parks in backoff, which is all reconcile()'s live-set bookkeeping
    // needs — cancellation interrupts the backoff sleep immediately.

    #[tokio::test]
    async fn reconcile_starts_new_targets() {
        let mut sup = test_supervisor();
        sup.reconcile(vec![target("h1", None)]);
        assert_eq!(sup.live.len(), 1);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn reconcile_is_idempotent_for_unchanged_desired_set() {
        let mut sup = test_supervisor();
        sup.reconcile(vec![target("h1", None)]);
        sup.reconcile(vec![target("h1", None)]);
        assert_eq!(sup.live.len(), 1);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn reconcile_cancels_targets_that_leave_the_desired_set() {
        let mut sup = test_supervisor();
        sup.reconcile(vec![target("h1", None), target("h2", None)]);
        assert_eq!(sup.live.len(), 2);

        sup.reconcile(vec![target("h1", None)]);
        assert_eq!(sup.live.len(), 1);
        assert!(sup.live.contains_key(&target_id(&target("h1", None))));

        sup.shutdown().await;
    }

    // `run()` reconciles the static inventory once, then (with a script
    // configured) reconciles against `static_targets ∪ script_targets` on
    // every pass — never the script output alone. This exercises that union
    // at the `reconcile` level the way `run()`'s loop body builds it.
    #[tokio::test]
    async fn reconcile_union_keeps_static_targets_alongside_script_targets() {
        let mut sup = test_supervisor();
        let static_targets = vec![target("static-host", None)];
        sup.reconcile(static_targets.clone());
        assert_eq!(sup.live.len(), 1);

        let mut desired = static_targets.clone();
        desired.extend(vec![target("script-host", None)]);
        sup.reconcile(desired);

        assert_eq!(sup.live.len(), 2);
        assert!(sup.live.contains_key(&target_id(&target("static-host", None))));
        assert!(sup.live.contains_key(&target_id(&target("script-host", None))));

        sup.shutdown().await;
    }
}
