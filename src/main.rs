//! Process bootstrap: load configuration, initialize tracing, wire up the
//! registry, supervisor, and HTTP server, and run them to completion or to
//! the first fatal error.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ssh_log_exporter::server::Server;
use ssh_log_exporter::{Config, Registry, Supervisor};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "/etc/scrapeconfig.yml";
const DEFAULT_LISTEN_PORT: u16 = 9898;

fn main() -> eyre::Result<()> {
    start_tracing();

    let config_path = env::var("SCRAPECONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    let listen_port = env::var("SCRAPE_LISTEN_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_LISTEN_PORT);

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!(error = %err, path = %config_path.display(), "failed to load config");
            std::process::exit(1);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config, listen_port))
}

async fn run(config: Config, listen_port: u16) -> eyre::Result<()> {
    let registry = Arc::new(Registry::new(
        config.global.prefix.clone(),
        Duration::from_secs(config.global.ttl_secs),
    )?);

    let server = Server::new(listen_port, registry.clone());
    let server_handle = Arc::new(server).run_http_server();

    let supervisor = Supervisor::new(config, registry);
    let shutdown = CancellationToken::new();
    let mut supervisor_handle = tokio::spawn(supervisor.run(shutdown.clone()));

    tokio::select! {
        result = &mut supervisor_handle => {
            match result {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "supervisor failed");
                    std::process::exit(1);
                }
                Err(err) => {
                    tracing::error!(error = %err, "supervisor task panicked");
                    std::process::exit(1);
                }
            }
        }
        result = server_handle => {
            shutdown.cancel();
            let _ = supervisor_handle.await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(error = %err, "metrics server failed to bind");
                    std::process::exit(1);
                }
                Err(err) => tracing::error!(error = %err, "metrics server task panicked"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received shutdown signal");
            shutdown.cancel();
            let _ = supervisor_handle.await;
        }
    }

    Ok(())
}

fn start_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
