use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tracing::info;

use crate::metrics::Registry;

/// Serves the accumulated registry as a Prometheus scrape target: a tiny
/// `axum::Router` with one route that sweeps, encodes, and returns the
/// current exposition on every call.
pub struct Server {
    listen_port: u16,
    registry: Arc<Registry>,
}

impl Server {
    pub fn new(listen_port: u16, registry: Arc<Registry>) -> Self {
        Self {
            listen_port,
            registry,
        }
    }

    /// Bind and serve `/metrics`. Resolves only on bind/serve failure.
    pub fn run_http_server(self: Arc<Self>) -> JoinHandle<eyre::Result<()>> {
        let port = self.listen_port;
        info!(port, "starting metrics server on 0.0.0.0");

        tokio::spawn(async move {
            let app = Router::new()
                .route("/metrics", get(move || scrape(self.clone())))
                .fallback(get(index));

            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            axum::Server::bind(&addr)
                .serve(app.into_make_service())
                .await?;
            Ok(())
        })
    }
}

async fn scrape(server: Arc<Server>) -> Response {
    server.registry.sweep(Instant::now());
    match server.registry.snapshot_text() {
        Ok(body) => (
            StatusCode::OK,
            [("Content-Type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {err}"),
        )
            .into_response(),
    }
}

async fn index() -> Html<&'static str> {
    Html("<html><body>go look at <a href=\"/metrics\">/metrics</a></body></html>")
}
