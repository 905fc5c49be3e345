//! The per-target SSH tail worker: `Idle → Connecting → Tailing →
//! Disconnected → Idle`, with exponential backoff and cooperative
//! cancellation. An explicit state machine rather than a plain retry loop,
//! since each state has an externally observable effect (the `connected`
//! gauge) that needs to be set on every transition.

use std::time::Duration;

use russh::ChannelMsg;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ResolvedTarget;
use crate::error::TransportError;
use crate::metrics::Registry;
use crate::parser::LineParser;
use crate::scraper::ssh::SshSession;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

struct Backoff {
    current: Duration,
}

impl Backoff {
    fn new() -> Self {
        Self {
            current: INITIAL_BACKOFF,
        }
    }

    fn current(&self) -> Duration {
        self.current
    }

    fn bump(&mut self) {
        self.current = (self.current * 2).min(MAX_BACKOFF);
    }

    fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
    }
}

/// One worker per `(host, file)` target. Owns its own `LineParser`
/// (constructed with `environment`/`host` as base labels) and a shared
/// handle to the registry.
pub struct SshLogScraper {
    environment: String,
    host: String,
    file: String,
    user: Option<String>,
    password: Option<String>,
    pkey: Option<String>,
    connect_timeout: Duration,
    parser: LineParser,
    registry: std::sync::Arc<Registry>,
    cancel: CancellationToken,
}

impl SshLogScraper {
    pub fn new(
        target: &ResolvedTarget,
        parser: LineParser,
        registry: std::sync::Arc<Registry>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            environment: target.environment.clone(),
            host: target.host.clone(),
            file: target.file.clone().unwrap_or_default(),
            user: target.user.clone(),
            password: target.password.clone(),
            pkey: target.pkey.clone(),
            connect_timeout: Duration::from_secs(target.connect_timeout_secs),
            parser,
            registry,
            cancel,
        }
    }

    /// `ssh://<host>/<file>` — the supervisor's identity for this worker.
    pub fn target_id(&self) -> String {
        format!("ssh://{}/{}", self.host, self.file)
    }

    /// Drive the state machine until cancelled. Never returns otherwise.
    #[instrument(name = "scraper", skip(self), fields(environment = %self.environment, host = %self.host))]
    pub async fn run(mut self) {
        let mut backoff = Backoff::new();

        loop {
            if self.cancel.is_cancelled() {
                self.registry.set_connected(&self.environment, &self.host, 0.0);
                return;
            }

            // Idle: connected=0, wait out the backoff, interruptibly.
            self.registry.set_connected(&self.environment, &self.host, 0.0);
            tokio::select! {
                _ = tokio::time::sleep(backoff.current()) => {}
                _ = self.cancel.cancelled() => {
                    self.registry.set_connected(&self.environment, &self.host, 0.0);
                    return;
                }
            }

            match self.connect_and_tail().await {
                Ok(produced_line) => {
                    if produced_line {
                        backoff.reset();
                    } else {
                        backoff.bump();
                    }
                }
                Err(err) => {
                    warn!(error = %err, "ssh tail failed");
                    backoff.bump();
                }
            }

            // Disconnected: always leave connected=0 before looping back.
            self.registry.set_connected(&self.environment, &self.host, 0.0);
        }
    }

    /// Connecting + Tailing, collapsed into one fallible step: connect,
    /// exec `tail -F`, and read lines until EOF, error, or cancellation.
    /// Returns whether at least one line was read (used to decide whether
    /// the backoff resets).
    async fn connect_and_tail(&mut self) -> Result<bool, TransportError> {
        let user = self.user.clone().unwrap_or_default();

        let connect = SshSession::connect(
            &self.host,
            &user,
            self.password.as_deref(),
            self.pkey.as_deref(),
        );
        let mut session = tokio::select! {
            result = tokio::time::timeout(self.connect_timeout, connect) => {
                match result {
                    Ok(inner) => inner?,
                    Err(_) => {
                        return Err(TransportError::Connect {
                            host: self.host.clone(),
                            source: eyre::eyre!("connect timed out after {:?}", self.connect_timeout),
                        });
                    }
                }
            }
            _ = self.cancel.cancelled() => return Ok(false),
        };

        let mut channel = session.tail(&self.file).await?;
        self.registry.set_connected(&self.environment, &self.host, 1.0);
        info!("tailing started");

        let produced_line = self.tail_loop(&mut channel).await;
        session.close().await;
        Ok(produced_line)
    }

    /// Read stdout data, split on newlines, and submit each complete line
    /// to the parser. Ends the loop on EOF/Close/cancellation.
    async fn tail_loop(&self, channel: &mut russh::Channel<russh::client::Msg>) -> bool {
        let mut buf = Vec::new();
        let mut produced_line = false;

        loop {
            tokio::select! {
                msg = channel.wait() => {
                    match msg {
                        Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                            buf.extend_from_slice(&data);
                            while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                                let line_bytes: Vec<u8> = buf.drain(..=pos).collect();
                                let line = String::from_utf8_lossy(&line_bytes);
                                let line = line.trim_end_matches(['\r', '\n']);
                                if line.is_empty() {
                                    continue;
                                }
                                produced_line = true;
                                if let Err(err) = self.parser.parse_and_record(line, &self.registry) {
                                    debug!(error = %err, "line failed to parse");
                                }
                            }
                        }
                        Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                        _ => {}
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }

        produced_line
    }
}
