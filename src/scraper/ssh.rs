//! Minimal `russh` client plumbing: a `Handler` that accepts any host key
//! (no host-key pinning is implemented) and a thin wrapper that turns `exec`
//! output into an async byte stream.

use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::key::PublicKey;

use crate::error::TransportError;

pub(crate) struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub(crate) struct SshSession {
    handle: Handle<AcceptingHandler>,
    host: String,
}

impl SshSession {
    pub(crate) async fn connect(
        host: &str,
        user: &str,
        password: Option<&str>,
        pkey_path: Option<&str>,
    ) -> Result<Self, TransportError> {
        let config = Arc::new(client::Config::default());
        let handle = client::connect(config, (host, 22), AcceptingHandler)
            .await
            .map_err(|source| TransportError::Connect {
                host: host.to_string(),
                source: source.into(),
            })?;
        let mut session = Self {
            handle,
            host: host.to_string(),
        };
        session.authenticate(host, user, password, pkey_path).await?;
        Ok(session)
    }

    async fn authenticate(
        &mut self,
        host: &str,
        user: &str,
        password: Option<&str>,
        pkey_path: Option<&str>,
    ) -> Result<(), TransportError> {
        let authenticated = if let Some(pkey_path) = pkey_path {
            let key_pair = russh_keys::load_secret_key(pkey_path, None).map_err(|_| {
                TransportError::Authentication {
                    host: host.to_string(),
                    user: user.to_string(),
                }
            })?;
            self.handle
                .authenticate_publickey(user, Arc::new(key_pair))
                .await
                .unwrap_or(false)
        } else if let Some(password) = password {
            self.handle
                .authenticate_password(user, password)
                .await
                .unwrap_or(false)
        } else {
            false
        };

        if authenticated {
            Ok(())
        } else {
            Err(TransportError::Authentication {
                host: host.to_string(),
                user: user.to_string(),
            })
        }
    }

    /// Open a session channel and start `tail -n0 -F -- <file>`, which
    /// begins following from end-of-file and survives log rotation.
    pub(crate) async fn tail(&mut self, file: &str) -> Result<Channel<client::Msg>, TransportError> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|source| TransportError::Channel {
                host: self.host.clone(),
                source: source.into(),
            })?;
        let command = format!("tail -n0 -F -- {}", shell_quote(file));
        channel
            .exec(true, command)
            .await
            .map_err(|source| TransportError::Channel {
                host: self.host.clone(),
                source: source.into(),
            })?;
        Ok(channel)
    }

    pub(crate) async fn close(&mut self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
    }
}

/// Quote a path for a POSIX shell single-quoted argument.
fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}
