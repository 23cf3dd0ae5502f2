//! SSH local port forwarding.
//!
//! [`SshTunnel`] binds `127.0.0.1:<local_port>` and forwards every accepted connection
//! through a password-authenticated SSH session to `<remote_host>:<remote_port>` as seen
//! from the SSH host. Opening an open tunnel and closing a closed one are no-ops.
//!
//! The server's host key must be listed in `known_hosts_path` (or `~/.ssh/known_hosts`
//! when unset) before the password is sent. A changed key is always rejected; an unknown
//! one only when `accept_unknown_host_keys` is set.

use async_trait::async_trait;
use russh::client;
use russh::Disconnect;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SshTunnelConfig;
use crate::error::{ExecutorError, ExecutorResult};

/// A network path that must be open while a remote backend is in use
#[async_trait]
pub trait Tunnel: Send + Sync {
    async fn open(&mut self) -> ExecutorResult<()>;

    async fn close(&mut self) -> ExecutorResult<()>;

    fn is_open(&self) -> bool;
}

struct ForwardingClient {
    host: String,
    port: u16,
    known_hosts_path: Option<PathBuf>,
    accept_unknown_host_keys: bool,
}

impl ForwardingClient {
    fn for_config(config: &SshTunnelConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            known_hosts_path: config.known_hosts_path.clone(),
            accept_unknown_host_keys: config.accept_unknown_host_keys,
        }
    }
}

#[async_trait]
impl client::Handler for ForwardingClient {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let known = match &self.known_hosts_path {
            Some(path) => {
                russh_keys::check_known_hosts_path(&self.host, self.port, server_public_key, path)
            }
            None => russh_keys::check_known_hosts(&self.host, self.port, server_public_key),
        };

        match known {
            Ok(true) => Ok(true),
            Ok(false) if self.accept_unknown_host_keys => {
                warn!(ssh_host = %self.host, "Accepting unknown SSH host key");
                Ok(true)
            }
            Ok(false) => {
                warn!(ssh_host = %self.host, "SSH host key is not in known_hosts");
                Ok(false)
            }
            Err(error) => {
                warn!(ssh_host = %self.host, error = %error, "SSH host key verification failed");
                Ok(false)
            }
        }
    }
}

struct ActiveTunnel {
    session: Arc<client::Handle<ForwardingClient>>,
    cancel: CancellationToken,
    accept_loop: JoinHandle<()>,
}

pub struct SshTunnel {
    config: SshTunnelConfig,
    active: Option<ActiveTunnel>,
}

impl SshTunnel {
    pub fn new(config: SshTunnelConfig) -> Self {
        Self {
            config,
            active: None,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.config.local_port))
    }
}

#[async_trait]
impl Tunnel for SshTunnel {
    async fn open(&mut self) -> ExecutorResult<()> {
        if self.active.is_some() {
            return Ok(());
        }

        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            ..Default::default()
        });
        let mut session = client::connect(
            ssh_config,
            (self.config.host.as_str(), self.config.port),
            ForwardingClient::for_config(&self.config),
        )
        .await?;

        let authenticated = session
            .authenticate_password(&self.config.username, &self.config.password)
            .await?;
        if !authenticated {
            return Err(ExecutorError::Tunnel(format!(
                "authentication rejected for {}@{}",
                self.config.username, self.config.host
            )));
        }

        let listener = TcpListener::bind(self.local_addr()).await.map_err(|e| {
            ExecutorError::Tunnel(format!("failed to bind {}: {e}", self.local_addr()))
        })?;

        let session = Arc::new(session);
        let cancel = CancellationToken::new();
        let accept_loop = tokio::spawn(forward_connections(
            listener,
            session.clone(),
            self.config.remote_host.clone(),
            self.config.remote_port,
            cancel.clone(),
        ));

        info!(
            ssh_host = %self.config.host,
            local_addr = %self.local_addr(),
            remote = %format!("{}:{}", self.config.remote_host, self.config.remote_port),
            "🔐 SSH tunnel opened"
        );

        self.active = Some(ActiveTunnel {
            session,
            cancel,
            accept_loop,
        });
        Ok(())
    }

    async fn close(&mut self) -> ExecutorResult<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };

        active.cancel.cancel();
        if let Err(error) = active.accept_loop.await {
            warn!(error = %error, "SSH tunnel accept loop ended abnormally");
        }
        if let Err(error) = active
            .session
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            warn!(error = %error, "SSH disconnect failed, dropping session");
        }

        info!(ssh_host = %self.config.host, "🔐 SSH tunnel closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.active.is_some()
    }
}

async fn forward_connections(
    listener: TcpListener,
    session: Arc<client::Handle<ForwardingClient>>,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
) {
    loop {
        let (socket, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(error = %error, "Failed to accept tunnel connection");
                    continue;
                }
            },
        };

        tokio::spawn(forward_one(
            socket,
            peer,
            session.clone(),
            remote_host.clone(),
            remote_port,
            cancel.clone(),
        ));
    }
}

async fn forward_one(
    mut socket: TcpStream,
    peer: SocketAddr,
    session: Arc<client::Handle<ForwardingClient>>,
    remote_host: String,
    remote_port: u16,
    cancel: CancellationToken,
) {
    let channel = match session
        .channel_open_direct_tcpip(
            remote_host,
            u32::from(remote_port),
            peer.ip().to_string(),
            u32::from(peer.port()),
        )
        .await
    {
        Ok(channel) => channel,
        Err(error) => {
            warn!(error = %error, peer = %peer, "Failed to open forwarding channel");
            return;
        }
    };

    let mut stream = channel.into_stream();
    tokio::select! {
        _ = cancel.cancelled() => {}
        copied = tokio::io::copy_bidirectional(&mut socket, &mut stream) => {
            match copied {
                Ok((sent, received)) => {
                    debug!(peer = %peer, sent, received, "Tunnel connection closed")
                }
                Err(error) => debug!(error = %error, peer = %peer, "Tunnel connection aborted"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::client::Handler;

    #[tokio::test]
    async fn test_close_is_idempotent_when_never_opened() {
        let mut tunnel = SshTunnel::new(SshTunnelConfig::default());
        assert!(!tunnel.is_open());
        tunnel.close().await.unwrap();
        tunnel.close().await.unwrap();
        assert!(!tunnel.is_open());
    }

    #[tokio::test]
    async fn test_open_fails_for_unreachable_host() {
        let mut tunnel = SshTunnel::new(SshTunnelConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            username: "simbad".to_string(),
            ..SshTunnelConfig::default()
        });
        let err = tunnel.open().await.unwrap_err();
        assert!(matches!(err, ExecutorError::Tunnel(_)));
        assert!(!tunnel.is_open());
    }

    const TRUSTED_KEY: &str =
        "AAAAC3NzaC1lZDI1NTE5AAAAIGbnMTkbR4eOZhX1HtVgH7fyEkK8BArBTwPfmFv7GhjB";
    const OTHER_KEY: &str =
        "AAAAC3NzaC1lZDI1NTE5AAAAIJchmJmumCkDygiph8r4/Gf+S5He28O71yMvYJXa50t8";

    fn client_for(known_hosts: &std::path::Path, accept_unknown: bool) -> ForwardingClient {
        ForwardingClient::for_config(&SshTunnelConfig {
            host: "analyzer.lab".to_string(),
            known_hosts_path: Some(known_hosts.to_path_buf()),
            accept_unknown_host_keys: accept_unknown,
            ..SshTunnelConfig::default()
        })
    }

    #[tokio::test]
    async fn test_host_key_checked_against_known_hosts() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("known_hosts");
        std::fs::write(&known_hosts, format!("analyzer.lab ssh-ed25519 {TRUSTED_KEY}\n")).unwrap();
        let trusted = russh_keys::parse_public_key_base64(TRUSTED_KEY).unwrap();
        let other = russh_keys::parse_public_key_base64(OTHER_KEY).unwrap();

        let mut client = client_for(&known_hosts, false);
        assert!(client.check_server_key(&trusted).await.unwrap());
        assert!(!client.check_server_key(&other).await.unwrap());

        // A changed key stays rejected even when unknown hosts are allowed
        let mut permissive = client_for(&known_hosts, true);
        assert!(!permissive.check_server_key(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_host_requires_opt_in() {
        let dir = tempfile::tempdir().unwrap();
        let known_hosts = dir.path().join("missing_known_hosts");
        let key = russh_keys::parse_public_key_base64(TRUSTED_KEY).unwrap();

        assert!(!client_for(&known_hosts, false).check_server_key(&key).await.unwrap());
        assert!(client_for(&known_hosts, true).check_server_key(&key).await.unwrap());
    }

    #[test]
    fn test_local_addr_uses_loopback() {
        let tunnel = SshTunnel::new(SshTunnelConfig {
            local_port: 6000,
            ..SshTunnelConfig::default()
        });
        assert_eq!(tunnel.local_addr().to_string(), "127.0.0.1:6000");
    }
}
