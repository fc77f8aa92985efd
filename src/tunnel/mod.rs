//! Tunnel orchestration.
//!
//! [`TunnelManager`] sequences one tunnel session: establish the relay
//! duplex, optionally wrap it in encryption and multiplexing, then pair
//! local TCP connections with remote streams and hand each pair to
//! [`proxy::run`].

mod mux;
pub mod proxy;

pub use mux::MuxSession;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::config::{Role, TunnelConfig};
use crate::crypto::CipherStream;
use crate::relay::DuplexChannel;

pub struct TunnelManager {
    config: TunnelConfig,
    http: reqwest::Client,
    bound_tx: Option<oneshot::Sender<SocketAddr>>,
}

impl TunnelManager {
    pub fn new(config: TunnelConfig, http: reqwest::Client) -> Self {
        Self {
            config,
            http,
            bound_tx: None,
        }
    }

    /// Report the client listener's bound address on `tx` once listening.
    /// Useful with an ephemeral port.
    pub fn notify_bound(mut self, tx: oneshot::Sender<SocketAddr>) -> Self {
        self.bound_tx = Some(tx);
        self
    }

    /// Run the session to completion.
    pub async fn run(self) -> Result<()> {
        match self.config.role {
            Role::Client => self.run_client().await,
            Role::Server => self.run_server().await,
        }
    }

    /// Establish the relay duplex, wrap it in encryption if requested, and
    /// hand it to `serve`.
    async fn connect_remote(&self) -> Result<RemoteStream> {
        let channel = DuplexChannel::connect(
            &self.http,
            &self.config.headers,
            &self.config.upload_url,
            &self.config.download_url,
        )
        .await
        .context("failed to establish relay duplex")?;
        info!("relay duplex established");

        if !self.config.encrypt {
            return Ok(RemoteStream::Plain(channel));
        }

        let passphrase = self
            .config
            .passphrase
            .as_deref()
            .context("encryption enabled but no passphrase resolved")?;
        info!("encrypting with {}", self.config.cipher);
        Ok(RemoteStream::Encrypted(Box::new(CipherStream::wrap(
            channel,
            passphrase,
            self.config.cipher,
        ))))
    }

    async fn run_client(mut self) -> Result<()> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .with_context(|| {
                format!("failed to bind {}:{}", self.config.host, self.config.port)
            })?;
        let addr = listener.local_addr()?;
        info!("listening on {}", addr);
        if let Some(tx) = self.bound_tx.take() {
            let _ = tx.send(addr);
        }

        let remote = self.connect_remote().await?;

        if self.config.multiplex {
            match remote {
                RemoteStream::Plain(channel) => self.serve_client_mux(channel, listener).await,
                RemoteStream::Encrypted(stream) => self.serve_client_mux(stream, listener).await,
            }
        } else {
            match remote {
                RemoteStream::Plain(channel) => self.serve_client_single(channel, listener).await,
                RemoteStream::Encrypted(stream) => {
                    self.serve_client_single(stream, listener).await
                }
            }
        }
    }

    /// Non-multiplexed client: exactly one connection over the whole channel.
    async fn serve_client_single<S>(&self, remote: S, listener: TcpListener) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let (conn, peer) = listener.accept().await.context("accept failed")?;
        info!("accepted connection from {}", peer);
        // Refuse any further incoming connections.
        drop(listener);

        proxy::run(conn, remote, self.config.buf_size).await?;
        info!("connection from {} finished, session done", peer);
        Ok(())
    }

    /// Multiplexed client: unboundedly many connections, one logical stream
    /// each, over the one physical channel.
    async fn serve_client_mux<S>(&self, remote: S, listener: TcpListener) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        info!("multiplexing connections over one channel");
        let mut session = MuxSession::client(remote);

        loop {
            let (conn, peer) = listener.accept().await.context("accept failed")?;
            info!("accepted connection from {}", peer);

            let stream = session
                .open_stream()
                .await
                .context("failed to open multiplexed stream")?;
            let buf_size = self.config.mux_buf_size;

            tokio::spawn(async move {
                match proxy::run(conn, stream, buf_size).await {
                    Ok(()) => info!("connection from {} finished", peer),
                    // Isolated: sibling connections keep running.
                    Err(e) => error!("connection from {} failed: {}", peer, e),
                }
            });
        }
    }

    async fn run_server(self) -> Result<()> {
        let remote = self.connect_remote().await?;

        if self.config.multiplex {
            match remote {
                RemoteStream::Plain(channel) => self.serve_server_mux(channel).await,
                RemoteStream::Encrypted(stream) => self.serve_server_mux(stream).await,
            }
        } else {
            match remote {
                RemoteStream::Plain(channel) => self.serve_server_single(channel).await,
                RemoteStream::Encrypted(stream) => self.serve_server_single(stream).await,
            }
        }
    }

    /// Non-multiplexed server: dial the local service once and proxy the
    /// whole channel into it.
    async fn serve_server_single<S>(&self, remote: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send,
    {
        let target = (self.config.host.as_str(), self.config.port);
        let conn = TcpStream::connect(target).await.with_context(|| {
            format!(
                "failed to connect to local service {}:{}",
                self.config.host, self.config.port
            )
        })?;
        info!("connected to {}:{}", self.config.host, self.config.port);

        proxy::run(conn, remote, self.config.buf_size).await?;
        info!("session done");
        Ok(())
    }

    /// Multiplexed server: dial the local service once per logical stream
    /// the peer opens.
    async fn serve_server_mux<S>(&self, remote: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        info!("multiplexing connections over one channel");
        let mut session = MuxSession::server(remote);

        loop {
            let stream = match session.accept_stream().await {
                Ok(stream) => stream,
                Err(_) => {
                    info!("multiplex session closed, session done");
                    return Ok(());
                }
            };
            info!("accepted logical stream");

            let host = self.config.host.clone();
            let port = self.config.port;
            let buf_size = self.config.mux_buf_size;

            tokio::spawn(async move {
                let conn = match TcpStream::connect((host.as_str(), port)).await {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("failed to connect to local service {}:{}: {}", host, port, e);
                        return;
                    }
                };
                match proxy::run(conn, stream, buf_size).await {
                    Ok(()) => info!("logical stream finished"),
                    Err(e) => error!("logical stream failed: {}", e),
                }
            });
        }
    }
}

/// The remote stream handed to serving, after the optional encryption layer.
enum RemoteStream {
    Plain(DuplexChannel),
    Encrypted(Box<CipherStream<DuplexChannel>>),
}
