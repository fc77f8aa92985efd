//! Multiplexing many logical streams over the single physical channel.
//!
//! The on-wire framing is yamux, delegated to the `tokio-yamux` crate; this
//! module only fixes the roles: the client opens one logical stream per
//! accepted local connection, the server accepts whatever the peer opens.

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_yamux::session::SessionType;
use tokio_yamux::stream::StreamHandle;
use tokio_yamux::{Config, Control, Session};
use tracing::{debug, warn};

use crate::error::{Result, TunnelError};

/// One multiplex session owning the underlying channel for its lifetime.
///
/// A background task drives the session until the underlying channel closes
/// or errors; after that every open, accept, and stream operation fails with
/// [`TunnelError::SessionClosed`]. The session never re-establishes the
/// channel.
pub struct MuxSession {
    control: Control,
    incoming: mpsc::Receiver<StreamHandle>,
    driver: JoinHandle<()>,
}

impl MuxSession {
    /// Client role: this end opens logical streams.
    pub fn client<S>(underlying: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(underlying, SessionType::Client)
    }

    /// Server role: this end accepts logical streams the peer opens.
    pub fn server<S>(underlying: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(underlying, SessionType::Server)
    }

    fn new<S>(underlying: S, session_type: SessionType) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut session = Session::new(underlying, Config::default(), session_type);
        let control = session.control();
        let (incoming_tx, incoming_rx) = mpsc::channel(16);

        let driver = tokio::spawn(async move {
            while let Some(next) = session.next().await {
                match next {
                    Ok(stream) => {
                        if incoming_tx.send(stream).await.is_err() {
                            // Nobody accepting; keep driving the session for
                            // the streams this end opened itself.
                            debug!("inbound logical stream dropped");
                        }
                    }
                    Err(e) => {
                        warn!("multiplex session ended: {}", e);
                        break;
                    }
                }
            }
            debug!("multiplex session driver finished");
        });

        Self {
            control,
            incoming: incoming_rx,
            driver,
        }
    }

    /// Open a new logical stream (client role). Fails with
    /// [`TunnelError::SessionClosed`] once the underlying channel is gone.
    pub async fn open_stream(&mut self) -> Result<StreamHandle> {
        self.control.open_stream().await.map_err(|e| {
            debug!("open_stream failed: {}", e);
            TunnelError::SessionClosed
        })
    }

    /// Wait for the peer to open a logical stream (server role). Fails with
    /// [`TunnelError::SessionClosed`] once the underlying channel is gone.
    pub async fn accept_stream(&mut self) -> Result<StreamHandle> {
        self.incoming.recv().await.ok_or(TunnelError::SessionClosed)
    }
}

impl Drop for MuxSession {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
