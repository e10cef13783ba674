//! TCP accept loop handing every socket to a [`Connection`].

use crate::error::{NetworkError, Result};
use crate::network::connection::{Connection, Dispatcher};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// TCP server for one node role.
pub struct NetworkServer {
    /// Bound listener.
    listener: TcpListener,

    /// Dispatcher shared by every accepted connection.
    dispatcher: Arc<dyn Dispatcher>,

    /// Queue-hold signal handed to every accepted connection.
    hold: watch::Receiver<bool>,

    /// Stops the accept loop when cancelled.
    shutdown: CancellationToken,
}

impl NetworkServer {
    /// Bind a listener on `bind_addr`.
    pub async fn bind(
        bind_addr: SocketAddr,
        dispatcher: Arc<dyn Dispatcher>,
        hold: watch::Receiver<bool>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener =
            TcpListener::bind(bind_addr)
                .await
                .map_err(|e| NetworkError::BindFailed {
                    addr: bind_addr.to_string(),
                    reason: e.to_string(),
                })?;

        Ok(Self {
            listener,
            dispatcher,
            hold,
            shutdown,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Run the accept loop until shutdown.
    pub async fn run(self) -> Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Network server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let _ = stream.set_nodelay(true);
                            Connection::spawn(
                                stream,
                                peer_addr.to_string(),
                                self.dispatcher.clone(),
                                self.hold.clone(),
                            );
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    info!(addr = %addr, "Network server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}
