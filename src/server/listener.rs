//! TCP acceptor feeding the connection queue.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use super::handler::{Connection, ConnectionQueue};
use super::protocol;
use crate::config::ServerConfig;
use crate::pipeline::{EnqueueError, Shutdown};
use crate::Result;

const REJECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Listening socket of the server.
#[derive(Debug)]
pub struct Listener {
    listener: TcpListener,
}

impl Listener {
    /// Bind to the configured address.
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;

        info!("Cubby server listening on {}", local_addr);

        Ok(Self { listener })
    }

    /// Get the local address the server is bound to.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections into `connections` until shutdown is requested.
    ///
    /// A connection that does not fit in the queue is told the server is busy
    /// and closed. The listening socket is closed when this returns.
    pub async fn run(self, connections: &ConnectionQueue, shutdown: &Shutdown) {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown.cancelled() => break,
            };

            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            debug!("Accepted connection from {}", peer_addr);

            match connections.enqueue(Connection { stream, peer_addr }) {
                Ok(()) => {}
                Err(EnqueueError::Full(_, connection)) => {
                    warn!("Connection queue full, rejecting {}", connection.peer_addr);
                    tokio::spawn(reject(connection));
                }
                Err(EnqueueError::Closed(_, connection)) => {
                    debug!("Connection queue closed, dropping {}", connection.peer_addr);
                    break;
                }
            }
        }
        info!("Stopped accepting connections");
    }
}

/// Tell a client the server is busy, then close the connection.
async fn reject(connection: Connection) {
    let mut stream = connection.stream;
    let written = tokio::time::timeout(
        REJECT_TIMEOUT,
        stream.write_all(protocol::SERVER_BUSY.as_bytes()),
    )
    .await;
    if !matches!(written, Ok(Ok(()))) {
        debug!("Could not send busy reply to {}", connection.peer_addr);
    }
}
