//! Per-connection session state.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::{debug, info};
use uuid::Uuid;

/// Phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Connected, nobody logged in.
    #[default]
    Unauthenticated,
    /// A user is logged in.
    Authenticated,
    /// The connection is gone. Terminal.
    Closed,
}

/// Session of one client connection.
///
/// Sessions are owned by the connection handler serving the connection and
/// are never shared, so several sessions may be logged in as the same user.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    peer_addr: SocketAddr,
    state: SessionState,
    username: Option<String>,
    connected_at: Instant,
}

impl Session {
    /// Create an unauthenticated session for a new connection.
    pub fn new(peer_addr: SocketAddr) -> Self {
        let id = Uuid::new_v4();
        debug!("Created new session {} for {}", id, peer_addr);

        Self {
            id,
            peer_addr,
            state: SessionState::Unauthenticated,
            username: None,
            connected_at: Instant::now(),
        }
    }

    /// Get the session ID.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Get the peer address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Get the current session state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Username if logged in.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Check if the session is logged in.
    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }

    /// When the connection was accepted.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Mark the session as logged in as `username`.
    pub fn login(&mut self, username: impl Into<String>) {
        let username = username.into();
        info!("Session {} logged in as {}", self.id, username);
        self.username = Some(username);
        self.state = SessionState::Authenticated;
    }

    /// Log out. Returns the user that was logged in.
    pub fn logout(&mut self) -> Option<String> {
        let username = self.username.take();
        if let Some(name) = &username {
            info!("Session {} logged out (was {})", self.id, name);
            self.state = SessionState::Unauthenticated;
        }
        username
    }

    /// Mark the connection as closed.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            debug!(
                "Session {} closed after {:?}",
                self.id,
                self.connected_at.elapsed()
            );
        }
        self.username = None;
        self.state = SessionState::Closed;
    }
}
