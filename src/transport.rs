//! Transport boundary.
//!
//! The call layer never touches sockets directly. It hands encoded frames to a
//! [`Transport`] and receives lifecycle signals through a
//! [`ConnectionHandler`]:
//!
//! ```text
//! ┌──────────────┐  send_bytes(frame)   ┌──────────────────┐      ┌──────┐
//! │  RpcClient   │ ───────────────────► │  SocketTransport │ ◄──► │ peer │
//! │              │ ◄─────────────────── │  (framing.rs)    │      └──────┘
//! └──────────────┘  on_open / on_close  └──────────────────┘
//!                   on_error / on_packet
//! ```
//!
//! [`socket`] provides the stock implementation over TCP and Unix domain
//! sockets with Content-Length framing and automatic reconnect.

pub mod framing;
pub mod socket;

use std::fmt;

pub use crate::error::TransportError;
pub use socket::{Endpoint, Listener, SocketStream, SocketTransport, TransportOptions};

/// Outbound half of a connection.
pub trait Transport: Send + Sync {
    /// Queue a frame for sending. Does not wait for the write to complete.
    fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Stop the transport. The current connection (if any) is closed and no
    /// reconnect is attempted.
    fn close(&self);
}

/// Receiver of connection lifecycle signals.
///
/// Callbacks run on the transport's reader task and must not block. The
/// connection task owns its handler until it exits.
pub trait ConnectionHandler: Send + Sync {
    /// A connection was established.
    fn on_open(&self, conn: &ConnectionInfo);

    /// The connection was lost or closed.
    fn on_close(&self, conn: &ConnectionInfo);

    /// A transport-level error occurred.
    fn on_error(&self, conn: &ConnectionInfo, err: TransportError);

    /// A complete inbound frame arrived.
    fn on_packet(&self, conn: &ConnectionInfo, packet: &[u8]);
}

/// Identity of one established connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Remote endpoint description
    pub peer: String,
    /// Incremented on every successful (re)connect, starting at 1
    pub generation: u64,
}

impl ConnectionInfo {
    pub fn new(peer: impl Into<String>, generation: u64) -> Self {
        Self {
            peer: peer.into(),
            generation,
        }
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.peer, self.generation)
    }
}
