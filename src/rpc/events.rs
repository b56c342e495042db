//! Events surfaced to the user's event sink.

use std::sync::Arc;

use crate::error::TransportError;
use crate::transport::ConnectionInfo;

use super::CallId;

/// Connection lifecycle and diagnostics reported by a client.
#[derive(Debug, Clone)]
pub enum RpcEvent {
    /// A connection was established.
    Opened(ConnectionInfo),
    /// The connection closed; every pending call has been resolved.
    Closed(ConnectionInfo),
    /// The transport reported an error (dial failure, broken pipe, bad framing, failed send).
    ErrorOccurred {
        conn: Option<ConnectionInfo>,
        error: Arc<TransportError>,
    },
    /// A frame arrived that is not a valid envelope.
    RawFrameUnrecognized {
        conn: ConnectionInfo,
        frame: Vec<u8>,
    },
    /// The peer issued a request against this side.
    ServeRequested { id: CallId, name: String },
}

impl RpcEvent {
    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcEvent::Opened(_) => "opened",
            RpcEvent::Closed(_) => "closed",
            RpcEvent::ErrorOccurred { .. } => "error",
            RpcEvent::RawFrameUnrecognized { .. } => "raw_frame",
            RpcEvent::ServeRequested { .. } => "serve",
        }
    }
}

/// Callback invoked for every [`RpcEvent`]. Runs on the transport task; keep it short.
pub type EventSink = Arc<dyn Fn(&RpcEvent) + Send + Sync>;

/// Whether the client currently has an open connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}
