//! Error types for call correlation and the transport boundary.

use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::rpc::CallId;

/// Outcome of a failed call.
///
/// Every call resolves to exactly one of these or to a decoded response.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The request (or its envelope) could not be encoded.
    #[error("Failed to encode request: {0}")]
    Encode(#[source] CodecError),

    /// The response payload could not be decoded into the expected type.
    #[error("Failed to decode response: {0}")]
    Decode(#[source] CodecError),

    /// The peer answered with an application error. The bytes are forwarded verbatim.
    #[error("Remote error: {}", String::from_utf8_lossy(.0))]
    Remote(Vec<u8>),

    /// The caller's cancellation token fired before a reply arrived.
    #[error("Call cancelled")]
    Cancelled,

    /// No reply arrived within the call timeout.
    #[error("Request timed out after {}s", .0.as_secs())]
    TimedOut(Duration),

    /// The connection dropped while the call was pending.
    #[error("Connection closed before a response arrived")]
    ConnectionClosed,

    /// A panic inside the call path, converted to an error.
    #[error("Call panicked: {0}")]
    Panicked(String),

    /// No transport has been attached to the client.
    #[error("No transport attached")]
    NotAttached,

    /// The registry already held a record for this identifier.
    #[error("Call identifier {0} is already pending")]
    DuplicateCallId(CallId),
}

impl RpcError {
    /// True for failures where no reply was ever delivered in time.
    pub fn is_timeout_class(&self) -> bool {
        matches!(self, RpcError::TimedOut(_) | RpcError::ConnectionClosed)
    }

    /// Remote error text, if the peer reported one.
    pub fn remote_message(&self) -> Option<String> {
        match self {
            RpcError::Remote(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }
}

/// Errors raised by the transport collaborator.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Dialing the endpoint failed.
    #[error("Connection to {endpoint} failed: {source}")]
    Connect {
        /// Endpoint description (e.g. `tcp://127.0.0.1:7070`)
        endpoint: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Framing or I/O failure on an established connection.
    #[error("Connection error: {0:#}")]
    Connection(anyhow::Error),

    /// The network/address pair could not be parsed.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// The transport has been shut down and accepts no more frames.
    #[error("Transport is shut down")]
    Shutdown,
}
