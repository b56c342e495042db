//! Envelope exchanged over the transport.
//!
//! Every frame on the wire is one [`Envelope`]: either a request carrying a
//! method name, or a response carrying the id of the request it answers.

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::rpc::CallId;

/// Envelope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
}

/// Request/response message unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Request or response
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Correlation key shared by a request and its response
    pub id: CallId,
    /// Method name (requests only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Encoded request params or response result
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Peer-reported error (responses only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Vec<u8>>,
}

impl Envelope {
    /// Build a request envelope.
    pub fn request(id: CallId, name: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Request,
            id,
            name: Some(name.into()),
            payload,
            error: None,
        }
    }

    /// Build a successful response envelope.
    pub fn response(id: CallId, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Response,
            id,
            name: None,
            payload,
            error: None,
        }
    }

    /// Build an error response envelope.
    pub fn error_response(id: CallId, error: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageKind::Response,
            id,
            name: None,
            payload: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn is_request(&self) -> bool {
        self.kind == MessageKind::Request
    }

    pub fn is_response(&self) -> bool {
        self.kind == MessageKind::Response
    }

    /// Serialize for the wire.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self)
    }

    /// Parse a frame received from the wire.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        codec::decode(bytes)
    }
}
