//! relayrpc: request/response calls over a duplex packet connection.
//!
//! The library is organised in layers:
//!
//! - `transport` - packet-oriented connections (Content-Length framing over
//!   TCP or Unix domain sockets) behind the [`Transport`](transport::Transport)
//!   and [`ConnectionHandler`](transport::ConnectionHandler) traits
//! - `protocol` - the [`Envelope`] exchanged on the wire
//! - `rpc` - call correlation: identifiers, the pending-call registry, the
//!   client, and the method table served to the peer
//! - `codec` / `config` / `error` - shared plumbing
//!
//! ```ignore
//! use relayrpc::{ClientConfig, RpcClient};
//!
//! let client = RpcClient::new(ClientConfig::from_env());
//! client.connect("tcp", "127.0.0.1:7070")?;
//! client.wait_connected().await;
//! let pong: String = client.call("ping", &()).await?;
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod rpc;
pub mod transport;

pub use config::ClientConfig;
pub use error::{RpcError, TransportError};
pub use protocol::{Envelope, MessageKind};
pub use rpc::{CallId, ConnectionState, EventSink, MethodTable, RpcClient, RpcEvent};
