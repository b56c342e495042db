//! Request/response call correlation.
//!
//! This module turns a packet-oriented duplex connection into RPC calls:
//!
//! ```text
//! caller ──► RpcClient::call ──► encode ──► Transport::send_bytes
//!                │
//!                ▼ (register)
//!          PendingCalls[id] ◄── lookup ◄── adapter::on_packet ◄── Transport
//!                │
//!                ▼ (complete once)
//!          waiting caller wakes with payload / error
//! ```
//!
//! Each call is resolved exactly once by whichever happens first: a matching
//! response, cancellation, the call timeout, or the connection closing.
//!
//! # Usage
//!
//! ```ignore
//! use relayrpc::{ClientConfig, RpcClient};
//!
//! let client = RpcClient::new(ClientConfig::default());
//! client.connect("tcp", "127.0.0.1:7070")?;
//! client.wait_connected().await;
//! let reply: serde_json::Value = client.call("echo", &serde_json::json!({"msg": "hi"})).await?;
//! ```

mod adapter;
mod client;
mod dispatch;
mod events;
mod id;
#[cfg(test)]
mod mock;
mod pending;

pub use client::RpcClient;
pub use dispatch::MethodTable;
pub use events::{ConnectionState, EventSink, RpcEvent};
pub use id::{next_call_id, CallId};
