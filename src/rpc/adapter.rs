//! Bridges transport callbacks into the client.
//!
//! Every attached transport reports to its own [`AttachedHandler`], tagged
//! with the epoch of its attachment. Lifecycle callbacks from a transport that
//! has since been replaced are logged and otherwise ignored, so a late close
//! from an old connection cannot fail calls running on the new one.

use std::sync::{Arc, Weak};

use crate::error::TransportError;
use crate::protocol::Envelope;
use crate::transport::{ConnectionHandler, ConnectionInfo};

use super::client::{Attachment, ClientInner};
use super::events::{ConnectionState, RpcEvent};
use super::pending::Completion;

/// The [`ConnectionHandler`] handed to one attached transport.
///
/// Holds the client weakly: a running connection task does not keep a
/// dropped client alive.
pub(crate) struct AttachedHandler {
    inner: Weak<ClientInner>,
    epoch: u64,
}

impl AttachedHandler {
    pub(super) fn new(inner: &Arc<ClientInner>, epoch: u64) -> Self {
        Self {
            inner: Arc::downgrade(inner),
            epoch,
        }
    }

    pub(super) fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl ConnectionHandler for AttachedHandler {
    fn on_open(&self, conn: &ConnectionInfo) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_open(self.epoch, conn);
        }
    }

    fn on_close(&self, conn: &ConnectionInfo) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_close(self.epoch, conn);
        }
    }

    fn on_error(&self, conn: &ConnectionInfo, err: TransportError) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_error(self.epoch, conn, err);
        }
    }

    fn on_packet(&self, conn: &ConnectionInfo, packet: &[u8]) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_packet(self.epoch, conn, packet);
        }
    }
}

fn is_current(slot: &Option<Attachment>, epoch: u64) -> bool {
    slot.as_ref().is_some_and(|attachment| attachment.epoch == epoch)
}

impl ClientInner {
    fn handle_open(&self, epoch: u64, conn: &ConnectionInfo) {
        let current = {
            let slot = self.attachment.read();
            let current = is_current(&slot, epoch);
            if current {
                self.set_state(ConnectionState::Connected);
            }
            current
        };
        if !current {
            tracing::debug!(conn = %conn, epoch, "Ignoring open from a replaced transport");
            return;
        }

        tracing::info!(conn = %conn, "Connection opened");
        self.emit(RpcEvent::Opened(conn.clone()));
    }

    fn handle_close(&self, epoch: u64, conn: &ConnectionInfo) {
        let failed = {
            let slot = self.attachment.read();
            if is_current(&slot, epoch) {
                self.set_state(ConnectionState::Disconnected);
                Some(self.fail_pending())
            } else {
                None
            }
        };

        match failed {
            Some(failed) => {
                tracing::info!(conn = %conn, failed_calls = failed, "Connection closed")
            }
            // Its calls were failed when it was replaced or closed.
            None => tracing::debug!(conn = %conn, epoch, "Replaced transport closed"),
        }
        self.emit(RpcEvent::Closed(conn.clone()));
    }

    fn handle_error(&self, epoch: u64, conn: &ConnectionInfo, err: TransportError) {
        if !is_current(&self.attachment.read(), epoch) {
            tracing::debug!(conn = %conn, epoch, error = %err, "Ignoring error from a replaced transport");
            return;
        }

        tracing::warn!(conn = %conn, error = %err, "Transport error");
        self.emit(RpcEvent::ErrorOccurred {
            conn: Some(conn.clone()),
            error: Arc::new(err),
        });
    }

    fn handle_packet(&self, epoch: u64, conn: &ConnectionInfo, packet: &[u8]) {
        let envelope = match Envelope::from_bytes(packet) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(conn = %conn, bytes = packet.len(), error = %err, "Unrecognized frame");
                self.emit(RpcEvent::RawFrameUnrecognized {
                    conn: conn.clone(),
                    frame: packet.to_vec(),
                });
                return;
            }
        };

        if envelope.is_response() {
            self.complete_call(envelope);
        } else {
            self.serve(epoch, conn, envelope);
        }
    }

    fn complete_call(&self, envelope: Envelope) {
        let Some(record) = self.pending.lookup(envelope.id) else {
            // Cancelled, timed out, or never ours.
            tracing::debug!(call_id = envelope.id, "Dropping response with no pending call");
            return;
        };

        let delivered = record.complete(Completion::Reply {
            payload: envelope.payload,
            error: envelope.error,
        });
        if !delivered {
            tracing::debug!(call_id = envelope.id, "Dropping duplicate response");
        }
    }

    /// Answer a request from the peer on a spawned task, over the transport
    /// it arrived on.
    fn serve(&self, epoch: u64, conn: &ConnectionInfo, envelope: Envelope) {
        let id = envelope.id;
        let name = envelope.name.unwrap_or_default();

        let transport = self
            .attachment
            .read()
            .as_ref()
            .filter(|attachment| attachment.epoch == epoch)
            .map(|attachment| Arc::clone(&attachment.transport));
        let Some(transport) = transport else {
            tracing::debug!(conn = %conn, call_id = id, method = %name, "Dropping request from a replaced transport");
            return;
        };

        tracing::debug!(conn = %conn, call_id = id, method = %name, "Serving request");
        self.emit(RpcEvent::ServeRequested {
            id,
            name: name.clone(),
        });

        let methods = Arc::clone(&self.methods);
        let params = envelope.payload;
        tokio::spawn(async move {
            let reply = match methods.invoke(&name, params).await {
                Ok(payload) => Envelope::response(id, payload),
                Err(error) => Envelope::error_response(id, error),
            };

            let sent = reply
                .to_bytes()
                .map_err(|e| e.to_string())
                .and_then(|bytes| transport.send_bytes(bytes).map_err(|e| e.to_string()));
            if let Err(err) = sent {
                tracing::warn!(call_id = id, method = %name, error = %err, "Failed to send response");
            }
        });
    }
}
