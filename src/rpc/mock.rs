//! In-memory transport for client tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::protocol::Envelope;
use crate::transport::{ConnectionInfo, Transport};

use super::{RpcClient, RpcEvent};

/// Records every frame handed to it on a channel the test reads from.
pub(crate) struct MockTransport {
    frames: mpsc::UnboundedSender<Vec<u8>>,
    panic_on_send: bool,
    closed: AtomicBool,
}

impl MockTransport {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        Self::build(false)
    }

    /// A transport whose `send_bytes` panics.
    pub(crate) fn exploding() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        Self::build(true)
    }

    fn build(panic_on_send: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (frames, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            frames,
            panic_on_send,
            closed: AtomicBool::new(false),
        });
        (transport, rx)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.panic_on_send {
            panic!("mock transport exploded");
        }
        if self.is_closed() {
            return Err(TransportError::Shutdown);
        }
        self.frames
            .send(bytes)
            .map_err(|_| TransportError::Shutdown)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Client wired to a fresh [`MockTransport`].
pub(crate) fn attached_client(
    config: ClientConfig,
) -> (RpcClient, Arc<MockTransport>, mpsc::UnboundedReceiver<Vec<u8>>) {
    let client = RpcClient::new(config);
    let (transport, frames) = MockTransport::new();
    client.attach(transport.clone());
    (client, transport, frames)
}

pub(crate) fn conn() -> ConnectionInfo {
    ConnectionInfo::new("mock", 1)
}

/// Collect every event the client emits.
pub(crate) fn record_events(client: &RpcClient) -> Arc<Mutex<Vec<RpcEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    client.on_event(move |event| sink.lock().push(event.clone()));
    events
}

pub(crate) fn event_kinds(events: &Mutex<Vec<RpcEvent>>) -> Vec<&'static str> {
    events.lock().iter().map(RpcEvent::kind).collect()
}

/// Read the next frame the client sent and decode it.
pub(crate) async fn next_envelope(frames: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Envelope {
    let frame = frames.recv().await.expect("transport channel closed");
    Envelope::from_bytes(&frame).expect("client sent an invalid envelope")
}

/// Feed an envelope into the client as if it arrived from the peer.
pub(crate) fn deliver(client: &RpcClient, envelope: &Envelope) {
    let bytes = envelope.to_bytes().expect("encode envelope");
    client.connection_handler().on_packet(&conn(), &bytes);
}
