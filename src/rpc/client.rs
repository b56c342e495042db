//! The RPC client: issues calls, waits for replies, serves the peer.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::config::ClientConfig;
use crate::error::{RpcError, TransportError};
use crate::protocol::Envelope;
use crate::transport::{
    ConnectionHandler, Endpoint, SocketStream, SocketTransport, Transport, TransportOptions,
};

use super::adapter::AttachedHandler;
use super::dispatch::MethodTable;
use super::events::{ConnectionState, EventSink, RpcEvent};
use super::id::next_call_id;
use super::pending::{Completion, PendingCall, PendingCalls};

/// The transport currently in use, tagged with the epoch its handler reports under.
pub(super) struct Attachment {
    pub(super) epoch: u64,
    pub(super) transport: Arc<dyn Transport>,
    handler: Arc<AttachedHandler>,
}

/// Shared client state. Transports reach it through an [`AttachedHandler`]
/// (see `adapter.rs`).
pub(crate) struct ClientInner {
    pub(super) config: ClientConfig,
    pub(super) pending: PendingCalls,
    pub(super) methods: Arc<MethodTable>,
    /// Calls register under the read lock; replacing the transport takes the
    /// write lock, so no call can straddle two attachments.
    pub(super) attachment: RwLock<Option<Attachment>>,
    next_epoch: AtomicU64,
    events: RwLock<Option<EventSink>>,
    state: watch::Sender<ConnectionState>,
}

impl ClientInner {
    /// Deliver an event to the sink. The sink is cloned out first so it never
    /// runs under a lock.
    pub(super) fn emit(&self, event: RpcEvent) {
        tracing::trace!(event = event.kind(), "Emitting event");
        let sink = self.events.read().clone();
        if let Some(sink) = sink {
            sink(&event);
        }
    }

    pub(super) fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Resolve every pending call with `ConnectionClosed`, leaving the registry empty.
    pub(super) fn fail_pending(&self) -> usize {
        let drained = self.pending.drain_all();
        let count = drained.len();
        for record in drained {
            if record.on_connection_closed() {
                tracing::debug!(
                    call_id = record.id(),
                    method = %record.method(),
                    elapsed_ms = record.elapsed().as_millis() as u64,
                    "Pending call resolved by connection close"
                );
            }
        }
        count
    }
}

/// Removes the pending record on every exit path of a call, including
/// cancellation, timeout, panics, and the call future being dropped.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    record: &'a PendingCall,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.record.release();
        self.pending.remove(self.record.id());
    }
}

/// Handle for making calls over one logical connection.
///
/// Cloning is cheap; all clones share the pending-call registry, the event
/// sink and the attached transport.
///
/// # Example
///
/// ```ignore
/// let client = RpcClient::new(ClientConfig::from_env());
/// client.connect("unix", "/run/user/1000/relayrpc.sock")?;
/// client.wait_connected().await;
///
/// let jobs: Vec<JobSummary> = client.call("jobs.list", &()).await?;
/// ```
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    pub fn new(config: ClientConfig) -> Self {
        Self::with_methods(config, Arc::new(MethodTable::new()))
    }

    /// Create a client that serves `methods` to its peer. The table may be
    /// shared with other clients.
    pub fn with_methods(config: ClientConfig, methods: Arc<MethodTable>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ClientInner {
                config,
                pending: PendingCalls::new(),
                methods,
                attachment: RwLock::new(None),
                next_epoch: AtomicU64::new(0),
                events: RwLock::new(None),
                state,
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Dial `address` over `network` (`tcp` or `unix`) in the background.
    ///
    /// Returns once the transport is started; use [`wait_connected`](Self::wait_connected)
    /// to wait for the connection itself. Dial failures are reported as
    /// [`RpcEvent::ErrorOccurred`] and retried per the configured retry delay.
    pub fn connect(&self, network: &str, address: &str) -> Result<(), TransportError> {
        self.connect_endpoint(Endpoint::parse(network, address)?);
        Ok(())
    }

    /// [`connect`](Self::connect) with an already parsed endpoint.
    pub fn connect_endpoint(&self, endpoint: Endpoint) {
        tracing::info!(endpoint = %endpoint, "Connecting");

        let handler = self.new_handler();
        let (transport, task) = SocketTransport::dial(
            endpoint,
            TransportOptions::from(&self.inner.config),
            handler.clone(),
        );
        self.install(Arc::new(transport), handler);
        task.start();
    }

    /// Serve an already-established stream (e.g. one accepted by a
    /// [`Listener`](crate::transport::Listener)). No reconnect is attempted.
    pub fn attach_stream(&self, stream: SocketStream) {
        tracing::debug!(peer = %stream.peer(), "Attaching accepted stream");

        let handler = self.new_handler();
        let (transport, task) = SocketTransport::accepted(
            stream,
            TransportOptions::from(&self.inner.config),
            handler.clone(),
        );
        self.install(Arc::new(transport), handler);
        task.start();
    }

    /// Route outbound frames through `transport`, replacing (and closing) any
    /// previously attached one.
    ///
    /// Returns the handler `transport` must report its lifecycle and inbound
    /// frames to. Once another transport is attached, lifecycle callbacks
    /// through this handler are ignored.
    pub fn attach(&self, transport: Arc<dyn Transport>) -> Arc<dyn ConnectionHandler> {
        let handler = self.new_handler();
        self.install(transport, handler.clone());
        handler
    }

    /// The handler of the currently attached transport.
    ///
    /// With nothing attached the returned handler is already stale and its
    /// callbacks are ignored.
    pub fn connection_handler(&self) -> Arc<dyn ConnectionHandler> {
        let current = self
            .inner
            .attachment
            .read()
            .as_ref()
            .map(|attachment| Arc::clone(&attachment.handler));
        let handler =
            current.unwrap_or_else(|| Arc::new(AttachedHandler::new(&self.inner, 0)));
        handler
    }

    fn new_handler(&self) -> Arc<AttachedHandler> {
        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed) + 1;
        Arc::new(AttachedHandler::new(&self.inner, epoch))
    }

    /// Make `transport` current. Calls sent on the previous transport are
    /// failed here; its later callbacks no longer match the current epoch.
    fn install(&self, transport: Arc<dyn Transport>, handler: Arc<AttachedHandler>) {
        let epoch = handler.epoch();
        let previous = {
            let mut slot = self.inner.attachment.write();
            let previous = slot.replace(Attachment {
                epoch,
                transport,
                handler,
            });
            if previous.is_some() {
                self.inner.set_state(ConnectionState::Disconnected);
                let failed = self.inner.fail_pending();
                if failed > 0 {
                    tracing::info!(count = failed, "Failed pending calls of the replaced transport");
                }
            }
            previous
        };

        if let Some(previous) = previous {
            tracing::debug!(old_epoch = previous.epoch, epoch, "Replacing transport");
            previous.transport.close();
        }
    }

    /// Replace the event sink.
    pub fn on_event<F>(&self, sink: F)
    where
        F: Fn(&RpcEvent) + Send + Sync + 'static,
    {
        *self.inner.events.write() = Some(Arc::new(sink));
    }

    /// Register a method the peer may call on this side.
    pub fn register_fn<Req, Resp, F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, String>> + Send + 'static,
    {
        self.inner.methods.register(name, handler);
    }

    pub fn methods(&self) -> &Arc<MethodTable> {
        &self.inner.methods
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub async fn wait_connected(&self) {
        self.wait_for_state(ConnectionState::Connected).await;
    }

    pub async fn wait_disconnected(&self) {
        self.wait_for_state(ConnectionState::Disconnected).await;
    }

    async fn wait_for_state(&self, target: ConnectionState) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives as long as `self`, so this only returns on a match.
        let _ = rx.wait_for(|state| *state == target).await;
    }

    /// Number of calls waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Stop the attached transport and resolve every pending call with
    /// [`RpcError::ConnectionClosed`].
    pub fn close(&self) {
        let previous = {
            let mut slot = self.inner.attachment.write();
            let failed = self.inner.fail_pending();
            if failed > 0 {
                tracing::info!(count = failed, "Failed pending calls on close");
            }
            self.inner.set_state(ConnectionState::Disconnected);
            slot.take()
        };

        if let Some(previous) = previous {
            tracing::info!(epoch = previous.epoch, "Closing transport");
            previous.transport.close();
        }
    }

    /// Call `name` on the peer and wait for its reply.
    ///
    /// Gives up after the configured call timeout.
    pub async fn call<Req, Resp>(&self, name: &str, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.call_with_cancel(&CancellationToken::new(), name, request)
            .await
    }

    /// Like [`call`](Self::call), but also gives up when `cancel` fires.
    ///
    /// Cancellation does not retract the request; a late reply is dropped.
    pub async fn call_with_cancel<Req, Resp>(
        &self,
        cancel: &CancellationToken,
        name: &str,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        match AssertUnwindSafe(self.call_inner(cancel, name, request))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(method = %name, panic = %message, "Call panicked");
                Err(RpcError::Panicked(message))
            }
        }
    }

    /// Run the call on a spawned task and hand the outcome to `callback` there.
    pub fn spawn_call<Req, Resp, F>(
        &self,
        cancel: CancellationToken,
        name: impl Into<String>,
        request: Req,
        callback: F,
    ) -> JoinHandle<()>
    where
        Req: Serialize + Send + Sync + 'static,
        Resp: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<Resp, RpcError>) + Send + 'static,
    {
        let client = self.clone();
        let name = name.into();
        tokio::spawn(async move {
            let result = client.call_with_cancel(&cancel, &name, &request).await;
            callback(result);
        })
    }

    async fn call_inner<Req, Resp>(
        &self,
        cancel: &CancellationToken,
        name: &str,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let inner = &self.inner;
        let id = next_call_id();

        let payload = codec::encode(request).map_err(RpcError::Encode)?;
        let frame = Envelope::request(id, name, payload)
            .to_bytes()
            .map_err(RpcError::Encode)?;

        let (record, rx) = PendingCall::new(id, name);
        let transport = {
            let slot = inner.attachment.read();
            let attachment = slot.as_ref().ok_or(RpcError::NotAttached)?;
            if !inner.pending.insert(Arc::clone(&record)) {
                return Err(RpcError::DuplicateCallId(id));
            }
            Arc::clone(&attachment.transport)
        };
        let _guard = PendingGuard {
            pending: &inner.pending,
            record: &record,
        };

        tracing::debug!(call_id = id, method = %name, bytes = frame.len(), "Sending request");
        if let Err(err) = transport.send_bytes(frame) {
            // Not attributable to this call alone; the call keeps waiting.
            tracing::warn!(call_id = id, method = %name, error = %err, "Failed to send request");
            inner.emit(RpcEvent::ErrorOccurred {
                conn: None,
                error: Arc::new(err),
            });
        }

        let timeout = inner.config.call_timeout;
        let completion = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!(call_id = id, method = %name, "Call cancelled");
                return Err(RpcError::Cancelled);
            }
            completion = rx => completion,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    call_id = id,
                    method = %name,
                    timeout_secs = timeout.as_secs(),
                    "Call timed out"
                );
                return Err(RpcError::TimedOut(timeout));
            }
        };

        match completion {
            Ok(Completion::Reply {
                error: Some(error), ..
            }) => {
                tracing::debug!(call_id = id, method = %name, "Peer reported an error");
                Err(RpcError::Remote(error))
            }
            Ok(Completion::Reply { payload, error: None }) => {
                tracing::debug!(
                    call_id = id,
                    method = %name,
                    elapsed_ms = record.elapsed().as_millis() as u64,
                    "Call completed"
                );
                codec::decode(&payload).map_err(RpcError::Decode)
            }
            Ok(Completion::ConnectionClosed) | Err(_) => Err(RpcError::ConnectionClosed),
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
