//! Stream-socket transport with automatic reconnect.
//!
//! A [`SocketTransport`] owns one background task per logical connection. The
//! task dials (or adopts an accepted stream), reports `on_open`, then runs a
//! reader that forwards every frame to `on_packet` while it drains the
//! outbound queue onto the socket. When the stream ends it reports `on_close`
//! and, for dialed connections, redials after the retry delay.
//!
//! Construction is two-phase: [`SocketTransport::dial`] and
//! [`SocketTransport::accepted`] return the transport together with its
//! unstarted [`ConnectionTask`], so the owner can register the transport
//! before the first callback fires.
//!
//! Frames queued while no connection is up stay in the queue and are flushed
//! once the next connection is established.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::framing::{read_frame, write_frame};
use super::{ConnectionHandler, ConnectionInfo, Transport, TransportError};
use crate::config::ClientConfig;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Address of a peer: `tcp` host:port or `unix` socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(String),
    Unix(PathBuf),
}

impl Endpoint {
    /// Parse a `(network, address)` pair such as `("tcp", "127.0.0.1:7070")`.
    pub fn parse(network: &str, address: &str) -> Result<Self, TransportError> {
        if address.is_empty() {
            return Err(TransportError::InvalidEndpoint(format!(
                "empty address for network {network:?}"
            )));
        }

        match network.to_ascii_lowercase().as_str() {
            "tcp" | "tcp4" | "tcp6" => Ok(Endpoint::Tcp(address.to_string())),
            "unix" => Ok(Endpoint::Unix(PathBuf::from(address))),
            other => Err(TransportError::InvalidEndpoint(format!(
                "unsupported network {other:?} (expected \"tcp\" or \"unix\")"
            ))),
        }
    }

    /// Open a new connection to this endpoint.
    pub async fn dial(&self) -> Result<SocketStream, TransportError> {
        let connect_err = |source| TransportError::Connect {
            endpoint: self.to_string(),
            source,
        };

        match self {
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(connect_err)?;
                stream.set_nodelay(true).map_err(connect_err)?;
                Ok(SocketStream::from_tcp(stream, self.to_string()))
            }
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(connect_err)?;
                Ok(SocketStream::from_unix(stream, self.to_string()))
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(addr) => write!(f, "tcp://{addr}"),
            Endpoint::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A connected byte stream split into halves.
pub struct SocketStream {
    reader: BoxedReader,
    writer: BoxedWriter,
    peer: String,
}

impl SocketStream {
    pub fn from_tcp(stream: TcpStream, peer: impl Into<String>) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_parts(reader, writer, peer)
    }

    pub fn from_unix(stream: UnixStream, peer: impl Into<String>) -> Self {
        let (reader, writer) = stream.into_split();
        Self::from_parts(reader, writer, peer)
    }

    /// Wrap arbitrary read/write halves (e.g. `tokio::io::duplex`).
    pub fn from_parts<R, W>(reader: R, writer: W, peer: impl Into<String>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl fmt::Debug for SocketStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketStream")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Accepts inbound connections on an [`Endpoint`].
pub enum Listener {
    Tcp(TcpListener),
    Unix { listener: UnixListener, path: PathBuf },
}

impl Listener {
    /// Bind the endpoint. A leftover Unix socket file from a crashed process
    /// is removed first.
    pub async fn bind(endpoint: &Endpoint) -> std::io::Result<Self> {
        match endpoint {
            Endpoint::Tcp(addr) => Ok(Listener::Tcp(TcpListener::bind(addr).await?)),
            Endpoint::Unix(path) => {
                if path.exists() {
                    tracing::debug!(path = %path.display(), "Removing stale socket file");
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
        }
    }

    /// The bound endpoint (with the resolved port for `tcp` port 0).
    pub fn local_endpoint(&self) -> std::io::Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => Ok(Endpoint::Tcp(listener.local_addr()?.to_string())),
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
        }
    }

    /// Wait for the next inbound connection.
    pub async fn accept(&self) -> std::io::Result<SocketStream> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(SocketStream::from_tcp(stream, format!("tcp://{addr}")))
            }
            Listener::Unix { listener, path } => {
                let (stream, _) = listener.accept().await?;
                Ok(SocketStream::from_unix(
                    stream,
                    format!("unix://{}", path.display()),
                ))
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            if let Err(err) = std::fs::remove_file(&*path) {
                tracing::debug!(path = %path.display(), error = %err, "Could not remove socket file");
            }
        }
    }
}

/// Knobs for the connection task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Delay before redialing. `None` stops after the first connection ends.
    pub retry_delay: Option<Duration>,
    /// Largest inbound frame accepted.
    pub max_frame_size: usize,
}

impl From<&ClientConfig> for TransportOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            retry_delay: config.retry_delay,
            max_frame_size: config.max_frame_size,
        }
    }
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions::from(&ClientConfig::default())
    }
}

/// Where the connection task gets its streams from.
enum Source {
    Dial(Endpoint),
    Accepted(Option<SocketStream>),
}

impl Source {
    fn describe(&self) -> String {
        match self {
            Source::Dial(endpoint) => endpoint.to_string(),
            Source::Accepted(Some(stream)) => stream.peer.clone(),
            Source::Accepted(None) => "accepted".to_string(),
        }
    }

    /// Next stream to drive, or `None` when the source is exhausted or shut down.
    async fn next_stream(
        &mut self,
        shutdown: &CancellationToken,
    ) -> Option<Result<SocketStream, TransportError>> {
        match self {
            Source::Dial(endpoint) => tokio::select! {
                _ = shutdown.cancelled() => None,
                result = endpoint.dial() => Some(result),
            },
            Source::Accepted(_) if shutdown.is_cancelled() => None,
            Source::Accepted(stream) => stream.take().map(Ok),
        }
    }

    fn can_redial(&self) -> bool {
        matches!(self, Source::Dial(_))
    }
}

/// Frame transport over a TCP or Unix domain socket.
///
/// Dropping or closing the transport stops its connection task.
pub struct SocketTransport {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
}

/// The background half of a [`SocketTransport`]. Nothing is dialed, read or
/// reported to the handler until [`start`](Self::start) is called.
pub struct ConnectionTask {
    source: Source,
    options: TransportOptions,
    handler: Arc<dyn ConnectionHandler>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
}

impl ConnectionTask {
    /// Spawn the connection task. Must be called from within a Tokio runtime.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(run_connection(
            self.source,
            self.options,
            self.handler,
            self.outbound,
            self.shutdown,
        ))
    }
}

impl SocketTransport {
    /// Prepare a transport that dials `endpoint`, redialing per `options.retry_delay`.
    pub fn dial(
        endpoint: Endpoint,
        options: TransportOptions,
        handler: Arc<dyn ConnectionHandler>,
    ) -> (Self, ConnectionTask) {
        Self::prepare(Source::Dial(endpoint), options, handler)
    }

    /// Prepare a transport driving an already-accepted stream. No reconnect is attempted.
    pub fn accepted(
        stream: SocketStream,
        options: TransportOptions,
        handler: Arc<dyn ConnectionHandler>,
    ) -> (Self, ConnectionTask) {
        Self::prepare(Source::Accepted(Some(stream)), options, handler)
    }

    fn prepare(
        source: Source,
        options: TransportOptions,
        handler: Arc<dyn ConnectionHandler>,
    ) -> (Self, ConnectionTask) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let task = ConnectionTask {
            source,
            options,
            handler,
            outbound: rx,
            shutdown: shutdown.clone(),
        };
        (Self { outbound, shutdown }, task)
    }

    /// True once the transport has been closed or its task has finished.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled() || self.outbound.is_closed()
    }
}

impl Transport for SocketTransport {
    fn send_bytes(&self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Shutdown);
        }
        self.outbound
            .send(bytes)
            .map_err(|_| TransportError::Shutdown)
    }

    fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_connection(
    mut source: Source,
    options: TransportOptions,
    handler: Arc<dyn ConnectionHandler>,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: CancellationToken,
) {
    let mut generation = 0u64;

    loop {
        let Some(result) = source.next_stream(&shutdown).await else {
            break;
        };

        match result {
            Ok(stream) => {
                generation += 1;
                let info = ConnectionInfo::new(stream.peer.clone(), generation);
                tracing::info!(peer = %info.peer, generation, "Connection established");

                handler.on_open(&info);

                let outcome = drive(stream, &info, &handler, &mut outbound, &shutdown, options.max_frame_size).await;

                if let Err(err) = outcome {
                    tracing::warn!(peer = %info.peer, generation, error = %err, "Connection failed");
                    handler.on_error(&info, err);
                }

                tracing::info!(peer = %info.peer, generation, "Connection closed");
                handler.on_close(&info);
            }
            Err(err) => {
                tracing::debug!(endpoint = %source.describe(), error = %err, "Dial failed");
                let info = ConnectionInfo::new(source.describe(), generation);
                handler.on_error(&info, err);
            }
        }

        if shutdown.is_cancelled() || !source.can_redial() {
            break;
        }
        let Some(delay) = options.retry_delay else {
            break;
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // Refuse further sends from the client side.
    shutdown.cancel();
    outbound.close();
    tracing::debug!(endpoint = %source.describe(), "Transport task finished");
}

/// Pump one established stream until it ends, fails, or the transport shuts down.
async fn drive(
    stream: SocketStream,
    info: &ConnectionInfo,
    handler: &Arc<dyn ConnectionHandler>,
    outbound: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: &CancellationToken,
    max_frame_size: usize,
) -> Result<(), TransportError> {
    let SocketStream { reader, mut writer, .. } = stream;

    let reader_handler = Arc::clone(handler);
    let reader_info = info.clone();
    let mut read_task = tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        loop {
            match read_frame(&mut reader, max_frame_size).await {
                Ok(Some(frame)) => reader_handler.on_packet(&reader_info, &frame),
                Ok(None) => return Ok(()),
                Err(err) => return Err(TransportError::Connection(err)),
            }
        }
    });

    let result = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            joined = &mut read_task => {
                break match joined {
                    Ok(result) => result,
                    Err(err) => Err(TransportError::Connection(anyhow!("reader task failed: {err}"))),
                };
            }
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(err) = write_frame(&mut writer, &frame).await {
                        break Err(TransportError::Connection(err));
                    }
                }
                None => break Ok(()),
            }
        }
    };

    read_task.abort();
    let _ = writer.shutdown().await;
    result
}
