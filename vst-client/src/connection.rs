//! A single VelocyStream connection
//!
//! One socket, many requests. Writers take the per-connection write lock for
//! the duration of one message so its chunks go out contiguously; a
//! background reader task reassembles incoming chunks and completes the
//! matching entries in the connection's [`MessageStore`].
//!
//! ```text
//! open() ──► Connecting ──► authenticate() ──► Authenticating ──► Ready
//!                │                                   │              │
//!                └──────────── error ────────────────┴──────────────┴──► Closed
//! ```

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use vst_core::{Host, VST_PREAMBLE};
use vst_network::{ChunkBuffer, MessageAssembler, TlsConnector, encode_chunks, encode_message, parse_chunk};

use crate::codec::Serializer;
use crate::error::{ClientError, Result, TransportError};
use crate::request::Credentials;
use crate::store::{FailureKind, MessageStore, ResponseReceiver};

const READ_SIZE: usize = 16 * 1024;

/// Wrapper enum for TCP and TLS streams to avoid dynamic dispatch
#[allow(clippy::large_enum_variant)]
pub enum ClientStream {
    /// Plain TCP connection
    Tcp(TcpStream),
    /// TLS-encrypted connection
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            ClientStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            ClientStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            ClientStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Authenticating = 2,
    Ready = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Disconnected,
            1 => Self::Connecting,
            2 => Self::Authenticating,
            3 => Self::Ready,
            _ => Self::Closed,
        }
    }
}

/// Everything needed to open a connection to any host.
#[derive(Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    /// Maximum payload bytes per outgoing chunk
    pub chunk_size: usize,
    /// TLS connector; `None` means plain TCP
    pub tls: Option<TlsConnector>,
    /// SNI name; defaults to the host address
    pub server_name: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            chunk_size: vst_core::DEFAULT_CHUNK_SIZE,
            tls: None,
            server_name: None,
        }
    }
}

pub struct Connection {
    id: u64,
    host: Host,
    chunk_size: usize,
    state: Arc<AtomicU8>,
    writer: Mutex<WriteHalf<ClientStream>>,
    store: Arc<MessageStore>,
    next_message_id: AtomicU64,
    created_at: Instant,
    /// Milliseconds since `created_at` of the last send
    last_used_ms: AtomicU64,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Connect to `host`, send the VelocyStream preamble and start the reader.
    pub async fn open(id: u64, host: &Host, settings: &ConnectionSettings) -> Result<Arc<Self>> {
        debug!(conn_id = id, host = %host, "Connecting");

        let stream = tokio::time::timeout(settings.connect_timeout, Self::establish(host, settings))
            .await
            .map_err(|_| TransportError::ConnectFailed {
                host: host.clone(),
                source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
            })??;

        let (read_half, write_half) = tokio::io::split(stream);
        let store = Arc::new(MessageStore::new());
        let state = Arc::new(AtomicU8::new(ConnectionState::Connecting as u8));

        let reader = tokio::spawn(read_loop(id, read_half, store.clone(), state.clone()));

        debug!(conn_id = id, host = %host, tls = settings.tls.is_some(), "Connected");

        Ok(Arc::new(Self {
            id,
            host: host.clone(),
            chunk_size: settings.chunk_size,
            state,
            writer: Mutex::new(write_half),
            store,
            next_message_id: AtomicU64::new(1),
            created_at: Instant::now(),
            last_used_ms: AtomicU64::new(0),
            reader: std::sync::Mutex::new(Some(reader)),
        }))
    }

    async fn establish(host: &Host, settings: &ConnectionSettings) -> Result<ClientStream> {
        let connect_failed = |source| TransportError::ConnectFailed {
            host: host.clone(),
            source,
        };

        let tcp = TcpStream::connect((host.address(), host.port()))
            .await
            .map_err(connect_failed)?;
        tcp.set_nodelay(true).map_err(connect_failed)?;

        let mut stream = match &settings.tls {
            Some(connector) => {
                let server_name = settings
                    .server_name
                    .clone()
                    .unwrap_or_else(|| host.address().to_string());
                let tls = connector
                    .connect(&server_name, tcp)
                    .await
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
                ClientStream::Tls(tls)
            },
            None => ClientStream::Tcp(tcp),
        };

        stream.write_all(VST_PREAMBLE).await.map_err(TransportError::Io)?;
        stream.flush().await.map_err(TransportError::Io)?;
        Ok(stream)
    }

    /// Run the authentication handshake. Must complete before the connection
    /// is used for anything else; without credentials this only marks the
    /// connection Ready.
    pub async fn authenticate(
        self: &Arc<Self>,
        credentials: Option<&Credentials>,
        serializer: &dyn Serializer,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let Some(credentials) = credentials else {
            self.set_state(ConnectionState::Ready);
            return Ok(());
        };

        self.set_state(ConnectionState::Authenticating);
        debug!(conn_id = self.id, host = %self.host, "Authenticating");

        let result = self.handshake(credentials, serializer, timeout).await;
        match result {
            Ok(()) => {
                self.set_state(ConnectionState::Ready);
                debug!(conn_id = self.id, host = %self.host, "Authenticated");
                Ok(())
            },
            Err(e) => {
                warn!(conn_id = self.id, host = %self.host, error = %e, "Authentication failed");
                self.close();
                Err(e)
            },
        }
    }

    async fn handshake(
        self: &Arc<Self>,
        credentials: &Credentials,
        serializer: &dyn Serializer,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let payload = serializer.encode_authentication(credentials)?;
        let message = self.request(payload, timeout).await?;
        let response = serializer.decode_response(message.payload)?;

        if response.is_success() {
            return Ok(());
        }

        let code = response.response_code;
        let reason = response
            .body
            .as_deref()
            .and_then(|body| serializer.decode_error(code, body).ok())
            .map_or_else(
                || format!("Response Code: {}", code),
                |e| e.to_string(),
            );
        Err(ClientError::Authentication(reason))
    }

    /// Register, chunk and write one message. The returned handle resolves
    /// once the response has been reassembled.
    ///
    /// Dropping the returned future while the chunks are being written closes
    /// the connection, since a partly written message leaves the stream
    /// unusable for every later message.
    pub async fn send(self: &Arc<Self>, payload: Bytes) -> Result<PendingResponse> {
        if self.state() == ConnectionState::Closed {
            return Err(TransportError::ConnectionLost("connection is closed".into()).into());
        }

        let mut writer = self.writer.lock().await;

        // Ids are handed out under the write lock, so they reach the wire in
        // order and a payload that fails to encode does not consume one.
        let message_id = self.next_message_id.load(Ordering::Relaxed);
        let chunks = encode_message(message_id, &payload, self.chunk_size)?;
        self.next_message_id.store(message_id + 1, Ordering::Relaxed);
        let buf = encode_chunks(&chunks);

        let receiver = self.store.register(message_id);

        // The reader may have closed the connection and drained the store
        // between the check above and the registration.
        if self.state() == ConnectionState::Closed {
            self.store.remove(message_id);
            return Err(TransportError::ConnectionLost("connection is closed".into()).into());
        }

        let guard = SendGuard {
            conn: self,
            message_id,
            armed: true,
        };
        let written = match writer.write_all(&buf).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            warn!(conn_id = self.id, host = %self.host, error = %e, "Write failed");
            drop(guard);
            return Err(TransportError::Io(e).into());
        }
        guard.disarm();
        drop(writer);

        self.touch();
        trace!(
            conn_id = self.id,
            message_id,
            chunks = chunks.len(),
            bytes = buf.len(),
            "Message sent"
        );

        Ok(PendingResponse {
            message_id,
            receiver: Some(receiver),
            connection: self.clone(),
        })
    }

    /// Send and wait for the response.
    pub async fn request(
        self: &Arc<Self>,
        payload: Bytes,
        timeout: Option<Duration>,
    ) -> Result<vst_network::Message> {
        self.send(payload).await?.wait(timeout).await
    }

    /// Mark the connection Closed, stop the reader and fail everything pending.
    pub fn close(&self) {
        let previous = self.state.swap(ConnectionState::Closed as u8, Ordering::AcqRel);
        if let Some(reader) = self
            .reader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }

        let failed = self
            .store
            .fail_all(&FailureKind::ConnectionLost("connection closed".into()));
        if ConnectionState::from_u8(previous) != ConnectionState::Closed {
            debug!(conn_id = self.id, host = %self.host, failed, "Connection closed");
        }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        // Closed is terminal.
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ConnectionState::Closed as u8).then_some(state as u8)
            });
    }

    /// Ready for requests from the pool.
    #[inline]
    pub fn is_usable(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Whether the connection has been idle longer than `ttl`.
    pub fn is_expired(&self, ttl: Option<Duration>) -> bool {
        match ttl {
            Some(ttl) => self.idle_for() > ttl,
            None => false,
        }
    }

    pub fn idle_for(&self) -> Duration {
        let last_used = Duration::from_millis(self.last_used_ms.load(Ordering::Relaxed));
        self.created_at.elapsed().saturating_sub(last_used)
    }

    pub fn touch(&self) {
        let elapsed = u64::try_from(self.created_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_used_ms.store(elapsed, Ordering::Relaxed);
    }

    /// Requests sent on this connection still waiting for a response.
    pub fn pending(&self) -> usize {
        self.store.len()
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Ok(mut reader) = self.reader.lock() {
            if let Some(reader) = reader.take() {
                reader.abort();
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("state", &self.state())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Closes the connection unless the message it covers was written in full.
struct SendGuard<'a> {
    conn: &'a Connection,
    message_id: u64,
    armed: bool,
}

impl SendGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(
            conn_id = self.conn.id,
            message_id = self.message_id,
            "Send interrupted, closing connection"
        );
        self.conn.store.remove(self.message_id);
        self.conn.close();
    }
}

/// Handle to a sent request. Dropping it abandons the response; nothing is
/// sent to the server.
pub struct PendingResponse {
    message_id: u64,
    receiver: Option<ResponseReceiver>,
    connection: Arc<Connection>,
}

impl PendingResponse {
    pub fn message_id(&self) -> u64 {
        self.message_id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Wait for the response. A timeout is treated as a stalled read: the
    /// connection is closed, failing every other request pending on it.
    pub async fn wait(mut self, timeout: Option<Duration>) -> Result<vst_network::Message> {
        let Some(receiver) = self.receiver.take() else {
            return Err(TransportError::ConnectionLost("response already consumed".into()).into());
        };

        let received = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(
                        conn_id = self.connection.id,
                        host = %self.connection.host,
                        message_id = self.message_id,
                        ?timeout,
                        "Request timed out, closing connection"
                    );
                    self.connection.store.remove(self.message_id);
                    self.connection.close();
                    return Err(TransportError::Timeout.into());
                },
            },
            None => receiver.await,
        };

        received.map_err(|_| {
            ClientError::Transport(TransportError::ConnectionLost(
                "connection dropped before the response arrived".into(),
            ))
        })?
    }
}

impl std::fmt::Debug for PendingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResponse")
            .field("message_id", &self.message_id)
            .field("conn_id", &self.connection.id)
            .field("consumed", &self.receiver.is_none())
            .finish()
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        if self.receiver.is_some() {
            self.connection.store.remove(self.message_id);
        }
    }
}

async fn read_loop(
    conn_id: u64,
    mut reader: ReadHalf<ClientStream>,
    store: Arc<MessageStore>,
    state: Arc<AtomicU8>,
) {
    let mut buffer = ChunkBuffer::new();
    let mut assembler = MessageAssembler::new();

    let failure = loop {
        match reader.read_buf(buffer.read_buf(READ_SIZE)).await {
            Ok(0) => break FailureKind::ConnectionLost("connection closed by server".into()),
            Ok(_) => {},
            Err(e) => break FailureKind::ConnectionLost(e.to_string()),
        }

        if let Err(e) = drain_chunks(conn_id, &mut buffer, &mut assembler, &store) {
            warn!(conn_id, error = %e, desync = e.is_desync(), "Protocol violation, closing connection");
            break FailureKind::Protocol(e.to_string());
        }
        buffer.compact();
    };

    state.store(ConnectionState::Closed as u8, Ordering::Release);
    assembler.clear();
    let failed = store.fail_all(&failure);
    debug!(conn_id, failed, reason = ?failure, "Reader stopped");
}

fn drain_chunks(
    conn_id: u64,
    buffer: &mut ChunkBuffer,
    assembler: &mut MessageAssembler,
    store: &MessageStore,
) -> vst_core::Result<()> {
    while let Some((chunk, consumed)) = parse_chunk(buffer.as_slice())? {
        buffer.consume(consumed);
        if let Some(message) = assembler.feed(chunk)? {
            trace!(conn_id, message_id = message.id, len = message.payload.len(), "Response received");
            store.complete(message);
        }
    }
    Ok(())
}
