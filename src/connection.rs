//! MongoDB connection implementation.
//!
//! This module provides the connection type that handles:
//! - TCP connection establishment and the capability handshake
//! - Request id assignment in transmission order
//! - Pipelined request/reply correlation by `responseTo` id

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use bson::doc;
use bytes::BytesMut;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, error, trace, warn};

use crate::error::{MongoError, MongoResult};
use crate::metrics::{CommandTimer, NoopTimer};
use crate::protocol::{
    ClientRequest, MessageHeader, OpMessage, OpQuery, OpReply, ServerReply, HEADER_SIZE,
    MAX_MESSAGE_SIZE, OP_MSG_MIN_WIRE_VERSION,
};
use crate::session::SessionIdentifier;

// ============================================================================
// Connection Configuration
// ============================================================================

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct MongoConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 27017)
    pub port: u16,
}

impl MongoConfig {
    /// Parse a connection URL.
    ///
    /// Format: `mongodb://host:port`. Credentials are rejected: this layer
    /// performs no authentication.
    pub fn from_url(url: &str) -> MongoResult<Self> {
        let url = url
            .strip_prefix("mongodb://")
            .ok_or_else(|| MongoError::Protocol("Invalid URL scheme".to_string()))?;

        if url.contains('@') {
            return Err(MongoError::Protocol(
                "Authentication credentials are not supported".to_string(),
            ));
        }

        // Host with optional port; a trailing path segment is ignored.
        let host_port = url.split('/').next().unwrap_or(url);

        let (host, port) = if let Some(colon_pos) = host_port.rfind(':') {
            let port_str = &host_port[colon_pos + 1..];
            let port = port_str
                .parse::<u16>()
                .map_err(|_| MongoError::Protocol(format!("Invalid port: {}", port_str)))?;
            (host_port[..colon_pos].to_string(), port)
        } else {
            (host_port.to_string(), 27017)
        };

        if host.is_empty() {
            return Err(MongoError::Protocol("Missing host".to_string()));
        }

        Ok(Self { host, port })
    }
}

// ============================================================================
// Server Handshake
// ============================================================================

/// The negotiated capabilities of the server behind a connection.
///
/// Learned once at establishment and immutable thereafter.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHandshake {
    #[serde(default)]
    pub max_wire_version: i32,
    #[serde(default, alias = "ismaster")]
    pub is_writable_primary: bool,
    #[serde(default)]
    pub read_only: bool,
}

impl ServerHandshake {
    pub fn new(max_wire_version: i32, is_writable_primary: bool) -> Self {
        Self {
            max_wire_version,
            is_writable_primary,
            read_only: false,
        }
    }

    /// Single comparison point deciding modern vs. legacy framing.
    pub fn supports_op_msg(&self) -> bool {
        self.max_wire_version >= OP_MSG_MIN_WIRE_VERSION
    }

    /// Whether the node behind the connection currently accepts writes.
    pub fn is_writable(&self) -> bool {
        self.is_writable_primary && !self.read_only
    }
}

// ============================================================================
// Connection
// ============================================================================

type ReplySender = oneshot::Sender<MongoResult<ServerReply>>;

/// Outstanding calls keyed by request id. `None` once the connection is
/// past use: registration after that point fails instead of leaking.
type PendingReplies = Arc<Mutex<Option<HashMap<i32, ReplySender>>>>;

/// A connection to a MongoDB server.
///
/// Supports pipelining: many callers may execute concurrently on one
/// connection, with replies matched by `responseTo` id rather than by
/// submission order.
pub struct MongoConnection {
    /// Write half of the transport. The request id is assigned under this
    /// lock so ids are issued in transmission order.
    writer: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Calls awaiting a correlated reply.
    pending: PendingReplies,
    /// Next request id; wraps on overflow.
    request_id: AtomicI32,
    /// Capabilities learned from the handshake, set exactly once.
    handshake: OnceCell<ServerHandshake>,
    /// Connection-owned session, created lazily on first use.
    implicit_session: OnceCell<SessionIdentifier>,
    /// Duration sink for dispatched commands.
    timer: Mutex<Arc<dyn CommandTimer>>,
    closed: Arc<AtomicBool>,
}

impl MongoConnection {
    /// Connect to a server and learn its capabilities.
    pub async fn connect(url: &str) -> MongoResult<Arc<Self>> {
        let config = MongoConfig::from_url(url)?;
        Self::connect_with_config(config).await
    }

    /// Connect with explicit configuration.
    pub async fn connect_with_config(config: MongoConfig) -> MongoResult<Arc<Self>> {
        let addr = format!("{}:{}", config.host, config.port);
        let stream = TcpStream::connect(&addr).await.map_err(MongoError::Io)?;
        stream.set_nodelay(true).map_err(MongoError::Io)?;

        let connection = Self::start(stream);
        connection.handshake_hello().await?;
        Ok(connection)
    }

    /// Wire a connection over an established stream with pre-negotiated
    /// capabilities. This is the seam for custom transports and tests.
    pub fn over_stream<S>(stream: S, handshake: ServerHandshake) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Self::start(stream);
        let _ = connection.handshake.set(handshake);
        connection
    }

    fn start<S>(stream: S) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        let pending: PendingReplies = Arc::new(Mutex::new(Some(HashMap::new())));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(read_replies(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&closed),
        ));

        Arc::new(Self {
            writer: AsyncMutex::new(Box::new(BufWriter::new(write_half))),
            pending,
            request_id: AtomicI32::new(0),
            handshake: OnceCell::new(),
            implicit_session: OnceCell::new(),
            timer: Mutex::new(Arc::new(NoopTimer)),
            closed,
        })
    }

    /// Learn the server's wire version and writability with a `hello`
    /// command, sent over legacy framing since no capability is known yet.
    async fn handshake_hello(&self) -> MongoResult<()> {
        let query = OpQuery::new(doc! { "hello": 1 }, 0, "admin.$cmd".to_string());
        let reply = self.execute_op_query(query).await?;

        let body = reply
            .documents
            .first()
            .ok_or_else(|| MongoError::Handshake("Empty hello reply".to_string()))?;
        let handshake: ServerHandshake = bson::from_document(body.clone())?;

        debug!(
            max_wire_version = handshake.max_wire_version,
            writable = handshake.is_writable(),
            "Negotiated server capabilities"
        );

        self.handshake
            .set(handshake)
            .map_err(|_| MongoError::Handshake("Handshake already performed".to_string()))
    }

    /// The negotiated capabilities of this connection.
    pub fn server_handshake(&self) -> MongoResult<&ServerHandshake> {
        self.handshake
            .get()
            .ok_or_else(|| MongoError::Handshake("Handshake not performed".to_string()))
    }

    /// Whether the node behind this connection currently accepts writes.
    pub fn is_writable(&self) -> bool {
        self.handshake
            .get()
            .map(ServerHandshake::is_writable)
            .unwrap_or(false)
    }

    /// Unique, strictly increasing (mod wraparound) id per call. Safe under
    /// concurrent callers.
    pub fn next_request_id(&self) -> i32 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Connection-owned session, used when the caller supplies none.
    pub fn implicit_session_id(&self) -> &SessionIdentifier {
        self.implicit_session.get_or_init(SessionIdentifier::random)
    }

    /// Install a timer that receives one duration sample per command.
    pub fn set_command_timer(&self, timer: Arc<dyn CommandTimer>) {
        *self.timer.lock() = timer;
    }

    pub(crate) fn command_timer(&self) -> Arc<dyn CommandTimer> {
        Arc::clone(&self.timer.lock())
    }

    /// Number of calls currently awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().as_ref().map_or(0, HashMap::len)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the connection, failing all outstanding calls.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        fail_pending(&self.pending);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Transmit a framed request and await its correlated reply.
    ///
    /// The request id is assigned just before transmission, under the
    /// writer lock, so ids on the wire are in transmission order.
    pub async fn execute_request(&self, mut request: ClientRequest) -> MongoResult<ServerReply> {
        if self.is_closed() {
            return Err(MongoError::ConnectionClosed);
        }

        let receiver = {
            let mut writer = self.writer.lock().await;

            let request_id = self.next_request_id();
            request.set_request_id(request_id);
            let encoded = request.encode()?;

            let (sender, receiver) = oneshot::channel();
            self.register(request_id, sender)?;

            trace!(request_id, "Transmitting request");
            if let Err(err) = transmit(&mut writer, &encoded).await {
                // A failed write leaves the stream in an unknown state:
                // no new work may be submitted on this connection.
                self.remove_pending(request_id);
                self.closed.store(true, Ordering::Release);
                warn!("Transport write failed: {}", err);
                return Err(MongoError::Io(err));
            }

            receiver
        };

        match receiver.await {
            Ok(result) => result,
            // Reader task dropped the channel without answering.
            Err(_) => Err(MongoError::ConnectionClosed),
        }
    }

    /// Execute a legacy query, expecting a legacy reply.
    pub async fn execute_op_query(&self, query: OpQuery) -> MongoResult<OpReply> {
        match self.execute_request(ClientRequest::Query(query)).await? {
            ServerReply::Reply(reply) => Ok(reply),
            ServerReply::Message(_) => {
                error!("Unexpected reply type, expected OP_REPLY");
                Err(MongoError::InvalidReplyType {
                    expected: "OP_REPLY",
                })
            }
        }
    }

    /// Execute a modern message, expecting a modern reply.
    pub async fn execute_op_message(&self, message: OpMessage) -> MongoResult<OpMessage> {
        match self.execute_request(ClientRequest::Message(message)).await? {
            ServerReply::Message(message) => Ok(message),
            ServerReply::Reply(_) => {
                error!("Unexpected reply type, expected OP_MSG");
                Err(MongoError::InvalidReplyType { expected: "OP_MSG" })
            }
        }
    }

    fn register(&self, request_id: i32, sender: ReplySender) -> MongoResult<()> {
        let mut pending = self.pending.lock();
        match pending.as_mut() {
            Some(map) => {
                map.insert(request_id, sender);
                Ok(())
            }
            None => Err(MongoError::ConnectionClosed),
        }
    }

    fn remove_pending(&self, request_id: i32) {
        if let Some(map) = self.pending.lock().as_mut() {
            map.remove(&request_id);
        }
    }
}

// ============================================================================
// Reader task
// ============================================================================

async fn transmit(
    writer: &mut Box<dyn AsyncWrite + Send + Unpin>,
    encoded: &[u8],
) -> std::io::Result<()> {
    writer.write_all(encoded).await?;
    writer.flush().await
}

/// Reads frames off the transport and routes each reply to the caller it
/// answers. On transport failure, fails every outstanding call and marks
/// the connection closed.
async fn read_replies<R>(mut reader: R, pending: PendingReplies, closed: Arc<AtomicBool>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(32768);

    'read: loop {
        // Drain all complete frames in the buffer.
        while buffer.len() >= 4 {
            let length =
                i32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]) as usize;

            if length < HEADER_SIZE || length > MAX_MESSAGE_SIZE {
                error!(length, "Invalid frame length, closing connection");
                break 'read;
            }
            if buffer.len() < length {
                break;
            }

            let mut frame = buffer.split_to(length).freeze();
            let header = match MessageHeader::read_from(&mut frame) {
                Ok(header) => header,
                Err(err) => {
                    // Framing itself is broken; correlation is impossible.
                    error!("Unreadable reply header: {}", err);
                    break 'read;
                }
            };

            // Body-level failures are scoped to the one call they answer.
            let result = ServerReply::read_from(header, frame);
            route(&pending, header.response_to, result);
        }

        let mut chunk = [0u8; 4096];
        match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!("Transport closed by peer");
                break;
            }
            Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            Err(err) => {
                error!("Transport read failed: {}", err);
                break;
            }
        }
    }

    closed.store(true, Ordering::Release);
    fail_pending(&pending);
}

fn route(pending: &PendingReplies, response_to: i32, result: MongoResult<ServerReply>) {
    let sender = pending
        .lock()
        .as_mut()
        .and_then(|map| map.remove(&response_to));

    match sender {
        // A send error means the caller abandoned the operation; its reply
        // is discarded.
        Some(sender) => drop(sender.send(result)),
        None => debug!(response_to, "Discarding uncorrelated reply"),
    }
}

/// Fail every outstanding call and refuse future registrations.
fn fail_pending(pending: &PendingReplies) {
    let senders = pending.lock().take();
    if let Some(map) = senders {
        for (_, sender) in map {
            let _ = sender.send(Err(MongoError::ConnectionClosed));
        }
    }
}
