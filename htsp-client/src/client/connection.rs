//! TCP connection to the HTSP server.
//!
//! A [`Connection`] is single-use: it is opened once, authenticated once and
//! discarded after the first transport fault. Two worker tasks run per
//! connection, one moving socket bytes into the [`ByteBuffer`] and one
//! framing, decoding and routing messages out of it.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use htsp_protocol::types::FIELD_SEQ;
use htsp_protocol::{
    decode_message, encode_message, method, ClientError, Field, Message, MessageBuilder,
    ProtocolError, DEFAULT_HTSP_PORT, HTSP_VERSION, LENGTH_PREFIX_SIZE, MAX_FRAME_SIZE,
};

use crate::client::buffer::ByteBuffer;
use crate::client::pending::PendingRequests;

/// Socket read size.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    /// Transport fault or stop; the connection must be replaced.
    Faulted,
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub htsp_port: u16,
    pub username: String,
    pub password: String,
    /// Client name announced in `hello`.
    pub client_name: String,
    pub client_version: String,
    /// Delay between connection attempts.
    pub retry_interval: Duration,
    /// Upper bound for channel and event requests made through the supervisor.
    pub request_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            htsp_port: DEFAULT_HTSP_PORT,
            username: String::new(),
            password: String::new(),
            client_name: format!("htsp-client-{}", env!("CARGO_PKG_VERSION")),
            client_version: HTSP_VERSION.to_string(),
            retry_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Receiver of everything the server sends that is not a reply.
pub trait ConnectionListener: Send + Sync {
    /// An unsolicited message (no `seq`), in the order it was framed.
    fn on_message(&self, message: Message);

    /// The connection faulted. Called at most once per connection.
    fn on_error(&self, error: &ClientError);
}

/// Manages one TCP connection to the HTSP server.
pub struct Connection {
    client_name: String,
    client_version: String,
    retry_interval: Duration,
    /// Current state.
    state: Mutex<ConnectionState>,
    /// Last sequence number handed out.
    seq: AtomicI32,
    /// Requests awaiting a reply.
    pending: PendingRequests,
    /// Bytes read from the socket, not yet framed.
    buffer: ByteBuffer,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Observed by both workers.
    shutdown: CancellationToken,
    listener: Arc<dyn ConnectionListener>,
}

impl Connection {
    /// Create a new, unopened connection.
    pub fn new(config: &ConnectionConfig, listener: Arc<dyn ConnectionListener>) -> Arc<Self> {
        Arc::new(Self {
            client_name: config.client_name.clone(),
            client_version: config.client_version.clone(),
            retry_interval: config.retry_interval,
            state: Mutex::new(ConnectionState::Disconnected),
            seq: AtomicI32::new(0),
            pending: PendingRequests::new(),
            buffer: ByteBuffer::new(),
            writer: tokio::sync::Mutex::new(None),
            shutdown: CancellationToken::new(),
            listener,
        })
    }

    /// Get the current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// True once the connection has faulted or been stopped.
    pub fn needs_restart(&self) -> bool {
        self.state() == ConnectionState::Faulted
    }

    /// Number of requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Connect to the server, retrying every `retry_interval` until it
    /// succeeds or `cancel` fires, then start the worker tasks.
    pub async fn open(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
                ConnectionState::Faulted => return Err(ClientError::ConnectionLost),
                other => {
                    warn!("open: already opened, state = {:?}", other);
                    return Ok(());
                }
            }
        }

        let stream = loop {
            let attempt = tokio::select! {
                result = connect_tcp(host, port) => result,
                _ = cancel.cancelled() => {
                    self.stop();
                    return Err(ClientError::Cancelled);
                }
                _ = self.shutdown.cancelled() => return Err(ClientError::ConnectionLost),
            };

            match attempt {
                Ok(stream) => break stream,
                Err(e) => error!("Failed to connect to {}:{}: {}", host, port, e),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.retry_interval) => {}
                _ = cancel.cancelled() => {
                    self.stop();
                    return Err(ClientError::Cancelled);
                }
                _ = self.shutdown.cancelled() => return Err(ClientError::ConnectionLost),
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        let (reader, writer) = stream.into_split();
        *self.writer.lock().await = Some(writer);

        if self.shutdown.is_cancelled() {
            return Err(ClientError::ConnectionLost);
        }
        info!("Socket connected to {}:{}", host, port);

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.receive_loop(reader).await;
            debug!("Receive worker ended");
        });

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.frame_loop().await;
            debug!("Frame worker ended");
        });

        Ok(())
    }

    /// Run the hello / authenticate / enableAsyncMetadata exchange.
    ///
    /// The connection is `Ready` only after all three replies arrived.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ClientError> {
        info!("Authenticating as '{}'", username);
        self.transition(ConnectionState::Authenticating)?;

        let hello = Message::request(method::HELLO)
            .field("clientname", self.client_name.as_str())
            .field("clientversion", self.client_version.as_str())
            .field("htspversion", HTSP_VERSION)
            .field("username", username);
        let hello_reply = self.send(hello, cancel).await?;

        let challenge = match hello_reply.get("challenge") {
            Some(Field::Bytes(challenge)) => challenge.to_vec(),
            _ => {
                info!("hello reply carries no 'challenge' field; authenticating with an empty challenge");
                Vec::new()
            }
        };

        let auth = Message::request(method::AUTHENTICATE)
            .field("username", username)
            .field("digest", salted_digest(password, &challenge));
        let auth_reply = self.send(auth, cancel).await?;

        let denied = matches!(auth_reply.get("noaccess"), Some(Field::Int(1)));
        info!("authenticated = {}", !denied);
        if denied {
            self.stop();
            return Err(ClientError::AuthenticationFailed);
        }

        self.send(Message::request(method::ENABLE_ASYNC_METADATA), cancel)
            .await?;

        self.transition(ConnectionState::Ready)?;
        info!("Connection ready");
        Ok(())
    }

    /// Send a request and wait for the reply carrying the same sequence number.
    ///
    /// Cancelling `cancel` abandons only this request. If the connection
    /// faults first, the request fails with `ConnectionLost`.
    pub async fn send(
        &self,
        message: MessageBuilder,
        cancel: &CancellationToken,
    ) -> Result<Message, ClientError> {
        if self.needs_restart() {
            return Err(ClientError::ConnectionLost);
        }

        let seq = self.next_seq();
        let message = message.field(FIELD_SEQ, seq).build();
        let frame = encode_message(&message)?;
        trace!("Sending {}", message);

        // Register before writing: the reply can arrive before write_all returns.
        let mut slot = self.pending.register(seq);

        // Set while this request owns the writer and the frame is not fully out.
        let writing = AtomicBool::new(false);
        let written = tokio::select! {
            result = self.write_frame(seq, &frame, &writing) => result,
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            _ = self.shutdown.cancelled() => Err(ClientError::ConnectionLost),
        };
        if let Err(e) = written {
            if writing.load(Ordering::Acquire) {
                // A partial frame leaves the stream unusable.
                warn!("Request seq={} abandoned mid-write: {}", seq, e);
                self.fault(ClientError::ConnectionLost);
            }
            return Err(e);
        }

        tokio::select! {
            reply = slot.wait() => reply,
            _ = cancel.cancelled() => {
                debug!("Request seq={} cancelled", slot.seq());
                Err(ClientError::Cancelled)
            }
        }
    }

    async fn write_frame(
        &self,
        seq: i32,
        frame: &[u8],
        writing: &AtomicBool,
    ) -> Result<(), ClientError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ClientError::NotConnected)?;
        writing.store(true, Ordering::Release);
        if let Err(e) = writer.write_all(frame).await {
            error!("Failed to send request seq={}: {}", seq, e);
            return Err(ClientError::ConnectionLost);
        }
        writing.store(false, Ordering::Release);
        Ok(())
    }

    /// Stop both workers, close the socket and mark the connection faulted.
    ///
    /// Does not wait for the workers to exit. Safe to call repeatedly.
    pub fn stop(&self) {
        let was = std::mem::replace(&mut *self.state.lock(), ConnectionState::Faulted);
        if was != ConnectionState::Faulted {
            info!("Stopping connection (state was {:?})", was);
        }
        self.shutdown_workers();
    }

    fn fault(&self, error: ClientError) {
        let was = std::mem::replace(&mut *self.state.lock(), ConnectionState::Faulted);
        self.shutdown_workers();
        if was != ConnectionState::Faulted {
            error!("Connection faulted: {}", error);
            self.listener.on_error(&error);
        }
    }

    fn shutdown_workers(&self) {
        self.shutdown.cancel();
        self.buffer.close();
        self.pending.fail_all(ClientError::ConnectionLost);
        // A writer held by send() is released when that send observes
        // `shutdown` and faults, which lands back here.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
    }

    fn transition(&self, next: ConnectionState) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        if *state == ConnectionState::Faulted {
            return Err(ClientError::ConnectionLost);
        }
        info!("State {:?} -> {:?}", *state, next);
        *state = next;
        Ok(())
    }

    /// Next sequence number; wraps from `i32::MAX` to `i32::MIN`.
    fn next_seq(&self) -> i32 {
        self.seq.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    async fn receive_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let mut read_buf = BytesMut::with_capacity(READ_CHUNK_SIZE);

        loop {
            read_buf.clear();
            read_buf.reserve(READ_CHUNK_SIZE);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                result = reader.read_buf(&mut read_buf) => match result {
                    Ok(0) => {
                        info!("Connection closed by server");
                        break;
                    }
                    Ok(n) => {
                        trace!("Received {} bytes", n);
                        self.buffer.append(&read_buf[..n]);
                    }
                    Err(e) => {
                        error!("Socket read failed: {}", e);
                        break;
                    }
                },
            }
        }
        // The framer drains what is left, then faults the connection.
        self.buffer.close();
    }

    async fn frame_loop(self: Arc<Self>) {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                next = read_frame(&self.buffer) => next,
            };

            match next {
                Ok(Some(message)) => self.dispatch(message),
                Ok(None) => {
                    self.fault(ClientError::ConnectionLost);
                    break;
                }
                Err(e) => {
                    error!("Dropping connection after malformed message: {}", e);
                    self.fault(ClientError::MalformedMessage(e));
                    break;
                }
            }
        }
    }

    fn dispatch(&self, message: Message) {
        match message.seq() {
            Some(seq) => {
                let delivered = i32::try_from(seq)
                    .map(|seq| self.pending.complete(seq, message))
                    .unwrap_or(false);
                if !delivered {
                    warn!("No pending request for seq = {}; reply dropped", seq);
                }
            }
            None => {
                trace!("Push message: {:?}", message.method());
                self.listener.on_message(message);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Read and decode the next frame from the buffer.
///
/// Returns None once the buffer is closed and no complete frame remains.
pub(crate) async fn read_frame(buffer: &ByteBuffer) -> Result<Option<Message>, ProtocolError> {
    let body_len = match buffer.peek_length_prefix().await {
        Some(len) => len,
        None => return Ok(None),
    };
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body_len, MAX_FRAME_SIZE));
    }

    match buffer.take_exact(LENGTH_PREFIX_SIZE + body_len as usize).await {
        Some(frame) => decode_message(&frame).map(Some),
        None => Ok(None),
    }
}

/// SHA-1 over the password followed by the server challenge.
fn salted_digest(password: &str, challenge: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(password.as_bytes());
    hasher.update(challenge);
    hasher.finalize().to_vec()
}

async fn connect_tcp(host: &str, port: u16) -> std::io::Result<TcpStream> {
    let addr = resolve(host, port).await?;
    info!("Connecting to {}", addr);
    TcpStream::connect(addr).await
}

/// Numeric hosts are used as-is; names take the first lookup result.
async fn resolve(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    let ip = match host.parse::<IpAddr>() {
        Ok(ip) => ip,
        Err(_) => tokio::net::lookup_host((host, port))
            .await?
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no address found for '{}'", host),
                )
            })?,
    };
    Ok(SocketAddr::new(normalize_ip(ip), port))
}

fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
