//! In-process HTSP server for tests.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use htsp_protocol::{decode_message, encode_message, ClientError, Message, MessageBuilder};

use crate::client::connection::{ConnectionConfig, ConnectionListener};

pub const TEST_PASSWORD: &str = "secret";

/// Config pointing at a local port with short retry and request timeouts.
pub fn test_config(port: u16) -> ConnectionConfig {
    ConnectionConfig {
        host: "127.0.0.1".to_string(),
        htsp_port: port,
        username: "user".to_string(),
        password: TEST_PASSWORD.to_string(),
        client_name: "htsp-client-test".to_string(),
        client_version: "1".to_string(),
        retry_interval: Duration::from_millis(20),
        request_timeout: Duration::from_secs(5),
    }
}

/// Start a reply carrying the request's `seq`.
pub fn reply_to(request: &Message) -> MessageBuilder {
    let seq = request.seq().expect("request without seq");
    MessageBuilder::new().field("seq", seq)
}

pub struct TestServer {
    listener: TcpListener,
}

/// Route library logs to the test output.
pub fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

impl TestServer {
    pub async fn bind() -> Self {
        init_logger();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    pub fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    pub async fn accept(&self) -> ServerConn {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(5), self.listener.accept())
            .await
            .expect("no client connected")
            .unwrap();
        ServerConn { stream }
    }

    /// Accept a connection if one arrives within `wait`.
    pub async fn try_accept(&self, wait: Duration) -> Option<ServerConn> {
        match tokio::time::timeout(wait, self.listener.accept()).await {
            Ok(accepted) => Some(ServerConn {
                stream: accepted.unwrap().0,
            }),
            Err(_) => None,
        }
    }
}

/// Server side of one client connection.
pub struct ServerConn {
    stream: TcpStream,
}

impl ServerConn {
    /// Read the next framed message from the client.
    pub async fn recv(&mut self) -> Message {
        let mut prefix = [0u8; 4];
        self.stream.read_exact(&mut prefix).await.unwrap();
        let len = u32::from_be_bytes(prefix) as usize;

        let mut frame = vec![0u8; 4 + len];
        frame[..4].copy_from_slice(&prefix);
        self.stream.read_exact(&mut frame[4..]).await.unwrap();
        decode_message(&frame).unwrap()
    }

    pub async fn send(&mut self, message: &Message) {
        let frame = encode_message(message).unwrap();
        self.send_raw(&frame).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Serve hello, authenticate and (when `accept` is set) enableAsyncMetadata.
    /// Returns the digest the client sent.
    pub async fn handshake(&mut self, challenge: Option<Vec<u8>>, accept: bool) -> Vec<u8> {
        let hello = self.recv().await;
        assert_eq!(hello.method(), Some("hello"));
        assert!(hello.get_str("clientname").is_ok());
        let mut reply = reply_to(&hello)
            .field("htspversion", 20)
            .field("servername", "test");
        if let Some(challenge) = challenge {
            reply = reply.field("challenge", challenge);
        }
        self.send(&reply.build()).await;

        let auth = self.recv().await;
        assert_eq!(auth.method(), Some("authenticate"));
        let digest = auth.get_bytes("digest").unwrap().to_vec();
        let noaccess = if accept { 0 } else { 1 };
        self.send(&reply_to(&auth).field("noaccess", noaccess).build())
            .await;

        if accept {
            let enable = self.recv().await;
            assert_eq!(enable.method(), Some("enableAsyncMetadata"));
            self.send(&reply_to(&enable).build()).await;
        }
        digest
    }

    /// Handshake with a fixed challenge, checking the digest against
    /// [`TEST_PASSWORD`].
    pub async fn accept_login(&mut self) {
        let challenge = vec![0xAB, 0xCD];
        let digest = self.handshake(Some(challenge.clone()), true).await;

        let mut hasher = Sha1::new();
        hasher.update(TEST_PASSWORD.as_bytes());
        hasher.update(&challenge);
        assert_eq!(digest, hasher.finalize().to_vec());
    }
}

/// Listener that records everything it is handed.
#[derive(Default)]
pub struct RecordingListener {
    messages: Mutex<Vec<Message>>,
    errors: Mutex<Vec<ClientError>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    pub fn errors(&self) -> Vec<ClientError> {
        self.errors.lock().clone()
    }

    pub async fn wait_for_messages(&self, n: usize) -> Vec<Message> {
        wait_until(|| self.messages.lock().len() >= n).await;
        self.messages()
    }

    pub async fn wait_for_errors(&self, n: usize) -> Vec<ClientError> {
        wait_until(|| self.errors.lock().len() >= n).await;
        self.errors()
    }
}

impl ConnectionListener for RecordingListener {
    fn on_message(&self, message: Message) {
        self.messages.lock().push(message);
    }

    fn on_error(&self, error: &ClientError) {
        self.errors.lock().push(error.clone());
    }
}

async fn wait_until(mut ready: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !ready() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
