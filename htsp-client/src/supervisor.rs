//! Lazily (re)created connections and the per-target registry.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use htsp_protocol::{method, ChannelInfo, ClientError, Message, MessageBuilder, PushEvent};

use crate::channels::ChannelAggregator;
use crate::client::connection::{Connection, ConnectionConfig, ConnectionListener};

/// Progress of the initial push baseline on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Pending,
    Completed,
    /// The connection faulted before or after the sync.
    Lost,
}

/// Push intake of one connection.
struct EngineListener {
    channels: Arc<ChannelAggregator>,
    sync: watch::Sender<SyncState>,
}

impl ConnectionListener for EngineListener {
    fn on_message(&self, message: Message) {
        let event = match message.method() {
            Some(method) => PushEvent::from_method(method),
            None => {
                warn!("Push message without method: {}", message);
                return;
            }
        };

        match event {
            PushEvent::ChannelAdd | PushEvent::ChannelUpdate => self.channels.merge(&message),
            PushEvent::InitialSyncCompleted => {
                let first = self.sync.send_if_modified(|state| {
                    if *state == SyncState::Pending {
                        *state = SyncState::Completed;
                        true
                    } else {
                        false
                    }
                });
                if first {
                    info!("Initial sync completed ({} channels)", self.channels.len());
                }
            }
            PushEvent::TagAdd
            | PushEvent::TagUpdate
            | PushEvent::TagDelete
            | PushEvent::EventAdd
            | PushEvent::EventUpdate
            | PushEvent::EventDelete => {}
            PushEvent::Other(method) => trace!("Unhandled push '{}'", method),
        }
    }

    fn on_error(&self, error: &ClientError) {
        warn!("Connection lost ({}); reconnecting on next use", error);
        self.sync.send_replace(SyncState::Lost);
    }
}

#[derive(Clone)]
struct ActiveEngine {
    connection: Arc<Connection>,
    sync: watch::Receiver<SyncState>,
}

/// Owns at most one live [`Connection`] for a server target and rebuilds it
/// after a fault.
///
/// Channel records survive reconnects.
pub struct ConnectionSupervisor {
    config: ConnectionConfig,
    channels: Arc<ChannelAggregator>,
    active: Mutex<Option<ActiveEngine>>,
    /// Only one caller connects at a time; tokio's mutex queues the rest in FIFO order.
    gate: tokio::sync::Mutex<()>,
}

impl ConnectionSupervisor {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            channels: Arc::new(ChannelAggregator::new()),
            active: Mutex::new(None),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// True if a live connection has completed its initial sync.
    pub fn is_ready(&self) -> bool {
        self.live_engine()
            .map(|engine| *engine.sync.borrow() == SyncState::Completed)
            .unwrap_or(false)
    }

    /// Return a ready connection, creating and authenticating one if needed,
    /// and wait until its initial sync has completed.
    pub async fn ensure_connected(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Arc<Connection>, ClientError> {
        let engine = {
            let _gate = tokio::select! {
                gate = self.gate.lock() => gate,
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            };
            match self.live_engine() {
                Some(engine) => engine,
                None => self.start_engine(cancel).await?,
            }
        };

        let mut sync = engine.sync.clone();
        let state = tokio::select! {
            state = sync.wait_for(|state| *state != SyncState::Pending) => match state {
                Ok(state) => *state,
                Err(_) => SyncState::Lost,
            },
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
        };

        match state {
            SyncState::Completed => Ok(engine.connection),
            SyncState::Pending | SyncState::Lost => Err(ClientError::ConnectionLost),
        }
    }

    /// Send a request on the ready connection and return the raw reply.
    pub async fn send(
        &self,
        message: MessageBuilder,
        cancel: &CancellationToken,
    ) -> Result<Message, ClientError> {
        let connection = self.ensure_connected(cancel).await?;
        let result = connection.send(message, cancel).await;
        if let Err(e) = &result {
            if e.is_fatal() {
                warn!("Request failed ({}); the connection will be rebuilt", e);
            }
        }
        result
    }

    /// Send a request and hand the reply to `handler`.
    pub async fn send_with<T, F>(
        &self,
        message: MessageBuilder,
        handler: F,
        cancel: &CancellationToken,
    ) -> Result<T, ClientError>
    where
        F: FnOnce(Message) -> Result<T, ClientError>,
    {
        let reply = self.send(message, cancel).await?;
        handler(reply)
    }

    /// Snapshot of the channel list; does not connect.
    pub fn build_channel_infos(&self) -> Vec<ChannelInfo> {
        self.channels.build_channel_infos()
    }

    /// Connect if needed, wait for the initial sync, then list channels.
    pub async fn get_channels(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ChannelInfo>, ClientError> {
        self.with_timeout(cancel, |token| async move {
            self.ensure_connected(&token).await?;
            Ok(self.build_channel_infos())
        })
        .await
    }

    /// EPG events of one channel up to `max_time` (unix seconds).
    pub async fn get_events(
        &self,
        channel_id: i64,
        max_time: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>, ClientError> {
        let request = Message::request(method::GET_EVENTS)
            .field("channelId", channel_id)
            .field("maxTime", max_time);

        self.with_timeout(cancel, |token| async move {
            let reply = self.send(request, &token).await?;
            if !reply.contains("events") {
                debug!("No events for channel {}", channel_id);
                return Ok(Vec::new());
            }
            Ok(reply.get_list("events")?.to_vec())
        })
        .await
    }

    /// Stop the live connection, if any. The next request reconnects.
    pub fn stop(&self) {
        if let Some(engine) = self.active.lock().take() {
            info!("Stopping connection to {}", self.config.host);
            engine.connection.stop();
        }
    }

    fn live_engine(&self) -> Option<ActiveEngine> {
        self.active
            .lock()
            .as_ref()
            .filter(|engine| !engine.connection.needs_restart())
            .cloned()
    }

    async fn start_engine(&self, cancel: &CancellationToken) -> Result<ActiveEngine, ClientError> {
        if let Some(old) = self.active.lock().take() {
            debug!("Discarding faulted connection");
            old.connection.stop();
        }

        let (sync_tx, sync_rx) = watch::channel(SyncState::Pending);
        let listener = Arc::new(EngineListener {
            channels: Arc::clone(&self.channels),
            sync: sync_tx,
        });
        let connection = Connection::new(&self.config, listener);
        self.log_parameters();

        let result = async {
            connection
                .open(&self.config.host, self.config.htsp_port, cancel)
                .await?;
            connection
                .authenticate(
                    self.config.username.trim(),
                    self.config.password.trim(),
                    cancel,
                )
                .await
        }
        .await;

        if let Err(e) = result {
            error!("Failed to establish connection: {}", e);
            connection.stop();
            return Err(e);
        }

        let engine = ActiveEngine {
            connection,
            sync: sync_rx,
        };
        *self.active.lock() = Some(engine.clone());
        Ok(engine)
    }

    fn log_parameters(&self) {
        info!(
            "Connection parameters: host={} port={} user='{}' password={}",
            self.config.host,
            self.config.htsp_port,
            self.config.username.trim(),
            if self.config.password.trim().is_empty() {
                "<none>"
            } else {
                "<set>"
            }
        );
    }

    /// Run `op` with a token that fires on `cancel` or after
    /// `request_timeout`; the latter is reported as `Timeout`.
    async fn with_timeout<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, ClientError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let token = cancel.child_token();
        let fut = op(token.clone());
        tokio::pin!(fut);

        tokio::select! {
            result = &mut fut => result,
            _ = tokio::time::sleep(self.config.request_timeout) => {
                token.cancel();
                match fut.await {
                    Err(ClientError::Cancelled) if !cancel.is_cancelled() => {
                        warn!("Request timed out after {:?}", self.config.request_timeout);
                        Err(ClientError::Timeout)
                    }
                    other => other,
                }
            }
        }
    }
}

impl Drop for ConnectionSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One supervisor per server target, keyed case-insensitively.
#[derive(Default)]
pub struct ConnectionRegistry {
    supervisors: Mutex<HashMap<String, Arc<ConnectionSupervisor>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the supervisor for `target_id`, creating it from `config` on
    /// first use.
    pub fn get_or_create<F>(&self, target_id: &str, config: F) -> Arc<ConnectionSupervisor>
    where
        F: FnOnce() -> ConnectionConfig,
    {
        let mut supervisors = self.supervisors.lock();
        let supervisor = supervisors
            .entry(target_id.to_lowercase())
            .or_insert_with(|| {
                info!("Creating connection supervisor for '{}'", target_id);
                Arc::new(ConnectionSupervisor::new(config()))
            });
        Arc::clone(supervisor)
    }

    pub fn get(&self, target_id: &str) -> Option<Arc<ConnectionSupervisor>> {
        self.supervisors
            .lock()
            .get(&target_id.to_lowercase())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.supervisors.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop every live connection. Supervisors stay registered.
    pub fn stop_all(&self) {
        let supervisors: Vec<_> = self.supervisors.lock().values().cloned().collect();
        for supervisor in supervisors {
            supervisor.stop();
        }
    }
}
