//! WebSocket replication client for one device.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect with backoff)
//! - Replication batches applied to the local `NodeStore`, then acknowledged
//! - `MutationTransport` for the outbox: requests are matched to acks by `local_id`
//! - Heartbeat pings while connected
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tessera_core::{BackoffCalculator, BackoffConfig, SyncError, SyncResult};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::node_store::NodeStore;
use crate::outbox::MutationTransport;
use crate::protocol::{ClientMessage, CursorAck, Hello, MutationAck, MutationRequest, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://host:port`
    pub server_url: String,
    /// Ping interval while connected
    pub heartbeat: Duration,
    /// How long a submitted mutation waits for its ack
    pub request_timeout: Duration,
    /// Reconnect delays
    pub reconnect: BackoffConfig,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            heartbeat: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            reconnect: BackoffConfig::default(),
        }
    }
}

type PendingAcks = HashMap<Uuid, oneshot::Sender<MutationAck>>;

/// The device's replication client.
pub struct ReplicationClient {
    config: ClientConfig,
    nodes: Arc<NodeStore>,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing: Mutex<Option<mpsc::Sender<ClientMessage>>>,

    /// Submitted mutations waiting for an ack
    pending: Arc<Mutex<PendingAcks>>,

    /// Flips to `true` when the current socket ends
    closed: Mutex<Option<watch::Receiver<bool>>>,

    /// Dropping or signalling it makes the writer close the socket
    hangup: Mutex<Option<watch::Sender<bool>>>,

    shutdown: watch::Sender<bool>,
}

impl ReplicationClient {
    pub fn new(nodes: Arc<NodeStore>, config: ClientConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            config,
            nodes,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing: Mutex::new(None),
            pending: Arc::default(),
            closed: Mutex::new(None),
            hangup: Mutex::new(None),
            shutdown,
        }
    }

    pub fn nodes(&self) -> &Arc<NodeStore> {
        &self.nodes
    }

    pub fn server_url(&self) -> &str {
        &self.config.server_url
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect once and introduce the device.
    ///
    /// Spawns the writer, reader and heartbeat tasks.
    pub async fn connect(&self) -> SyncResult<()> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.config.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(SyncError::Network(format!("connect {}: {e}", self.config.server_url)));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let device_id = self.nodes.device_id();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(256);
        let (hangup_tx, mut hangup_rx) = watch::channel(false);
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    message = out_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                    _ = hangup_rx.changed() => break,
                };
                let encoded = match message.encode(device_id) {
                    Ok(encoded) => encoded,
                    Err(e) => {
                        log::error!("Failed to encode {message:?}: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::Binary(encoded.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        out_tx
            .send(ClientMessage::Hello(Hello {
                device_id,
                account_id: self.nodes.user_id(),
                workspace_id: self.nodes.workspace_id(),
            }))
            .await
            .map_err(|_| SyncError::Network("writer closed".into()))?;

        // Publish the connection before the reader can observe a hangup
        let (closed_tx, closed_rx) = watch::channel(false);
        *self.outgoing_slot() = Some(out_tx.clone());
        *lock(&self.closed) = Some(closed_rx.clone());
        *lock(&self.hangup) = Some(hangup_tx);
        *self.state.write().await = ConnectionState::Connected;

        // Reader task: apply replication, resolve acks
        let nodes = self.nodes.clone();
        let pending = self.pending.clone();
        let state = self.state.clone();
        let acks = out_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let data = match frame {
                    Ok(Message::Binary(data)) => data,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let message = match ServerMessage::decode(&data) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Failed to decode server message: {e}");
                        continue;
                    }
                };
                match message {
                    ServerMessage::MutationAck(ack) => {
                        if let Some(waiter) = lock(&pending).remove(&ack.local_id) {
                            let _ = waiter.send(ack);
                        }
                    }
                    ServerMessage::Replication(batch) => match nodes.apply_batch(&batch).await {
                        Ok(position) => {
                            let ack = CursorAck {
                                stream_id: batch.stream_id,
                                position,
                            };
                            if acks.send(ClientMessage::CursorAck(ack)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            log::error!("Failed to apply {} batch: {e}", batch.stream_id.as_str());
                            break;
                        }
                    },
                    ServerMessage::Evicted => {
                        log::warn!("Device {device_id} evicted by a newer connection");
                        break;
                    }
                    ServerMessage::Pong => log::trace!("Pong"),
                }
            }

            // Connection lost
            lock(&pending).clear();
            *state.write().await = ConnectionState::Disconnected;
            let _ = closed_tx.send(true);
            log::info!("Device {device_id} disconnected");
        });

        // Heartbeat task
        let heartbeat = out_tx.clone();
        let interval = self.config.heartbeat;
        let mut heartbeat_closed = closed_rx;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if heartbeat.send(ClientMessage::Ping).await.is_err() {
                            break;
                        }
                    }
                    _ = heartbeat_closed.changed() => break,
                }
            }
        });

        log::info!("Device {device_id} connected to {}", self.config.server_url);

        // Anything queued while offline goes out now
        self.nodes.outbox().trigger();
        Ok(())
    }

    /// Close the current socket. Pending submissions fail as network errors.
    pub async fn disconnect(&self) {
        self.outgoing_slot().take();
        if let Some(hangup) = lock(&self.hangup).take() {
            let _ = hangup.send(true);
        }
        lock(&self.pending).clear();
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Stay connected until [`shutdown`](Self::shutdown), reconnecting with backoff.
    pub fn spawn_reconnect_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let client = self.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut backoff = BackoffCalculator::new(client.config.reconnect);
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match client.connect().await {
                    Ok(()) => {
                        backoff.reset();
                        let closed = lock(&client.closed).clone();
                        if let Some(mut closed) = closed {
                            tokio::select! {
                                _ = closed.changed() => {}
                                _ = shutdown.changed() => break,
                            }
                        }
                    }
                    Err(e) => {
                        backoff.increase_error();
                        log::warn!(
                            "Reconnect attempt {} failed: {e}; next in {:?}",
                            backoff.attempts(),
                            backoff.remaining()
                        );
                    }
                }
                *client.state.write().await = ConnectionState::Reconnecting;
                tokio::select! {
                    _ = tokio::time::sleep(backoff.remaining()) => {}
                    _ = shutdown.changed() => break,
                }
            }
            client.disconnect().await;
        })
    }

    /// Stop the reconnect loop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    fn outgoing_slot(&self) -> MutexGuard<'_, Option<mpsc::Sender<ClientMessage>>> {
        lock(&self.outgoing)
    }
}

#[async_trait]
impl MutationTransport for ReplicationClient {
    async fn submit(&self, request: MutationRequest) -> SyncResult<MutationAck> {
        if *self.state.read().await != ConnectionState::Connected {
            return Err(SyncError::Network("offline".into()));
        }
        let Some(outgoing) = self.outgoing_slot().clone() else {
            return Err(SyncError::Network("offline".into()));
        };
        let local_id = request.local_id;
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(local_id, tx);

        if outgoing.send(ClientMessage::Mutation(request)).await.is_err() {
            lock(&self.pending).remove(&local_id);
            return Err(SyncError::Network("connection closed".into()));
        }
        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(SyncError::Network("connection closed before ack".into())),
            Err(_) => {
                lock(&self.pending).remove(&local_id);
                Err(SyncError::Network(format!("no ack for {local_id}")))
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbox::OutboxConfig;
    use crate::storage::{Store, StoreConfig};
    use tessera_core::EventBus;

    fn client(dir: &tempfile::TempDir) -> ReplicationClient {
        client_for(dir, "ws://127.0.0.1:1")
    }

    fn client_for(dir: &tempfile::TempDir, url: &str) -> ReplicationClient {
        let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
        let nodes = NodeStore::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            store,
            EventBus::default(),
            OutboxConfig::for_testing(),
        )
        .unwrap();
        ReplicationClient::new(Arc::new(nodes), ClientConfig::new(url))
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir);
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.server_url(), "ws://127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_submit_offline_is_network_error() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir);
        let request = MutationRequest {
            local_id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            base_revision: 0,
            body: crate::protocol::MutationBody::DeleteNode,
        };
        let err = client.submit(request).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let dir = tempfile::tempdir().unwrap();
        let client = client(&dir);
        assert!(matches!(client.connect().await, Err(SyncError::Network(_))));
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_immediate_hangup_leaves_client_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _ = ws.close(None).await;
        });

        let dir = tempfile::tempdir().unwrap();
        let client = client_for(&dir, &format!("ws://{addr}"));
        client.connect().await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while client.connection_state().await != ConnectionState::Disconnected {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        // and it stays that way
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }
}
