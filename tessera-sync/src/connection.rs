//! Per-device replication sessions.
//!
//! ```text
//!            connect(hello)
//!   Device ─────────────────► ReplicationHub ── evicts previous session of device
//!      ▲                          │
//!      │   ServerMessage          ▼ spawn
//!      └─────────────────── Session task
//!                              ├── subscribe EventBus
//!                              ├── replay backlog (nodes, documents, reactions)
//!                              └── select! { shutdown, inbound, bus }
//! ```
//!
//! The hub does not know about sockets. A `Connection` is a pair of channels;
//! the WebSocket server pumps frames in and out of it, and tests drive it
//! directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tessera_core::{
    DeviceId, Event, EventKind, Role, StreamId, SyncError, SyncResult, UserId,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};

use crate::protocol::{ClientMessage, CursorAck, Hello, MutationAck, ReplicationBatch, ServerMessage};
use crate::registry::NodeRegistry;
use crate::synchronizer::{Synchronizer, DEFAULT_BATCH_SIZE};

const STREAMS: [StreamId; 3] = [StreamId::Nodes, StreamId::Documents, StreamId::Reactions];

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Entries per backlog batch
    pub batch_size: usize,
    /// Outbound messages buffered per connection
    pub outbound_capacity: usize,
    /// Inbound messages buffered per connection
    pub inbound_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            outbound_capacity: 256,
            inbound_capacity: 64,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub evictions: u64,
    pub mutations: u64,
}

struct SessionHandle {
    session_id: u64,
    shutdown: watch::Sender<bool>,
}

pub struct ReplicationHub {
    registry: Arc<NodeRegistry>,
    config: HubConfig,
    sessions: Mutex<HashMap<DeviceId, SessionHandle>>,
    next_session: AtomicU64,
    evictions: AtomicU64,
    mutations: AtomicU64,
}

/// Device end of a session.
pub struct Connection {
    hello: Hello,
    inbound: mpsc::Sender<ClientMessage>,
    outbound: mpsc::Receiver<ServerMessage>,
}

impl Connection {
    pub fn hello(&self) -> &Hello {
        &self.hello
    }

    /// Hand a device message to the session.
    pub async fn send(&self, message: ClientMessage) -> SyncResult<()> {
        self.inbound
            .send(message)
            .await
            .map_err(|_| SyncError::Network("replication session closed".into()))
    }

    /// Next message for the device; `None` once the session ended.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.outbound.recv().await
    }

    /// Split into the inbound sender and outbound receiver.
    pub fn into_parts(self) -> (mpsc::Sender<ClientMessage>, mpsc::Receiver<ServerMessage>) {
        (self.inbound, self.outbound)
    }
}

impl ReplicationHub {
    pub fn new(registry: Arc<NodeRegistry>, config: HubConfig) -> Self {
        Self {
            registry,
            config,
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            evictions: AtomicU64::new(0),
            mutations: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            total_connections: self.next_session.load(Ordering::Relaxed) - 1,
            active_connections: self.sessions().len(),
            evictions: self.evictions.load(Ordering::Relaxed),
            mutations: self.mutations.load(Ordering::Relaxed),
        }
    }

    pub fn is_connected(&self, device_id: DeviceId) -> bool {
        self.sessions().contains_key(&device_id)
    }

    /// Open a session for `hello.device_id`, evicting any live one.
    pub fn connect(self: &Arc<Self>, hello: Hello) -> SyncResult<Connection> {
        if hello.workspace_id != self.registry.workspace_id() {
            return Err(SyncError::Validation(format!(
                "unknown workspace {}",
                hello.workspace_id
            )));
        }

        // Subscribe before the backlog query so nothing committed in between is missed.
        let events = self.registry.bus().stream();
        let synchronizers = STREAMS
            .iter()
            .map(|&stream| {
                Synchronizer::new(
                    self.registry.store().clone(),
                    hello.device_id,
                    hello.account_id,
                    stream,
                    self.config.batch_size,
                )
            })
            .collect::<SyncResult<Vec<_>>>()?;

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.inbound_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);

        let previous = self.sessions().insert(
            hello.device_id,
            SessionHandle {
                session_id,
                shutdown: shutdown_tx,
            },
        );
        if let Some(previous) = previous {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            log::info!("Evicting session {} of device {}", previous.session_id, hello.device_id);
            let _ = previous.shutdown.send(true);
        }
        log::info!(
            "Device {} (account {}) connected as session {session_id}",
            hello.device_id,
            hello.account_id
        );

        let session = Session {
            hub: self.clone(),
            session_id,
            device_id: hello.device_id,
            account_id: hello.account_id,
            synchronizers,
            outbound: outbound_tx,
        };
        tokio::spawn(session.run(events, inbound_rx, shutdown_rx));

        Ok(Connection {
            hello,
            inbound: inbound_tx,
            outbound: outbound_rx,
        })
    }

    /// Close the device's session and delete its cursors.
    pub fn retire_device(&self, device_id: DeviceId) -> SyncResult<usize> {
        if let Some(handle) = self.sessions().remove(&device_id) {
            let _ = handle.shutdown.send(true);
        }
        let removed = self.registry.store().delete_cursors(device_id)?;
        log::info!("Retired device {device_id}: {removed} cursors removed");
        Ok(removed)
    }

    fn release(&self, device_id: DeviceId, session_id: u64) {
        let mut sessions = self.sessions();
        if sessions.get(&device_id).is_some_and(|h| h.session_id == session_id) {
            sessions.remove(&device_id);
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<DeviceId, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Session {
    hub: Arc<ReplicationHub>,
    session_id: u64,
    device_id: DeviceId,
    account_id: UserId,
    synchronizers: Vec<Synchronizer>,
    outbound: mpsc::Sender<ServerMessage>,
}

impl Session {
    async fn run(
        mut self,
        mut events: broadcast::Receiver<Arc<Event>>,
        mut inbound: mpsc::Receiver<ClientMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Err(e) = self.drive(&mut events, &mut inbound, &mut shutdown).await {
            log::error!("Session {} of device {} failed: {e}", self.session_id, self.device_id);
        }
        self.hub.release(self.device_id, self.session_id);
        log::debug!("Session {} of device {} ended", self.session_id, self.device_id);
    }

    async fn drive(
        &mut self,
        events: &mut broadcast::Receiver<Arc<Event>>,
        inbound: &mut mpsc::Receiver<ClientMessage>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SyncResult<()> {
        if !self.replay_backlog().await? {
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = self.outbound.send(ServerMessage::Evicted).await;
                    }
                    return Ok(());
                }

                message = inbound.recv() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    if let Some(reply) = self.handle_message(message)? {
                        if !self.emit(reply).await {
                            return Ok(());
                        }
                    }
                }

                event = events.recv() => {
                    match event {
                        Ok(event) => {
                            if !self.forward(&event).await? {
                                return Ok(());
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Device {} lagged by {n} events, re-reading from cursor", self.device_id);
                            if !self.replay_backlog().await? {
                                return Ok(());
                            }
                        }
                        Err(RecvError::Closed) => return Ok(()),
                    }
                }
            }
        }
    }

    fn handle_message(&mut self, message: ClientMessage) -> SyncResult<Option<ServerMessage>> {
        match message {
            ClientMessage::Mutation(request) => {
                self.hub.mutations.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Device {} submitted mutation {} on node {}",
                    self.device_id,
                    request.local_id,
                    request.node_id
                );
                let ack: MutationAck = self.hub.registry.apply_mutation(self.account_id, request)?;
                Ok(Some(ServerMessage::MutationAck(ack)))
            }
            ClientMessage::CursorAck(CursorAck { stream_id, position }) => {
                if let Some(sync) = self.synchronizers.iter().find(|s| s.stream() == stream_id) {
                    let stored = sync.acknowledge(position)?;
                    log::debug!("Device {} acked {} at {stored}", self.device_id, stream_id.as_str());
                }
                Ok(None)
            }
            ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),
            ClientMessage::Hello(_) => {
                log::warn!("Device {} sent a second hello; ignored", self.device_id);
                Ok(None)
            }
        }
    }

    /// Drain every stream up to its head. `false` once the device is gone.
    async fn replay_backlog(&mut self) -> SyncResult<bool> {
        for index in 0..self.synchronizers.len() {
            while let Some(batch) = self.synchronizers[index].fetch_backlog()? {
                if !self.emit(ServerMessage::Replication(batch)).await {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn forward(&mut self, event: &Event) -> SyncResult<bool> {
        let mut batches: Vec<ReplicationBatch> = Vec::new();
        for sync in &mut self.synchronizers {
            if let Some(batch) = sync.on_event(event)? {
                batches.push(batch);
            }
        }

        if let EventKind::CollaboratorChanged { node_id, user_id, role, .. } = &event.kind {
            if *user_id == self.account_id && role.at_least(Role::Viewer) {
                log::info!("Account {} gained access to {node_id}", self.account_id);
                for sync in &mut self.synchronizers {
                    if let Some(batch) = sync.backfill(*node_id)? {
                        batches.push(batch);
                    }
                }
            }
        }

        for batch in batches {
            if !self.emit(ServerMessage::Replication(batch)).await {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn emit(&self, message: ServerMessage) -> bool {
        self.outbound.send(message).await.is_ok()
    }
}
