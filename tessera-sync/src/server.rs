//! WebSocket replication server.
//!
//! Architecture:
//! ```text
//! Device A ──┐                                   ┌── NodeRegistry ── Store (RocksDB)
//!            ├── WebSocket ── ReplicationHub ────┤
//! Device B ──┘      │              │             └── EventBus ── Sessions
//!                   │              │
//!              ServerMessage   one session per device
//! ```
//!
//! The first frame of every connection must be a `Hello`. After that the
//! socket is a pump between frames and the device's hub `Connection`.
//! Document compaction runs on its own loop over documents touched since
//! the previous run.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tessera_core::{
    EventBus, EventKind, EventLoop, EventLoopConfig, NodeId, StreamId, Subscription, SyncError,
    SyncResult, WorkspaceId,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::connection::{HubConfig, HubStats, ReplicationHub};
use crate::document_store::DocumentStore;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::registry::NodeRegistry;
use crate::storage::{Store, StoreConfig};
use crate::synchronizer::DEFAULT_BATCH_SIZE;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Workspace served by this process
    pub workspace_id: WorkspaceId,
    /// RocksDB settings; `path` is the data directory
    pub store: StoreConfig,
    /// Event bus capacity; slower sessions re-read from their cursor
    pub broadcast_capacity: usize,
    /// Entries per replication batch
    pub batch_size: usize,
    /// Heartbeat interval in seconds; a device silent for three intervals is dropped
    pub heartbeat_interval_secs: u64,
    /// Document compaction schedule
    pub compaction: EventLoopConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            workspace_id: Uuid::nil(),
            store: StoreConfig::default(),
            broadcast_capacity: 1024,
            batch_size: DEFAULT_BATCH_SIZE,
            heartbeat_interval_secs: 30,
            compaction: EventLoopConfig {
                interval: Duration::from_secs(300),
                debounce: Duration::from_secs(30),
            },
        }
    }
}

impl ServerConfig {
    pub fn for_testing(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            workspace_id: Uuid::new_v4(),
            store: StoreConfig::for_testing(data_dir),
            heartbeat_interval_secs: 5,
            compaction: EventLoopConfig {
                interval: Duration::from_millis(500),
                debounce: Duration::from_millis(20),
            },
            ..Self::default()
        }
    }
}

/// Folds the update logs of recently written documents into snapshots.
struct Compactor {
    driver: EventLoop,
    _subscription: Subscription,
}

impl Compactor {
    fn start(documents: Arc<DocumentStore>, bus: &EventBus, config: EventLoopConfig) -> Self {
        let dirty: Arc<Mutex<HashSet<NodeId>>> = Arc::default();

        let pending = dirty.clone();
        let documents = Arc::downgrade(&documents);
        let driver = EventLoop::new("compaction", config, move || {
            let documents = documents.upgrade();
            let touched: Vec<NodeId> = pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .collect();
            async move {
                let Some(documents) = documents else {
                    return Ok(());
                };
                for document_id in touched {
                    let report = documents.compact(document_id).await?;
                    log::debug!("Compaction of {document_id}: {report:?}");
                }
                Ok(())
            }
        });

        let subscription = bus.subscribe(move |event| {
            if let EventKind::DocumentUpdated { update, .. } = &event.kind {
                dirty
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(update.document_id);
            }
        });
        driver.start();

        Self {
            driver,
            _subscription: subscription,
        }
    }
}

impl Drop for Compactor {
    fn drop(&mut self) {
        self.driver.stop();
    }
}

/// The replication server.
pub struct ReplicationServer {
    config: ServerConfig,
    hub: Arc<ReplicationHub>,
    _compactor: Compactor,
}

impl ReplicationServer {
    /// Open (or recover) the store and build the hub on top of it.
    pub fn open(config: ServerConfig) -> SyncResult<Self> {
        let store = Arc::new(Store::open(config.store.clone())?);
        log::info!(
            "Opened store at {} (nodes head {}, documents head {}, reactions head {})",
            store.path().display(),
            store.stream_head(StreamId::Nodes),
            store.stream_head(StreamId::Documents),
            store.stream_head(StreamId::Reactions)
        );

        let bus = EventBus::new(config.broadcast_capacity);
        let registry = Arc::new(NodeRegistry::new(config.workspace_id, store, bus.clone()));
        let compactor = Compactor::start(registry.documents().clone(), &bus, config.compaction);
        let hub = Arc::new(ReplicationHub::new(
            registry,
            HubConfig {
                batch_size: config.batch_size,
                ..HubConfig::default()
            },
        ));

        Ok(Self {
            config,
            hub,
            _compactor: compactor,
        })
    }

    pub fn hub(&self) -> &Arc<ReplicationHub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        self.hub.registry()
    }

    pub fn stats(&self) -> HubStats {
        self.hub.stats()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> SyncResult<()> {
        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| SyncError::Network(format!("bind {}: {e}", self.config.bind_addr)))?;
        log::info!("Replication server listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> SyncResult<()> {
        loop {
            let (stream, addr) = listener
                .accept()
                .await
                .map_err(|e| SyncError::Network(e.to_string()))?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
            tokio::spawn(async move {
                if let Err(e) = handle_connection(hub, stream, addr, heartbeat).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    hub: Arc<ReplicationHub>,
    stream: TcpStream,
    addr: SocketAddr,
    heartbeat: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    // First frame: Hello
    let hello = loop {
        match tokio::time::timeout(heartbeat, ws_receiver.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => match ClientMessage::decode(&data) {
                Ok((_, ClientMessage::Hello(hello))) => break hello,
                Ok((device_id, other)) => {
                    log::warn!("Device {device_id} from {addr} spoke before hello: {other:?}");
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Failed to decode hello from {addr}: {e}");
                    return Ok(());
                }
            },
            Ok(Some(Ok(Message::Ping(data)))) => ws_sender.send(Message::Pong(data)).await?,
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) | Err(_) => {
                log::debug!("Connection from {addr} closed before hello");
                return Ok(());
            }
        }
    };

    let device_id = hello.device_id;
    let connection = match hub.connect(hello) {
        Ok(connection) => connection,
        Err(e) => {
            log::warn!("Refusing device {device_id} from {addr}: {e}");
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        }
    };
    let (inbound, mut outbound) = connection.into_parts();

    let mut last_seen = Instant::now();
    let mut ticker = tokio::time::interval(heartbeat);
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        match ClientMessage::decode(&data) {
                            Ok((_, message)) => {
                                if inbound.send(message).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => last_seen = Instant::now(),
                }
            }

            message = outbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                let evicted = matches!(message, ServerMessage::Evicted);
                ws_sender.send(Message::Binary(message.encode()?.into())).await?;
                if evicted {
                    log::info!("Device {device_id} at {addr} evicted by a newer connection");
                    break;
                }
            }

            _ = ticker.tick() => {
                if last_seen.elapsed() > heartbeat * 3 {
                    log::warn!("Device {device_id} at {addr} missed heartbeats, closing");
                    break;
                }
            }
        }
    }

    let _ = ws_sender.send(Message::Close(None)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt;
    use tessera_core::{Node, NodeAttributes, PageAttributes, Role, SpaceAttributes};
    use crate::protocol::{MutationBody, MutationRequest};

    fn space(owner: Uuid) -> Node {
        let id = Uuid::new_v4();
        Node {
            id,
            parent_id: None,
            root_id: id,
            revision: 0,
            attributes: NodeAttributes::Space(SpaceAttributes {
                name: "Team".into(),
                description: None,
                avatar: None,
                collaborators: [(owner, Role::Owner)].into_iter().collect(),
            }),
            created_by: owner,
            created_at: 0,
            updated_by: None,
            updated_at: None,
            deleted_at: None,
        }
    }

    fn create(node: &Node) -> MutationRequest {
        MutationRequest {
            local_id: Uuid::new_v4(),
            node_id: node.id,
            base_revision: 0,
            body: MutationBody::CreateNode { node: node.clone() },
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(config.workspace_id.is_nil());
    }

    #[tokio::test]
    async fn test_server_recovers_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::for_testing(dir.path().join("db"));
        let owner = Uuid::new_v4();
        let root = space(owner);
        {
            let server = ReplicationServer::open(config.clone()).unwrap();
            server.registry().apply_mutation(owner, create(&root)).unwrap();
        }

        let server = ReplicationServer::open(config).unwrap();
        assert!(server.registry().get_node(root.id).unwrap().is_some());
        let page = Node {
            id: Uuid::new_v4(),
            parent_id: Some(root.id),
            attributes: NodeAttributes::Page(PageAttributes {
                name: "After restart".into(),
                avatar: None,
                collaborators: None,
            }),
            ..root.clone()
        };
        let ack = server.registry().apply_mutation(owner, create(&page)).unwrap();
        assert_eq!(ack.position, Some(2));
    }

    #[tokio::test]
    async fn test_compaction_loop_folds_written_documents() {
        let dir = tempfile::tempdir().unwrap();
        let server = ReplicationServer::open(ServerConfig::for_testing(dir.path().join("db"))).unwrap();
        let owner = Uuid::new_v4();
        let root = space(owner);
        server.registry().apply_mutation(owner, create(&root)).unwrap();

        let delta = crdt::append_text(&[], "folded").unwrap();
        server
            .registry()
            .documents()
            .apply_update(&root, delta, owner)
            .unwrap();

        let store = server.registry().store().clone();
        let mut compacted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if store.get_document_state(root.id).unwrap().is_some() {
                compacted = true;
                break;
            }
        }
        assert!(compacted);
        assert_eq!(server.registry().documents().content(root.id).unwrap(), "folded");
    }
}
