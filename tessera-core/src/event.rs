//! Domain events and the publish/subscribe bus.
//!
//! The bus is an explicit instance handed to every component that publishes
//! or listens. Two consumption styles:
//!
//! - `subscribe(listener)` — synchronous callback, invoked inline on
//!   `publish`. Dropping the returned `Subscription` unsubscribes.
//! - `stream()` — a tokio broadcast receiver for async consumers. Lagging
//!   receivers lose the oldest events (`RecvError::Lagged`).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::model::{DocumentUpdate, Node, NodeId, NodeReaction, Role, StreamId, UserId, WorkspaceId};

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    NodeCreated { node: Node },
    NodeUpdated { node: Node },
    NodeDeleted { node: Node },
    DocumentUpdated { root_id: NodeId, update: DocumentUpdate },
    ReactionCreated { reaction: NodeReaction },
    ReactionDeleted { reaction: NodeReaction },
    /// `node_id` carries the changed collaborators map; the root for
    /// space-wide grants, a descendant for an override.
    CollaboratorChanged { root_id: NodeId, node_id: NodeId, user_id: UserId, role: Role },
    /// An outbox entry gave up; carries the error shown to the user.
    MutationFailed { local_id: Uuid, node_id: NodeId, error: String },
}

impl EventKind {
    /// Stream this event belongs to, if it is replicated.
    pub fn stream(&self) -> Option<StreamId> {
        match self {
            EventKind::NodeCreated { .. }
            | EventKind::NodeUpdated { .. }
            | EventKind::NodeDeleted { .. } => Some(StreamId::Nodes),
            EventKind::DocumentUpdated { .. } => Some(StreamId::Documents),
            EventKind::ReactionCreated { .. } | EventKind::ReactionDeleted { .. } => {
                Some(StreamId::Reactions)
            }
            EventKind::CollaboratorChanged { .. } | EventKind::MutationFailed { .. } => None,
        }
    }

    /// Root whose collaborators govern who may see this event.
    pub fn root_id(&self) -> Option<NodeId> {
        match self {
            EventKind::NodeCreated { node }
            | EventKind::NodeUpdated { node }
            | EventKind::NodeDeleted { node } => Some(node.root_id),
            EventKind::DocumentUpdated { root_id, .. }
            | EventKind::CollaboratorChanged { root_id, .. } => Some(*root_id),
            EventKind::ReactionCreated { reaction } | EventKind::ReactionDeleted { reaction } => {
                Some(reaction.root_id)
            }
            EventKind::MutationFailed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub workspace_id: WorkspaceId,
    /// Stream position assigned by the server; `None` for local-only events.
    pub position: Option<u64>,
    pub kind: EventKind,
}

impl Event {
    pub fn local(workspace_id: WorkspaceId, kind: EventKind) -> Self {
        Self {
            workspace_id,
            position: None,
            kind,
        }
    }

    pub fn at(workspace_id: WorkspaceId, position: u64, kind: EventKind) -> Self {
        Self {
            workspace_id,
            position: Some(position),
            kind,
        }
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct BusInner {
    listeners: RwLock<BTreeMap<u64, Listener>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<Arc<Event>>,
}

/// Cheaply cloneable event bus handle.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                sender,
            }),
        }
    }

    /// Register a synchronous listener.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(listener));
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Async receiver of every event published after this call.
    pub fn stream(&self) -> broadcast::Receiver<Arc<Event>> {
        self.inner.sender.subscribe()
    }

    /// Deliver to listeners in registration order, then to stream receivers.
    pub fn publish(&self, event: Event) {
        // Snapshot so listeners may publish or unsubscribe re-entrantly.
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(&event);
        }
        let _ = self.inner.sender.send(Arc::new(event));
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Scoped listener registration.
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.listeners
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}
