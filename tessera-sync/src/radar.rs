//! Unread and activity counters for one account in one workspace.
//!
//! An activity node (message, record) created by someone else is unread
//! while its stream position is above the "seen" watermark of the node
//! itself and of every ancestor. Each unread item adds one to the counter
//! of every node on its ancestor chain, so marking a container as seen
//! clears everything below it.
//!
//! ```text
//!   replicated NodeCreated ──► item unread? ──► +1 on [root, …, parent, item]
//!   NodeDeleted / seen     ──► item was unread ──► −1 on the same chain
//! ```
//!
//! Counters change only along the affected chain; nothing is recomputed
//! from scratch after the initial load. "Opened" pings are buffered and
//! written by an `EventLoop`, so a burst lands as a single write.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tessera_core::{
    now_millis, Event, EventBus, EventKind, EventLoop, EventLoopConfig, Node, NodeId, Subscription,
    SyncResult, UserId, WorkspaceId,
};

use crate::registry::ancestry_with;
use crate::storage::{RadarKey, RadarKind, Store, StoreBatch};

#[derive(Debug, Clone, Copy)]
pub struct RadarConfig {
    /// Quiet period before buffered "opened" pings are written.
    pub opened_debounce: Duration,
}

impl Default for RadarConfig {
    fn default() -> Self {
        Self {
            opened_debounce: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadState {
    pub has_unread: bool,
    pub unread_count: u64,
}

impl UnreadState {
    fn of(count: u64) -> Self {
        Self {
            has_unread: count > 0,
            unread_count: count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceRadarData {
    pub workspace_id: WorkspaceId,
    pub account_id: UserId,
    pub state: UnreadState,
    /// Per top-level container.
    pub roots: BTreeMap<NodeId, UnreadState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRadarData {
    pub account_id: UserId,
    pub state: UnreadState,
    pub workspaces: Vec<WorkspaceRadarData>,
}

struct UnreadItem {
    position: u64,
    /// `[root, …, item]`
    chain: Vec<NodeId>,
}

#[derive(Default)]
struct RadarState {
    seen: HashMap<NodeId, u64>,
    unread: HashMap<NodeId, UnreadItem>,
    counts: HashMap<NodeId, u64>,
    /// Highest nodes-stream position observed; what "seen" records.
    head: u64,
}

impl RadarState {
    fn watermark(&self, chain: &[NodeId]) -> u64 {
        chain
            .iter()
            .filter_map(|id| self.seen.get(id))
            .copied()
            .max()
            .unwrap_or(0)
    }

    fn add(&mut self, item_id: NodeId, item: UnreadItem) {
        if self.unread.contains_key(&item_id) {
            return;
        }
        for id in &item.chain {
            *self.counts.entry(*id).or_default() += 1;
        }
        self.unread.insert(item_id, item);
    }

    fn remove(&mut self, item_id: NodeId) -> bool {
        let Some(item) = self.unread.remove(&item_id) else {
            return false;
        };
        for id in &item.chain {
            if let Some(count) = self.counts.get_mut(id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.counts.remove(id);
                }
            }
        }
        true
    }

    fn count(&self, node_id: NodeId) -> u64 {
        self.counts.get(&node_id).copied().unwrap_or(0)
    }
}

struct Inner {
    workspace_id: WorkspaceId,
    account_id: UserId,
    store: Arc<Store>,
    state: Mutex<RadarState>,
    opened: Mutex<HashMap<NodeId, u64>>,
    opened_writes: AtomicU64,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, RadarState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn opened(&self) -> MutexGuard<'_, HashMap<NodeId, u64>> {
        self.opened.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(&self, kind: RadarKind, node_id: NodeId) -> RadarKey {
        RadarKey {
            account_id: self.account_id,
            workspace_id: self.workspace_id,
            kind,
            node_id,
        }
    }

    fn chain(&self, node: &Node) -> SyncResult<Vec<NodeId>> {
        let ancestry = ancestry_with(node, |id| Ok(self.store.get_node(id)?))?;
        Ok(ancestry.iter().map(|n| n.id).collect())
    }

    fn counts_as_activity(&self, node: &Node) -> bool {
        node.node_type().is_activity() && !node.is_deleted() && node.created_by != self.account_id
    }

    fn on_event(&self, event: &Event) {
        let result = match &event.kind {
            EventKind::NodeCreated { node } | EventKind::NodeUpdated { node } => {
                self.on_node(node, event.position)
            }
            EventKind::NodeDeleted { node } => {
                let mut state = self.state();
                if let Some(position) = event.position {
                    state.head = state.head.max(position);
                }
                if state.remove(node.id) {
                    log::trace!("Radar: deleted item {} no longer unread", node.id);
                }
                Ok(())
            }
            // Other streams number their positions independently.
            _ => Ok(()),
        };
        if let Err(e) = result {
            log::warn!("Radar update for workspace {} failed: {e}", self.workspace_id);
        }
    }

    fn on_node(&self, node: &Node, position: Option<u64>) -> SyncResult<()> {
        let Some(position) = position else {
            return Ok(());
        };
        {
            let mut state = self.state();
            state.head = state.head.max(position);
            if !self.counts_as_activity(node) || state.unread.contains_key(&node.id) {
                return Ok(());
            }
        }
        let chain = self.chain(node)?;
        let mut state = self.state();
        if position > state.watermark(&chain) {
            log::trace!("Radar: {} unread at {position}", node.id);
            state.add(node.id, UnreadItem { position, chain });
        }
        Ok(())
    }

    fn flush_opened(&self) -> SyncResult<usize> {
        let pending: Vec<(NodeId, u64)> = self.opened().drain().collect();
        if pending.is_empty() {
            return Ok(0);
        }
        let mut batch = StoreBatch::new();
        for (node_id, at) in &pending {
            batch.put_radar(self.key(RadarKind::Opened, *node_id), *at);
        }
        self.store.commit(batch)?;
        self.opened_writes.fetch_add(1, Ordering::Relaxed);
        log::debug!("Radar: persisted {} opened markers", pending.len());
        Ok(pending.len())
    }
}

pub struct RadarAggregator {
    inner: Arc<Inner>,
    opened_loop: EventLoop,
    _subscription: Subscription,
}

impl RadarAggregator {
    /// Load watermarks and server rows, then follow `bus`.
    pub fn new(
        workspace_id: WorkspaceId,
        account_id: UserId,
        store: Arc<Store>,
        bus: &EventBus,
        config: RadarConfig,
    ) -> SyncResult<Self> {
        let inner = Arc::new(Inner {
            workspace_id,
            account_id,
            store,
            state: Mutex::new(RadarState::default()),
            opened: Mutex::new(HashMap::new()),
            opened_writes: AtomicU64::new(0),
        });

        let subscriber = Arc::downgrade(&inner);
        let subscription = bus.subscribe(move |event| {
            if let Some(inner) = subscriber.upgrade() {
                inner.on_event(event);
            }
        });
        Self::load(&inner)?;

        let flusher = Arc::downgrade(&inner);
        let opened_loop = EventLoop::new(
            "radar-opened",
            EventLoopConfig {
                interval: Duration::from_secs(3600),
                debounce: config.opened_debounce,
            },
            move || {
                let flusher = flusher.clone();
                async move {
                    if let Some(inner) = flusher.upgrade() {
                        inner.flush_opened()?;
                    }
                    Ok(())
                }
            },
        );

        Ok(Self {
            inner,
            opened_loop,
            _subscription: subscription,
        })
    }

    fn load(inner: &Inner) -> SyncResult<()> {
        let seen = inner
            .store
            .list_radar(inner.account_id, inner.workspace_id, RadarKind::Seen)?;
        let rows = inner.store.list_server_nodes()?;

        let mut items = Vec::new();
        for row in &rows {
            if inner.counts_as_activity(&row.node) && row.position > 0 {
                items.push((row.node.id, row.position, inner.chain(&row.node)?));
            }
        }

        let mut state = inner.state();
        state.seen.extend(seen);
        state.head = rows.iter().map(|r| r.position).max().unwrap_or(0);
        state.head = state.head.max(state.seen.values().copied().max().unwrap_or(0));
        for (id, position, chain) in items {
            if position > state.watermark(&chain) {
                state.add(id, UnreadItem { position, chain });
            }
        }
        log::info!(
            "Radar loaded for account {}: {} unread items",
            inner.account_id,
            state.unread.len()
        );
        Ok(())
    }

    pub fn get_node_state(&self, node_id: NodeId) -> UnreadState {
        UnreadState::of(self.inner.state().count(node_id))
    }

    pub fn get_workspace_state(&self) -> WorkspaceRadarData {
        let state = self.inner.state();
        let mut roots: BTreeMap<NodeId, UnreadState> = BTreeMap::new();
        for item in state.unread.values() {
            if let Some(root) = item.chain.first() {
                roots.insert(*root, UnreadState::of(state.count(*root)));
            }
        }
        WorkspaceRadarData {
            workspace_id: self.inner.workspace_id,
            account_id: self.inner.account_id,
            state: UnreadState::of(state.unread.len() as u64),
            roots,
        }
    }

    pub fn get_account_state(&self) -> AccountRadarData {
        let workspace = self.get_workspace_state();
        AccountRadarData {
            account_id: self.inner.account_id,
            state: workspace.state,
            workspaces: vec![workspace],
        }
    }

    /// Record that everything under `node_id` up to now was seen.
    pub fn mark_node_as_seen(&self, node_id: NodeId) -> SyncResult<UnreadState> {
        let head = self.inner.state().head;
        let mut batch = StoreBatch::new();
        batch.put_radar(self.inner.key(RadarKind::Seen, node_id), head);
        self.inner.store.commit(batch)?;

        let mut state = self.inner.state();
        let previous = state.seen.get(&node_id).copied().unwrap_or(0);
        state.seen.insert(node_id, previous.max(head));
        let cleared: Vec<NodeId> = state
            .unread
            .iter()
            .filter(|(_, item)| item.chain.contains(&node_id) && item.position <= head)
            .map(|(id, _)| *id)
            .collect();
        for id in &cleared {
            state.remove(*id);
        }
        log::trace!("Radar: {node_id} seen at {head}, cleared {}", cleared.len());
        Ok(UnreadState::of(state.count(node_id)))
    }

    /// Buffer an "opened" ping; bursts are written once after the debounce.
    pub fn mark_node_as_opened(&self, node_id: NodeId) {
        self.inner.opened().insert(node_id, now_millis());
        self.opened_loop.trigger();
    }

    /// Last persisted "opened" time of `node_id`.
    pub fn last_opened(&self, node_id: NodeId) -> SyncResult<Option<u64>> {
        Ok(self.inner.store.get_radar(self.inner.key(RadarKind::Opened, node_id))?)
    }

    /// Write buffered "opened" pings now.
    pub fn flush(&self) -> SyncResult<usize> {
        self.inner.flush_opened()
    }

    /// Batches of "opened" markers written so far.
    pub fn opened_writes(&self) -> u64 {
        self.inner.opened_writes.load(Ordering::Relaxed)
    }
}

impl Drop for RadarAggregator {
    fn drop(&mut self) {
        self.opened_loop.stop();
        if let Err(e) = self.inner.flush_opened() {
            log::error!("Radar: failed to persist opened markers: {e}");
        }
    }
}
