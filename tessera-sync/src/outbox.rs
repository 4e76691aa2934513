//! Durable queue of local mutations waiting for the server.
//!
//! ```text
//!  enqueue ─► outbox CF (sequence order) ─► EventLoop ─► drain_once
//!                                                          │
//!         ┌──────────────┬───────────────┬─────────────────┼──────────────┐
//!         ▼              ▼               ▼                 ▼              ▼
//!     Success         Retry         Unauthorized/       Network        Backoff
//!   remove + sink   rebase, block    Failed: mark       error: stop    closed:
//!   settles         entity, rerun    failed, notify     pass, backoff  skip pass
//! ```
//!
//! Ordering is per entity: the pass walks entries in creation order and
//! skips an entity once one of its entries was sent back for a rebase, so a
//! stuck node never holds up unrelated ones.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tessera_core::{
    BackoffCalculator, BackoffConfig, Event, EventBus, EventKind, EventLoop, EventLoopConfig,
    Mutation, MutationStatus, Node, NodeId, SyncError, SyncResult, WorkspaceId,
};
use uuid::Uuid;

use crate::protocol::{AckStatus, MutationAck, MutationRequest};
use crate::storage::{Store, StoreBatch};

/// Sends prepared mutations to the server.
#[async_trait]
pub trait MutationTransport: Send + Sync {
    /// `Err(SyncError::Network)` means the outcome is unknown and the request
    /// may be resent later.
    async fn submit(&self, request: MutationRequest) -> SyncResult<MutationAck>;
}

/// Local replica side of the outbox.
///
/// Every settle call receives a batch that already carries the outbox row
/// change; implementations add their own writes and commit it.
#[async_trait]
pub trait MutationSink: Send + Sync {
    /// Build the wire request against the current server view.
    async fn prepare(&self, mutation: &Mutation) -> SyncResult<MutationRequest>;

    async fn on_success(&self, mutation: &Mutation, ack: &MutationAck, batch: StoreBatch) -> SyncResult<()>;

    /// The server is ahead of `mutation.base_revision`; `latest` is its view.
    async fn on_retry(&self, mutation: &Mutation, latest: &Node, batch: StoreBatch) -> SyncResult<()>;

    /// `mutation` will never be applied; drop its optimistic effect.
    async fn on_rejected(&self, mutation: &Mutation, batch: StoreBatch) -> SyncResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxConfig {
    /// Network failures plus rebases before an entry is marked failed.
    pub max_attempts: u32,
    pub drain: EventLoopConfig,
    pub backoff: BackoffConfig,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            drain: EventLoopConfig {
                interval: Duration::from_secs(60),
                debounce: Duration::from_millis(100),
            },
            backoff: BackoffConfig::default(),
        }
    }
}

impl OutboxConfig {
    pub fn for_testing() -> Self {
        Self {
            max_attempts: 3,
            drain: EventLoopConfig {
                interval: Duration::from_millis(500),
                debounce: Duration::from_millis(5),
            },
            backoff: BackoffConfig::for_testing(),
        }
    }
}

/// What one drain pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub acked: usize,
    pub rebased: usize,
    pub failed: usize,
    /// The transport failed; the pass stopped early.
    pub offline: bool,
    /// Backoff was still closed; nothing was sent.
    pub deferred: bool,
}

enum Step {
    Acked,
    Rebased,
    Failed,
    Offline,
}

pub struct MutationOutbox {
    workspace_id: WorkspaceId,
    store: Arc<Store>,
    bus: EventBus,
    config: OutboxConfig,
    next_sequence: AtomicU64,
    backoff: Mutex<BackoffCalculator>,
    /// One pass at a time.
    pass: tokio::sync::Mutex<()>,
    driver: Mutex<Option<EventLoop>>,
}

impl MutationOutbox {
    /// Open the outbox over `store`, resuming sequences after the last entry.
    pub fn new(workspace_id: WorkspaceId, store: Arc<Store>, bus: EventBus, config: OutboxConfig) -> SyncResult<Self> {
        let last = store.last_mutation_sequence()?;
        if last > 0 {
            log::info!("Recovered outbox with last sequence {last}");
        }
        Ok(Self {
            workspace_id,
            store,
            bus,
            config,
            next_sequence: AtomicU64::new(last + 1),
            backoff: Mutex::new(BackoffCalculator::new(config.backoff)),
            pass: tokio::sync::Mutex::new(()),
            driver: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    /// Append `mutation` and schedule a drain.
    pub fn enqueue(&self, mutation: Mutation) -> SyncResult<Mutation> {
        let mut batch = StoreBatch::new();
        let mutation = self.enqueue_in(mutation, &mut batch)?;
        self.store.commit(batch)?;
        self.trigger();
        Ok(mutation)
    }

    /// Stage `mutation` into `batch`. The caller commits, then calls
    /// [`trigger`](Self::trigger).
    pub fn enqueue_in(&self, mut mutation: Mutation, batch: &mut StoreBatch) -> SyncResult<Mutation> {
        mutation.sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        mutation.status = MutationStatus::Pending;
        batch.put_mutation(&mutation)?;
        log::debug!(
            "Queued {:?} for {} as #{}",
            mutation.kind,
            mutation.node_id,
            mutation.sequence
        );
        Ok(mutation)
    }

    /// Entries not yet settled, oldest first.
    pub fn pending(&self) -> SyncResult<Vec<Mutation>> {
        Ok(self
            .store
            .list_mutations()?
            .into_iter()
            .filter(Mutation::is_pending)
            .collect())
    }

    pub fn pending_for(&self, node_id: NodeId) -> SyncResult<Vec<Mutation>> {
        Ok(self
            .pending()?
            .into_iter()
            .filter(|m| m.node_id == node_id)
            .collect())
    }

    pub fn failed_mutations(&self) -> SyncResult<Vec<Mutation>> {
        Ok(self
            .store
            .list_mutations()?
            .into_iter()
            .filter(|m| m.status == MutationStatus::Failed)
            .collect())
    }

    /// Forget a failed entry. Returns whether one was removed.
    pub fn dismiss_failed(&self, local_id: Uuid) -> SyncResult<bool> {
        let Some(failed) = self
            .failed_mutations()?
            .into_iter()
            .find(|m| m.local_id == local_id)
        else {
            return Ok(false);
        };
        let mut batch = StoreBatch::new();
        batch.delete_mutation(failed.sequence);
        self.store.commit(batch)?;
        Ok(true)
    }

    /// Time until the backoff gate opens.
    pub fn retry_in(&self) -> Duration {
        self.lock_backoff().remaining()
    }

    // ─── Driving ──────────────────────────────────────────────────────

    /// Drain on an [`EventLoop`] until [`stop`](Self::stop).
    pub fn start(self: &Arc<Self>, transport: Arc<dyn MutationTransport>, sink: Weak<dyn MutationSink>) {
        let outbox = Arc::downgrade(self);
        let driver = EventLoop::new("outbox", self.config.drain, move || {
            let outbox = outbox.clone();
            let sink = sink.clone();
            let transport = transport.clone();
            async move {
                let (Some(outbox), Some(sink)) = (outbox.upgrade(), sink.upgrade()) else {
                    return Ok(());
                };
                let report = outbox.drain_once(transport.as_ref(), sink.as_ref()).await?;
                if report.offline || report.deferred {
                    outbox.trigger_after(outbox.retry_in());
                } else if report.rebased > 0 {
                    outbox.trigger();
                }
                Ok(())
            }
        });
        driver.start();
        if let Some(previous) = self.lock_driver().replace(driver) {
            previous.stop();
        }
    }

    pub fn stop(&self) {
        if let Some(driver) = self.lock_driver().take() {
            driver.stop();
        }
    }

    /// Ask for a drain soon; a no-op when not started.
    pub fn trigger(&self) {
        if let Some(driver) = self.lock_driver().as_ref() {
            driver.trigger();
        }
    }

    fn trigger_after(&self, delay: Duration) {
        let Some(driver) = self.lock_driver().clone() else {
            return;
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            driver.trigger();
        });
    }

    // ─── Draining ─────────────────────────────────────────────────────

    /// Send every eligible pending entry once.
    pub async fn drain_once(
        &self,
        transport: &dyn MutationTransport,
        sink: &dyn MutationSink,
    ) -> SyncResult<DrainReport> {
        let _pass = self.pass.lock().await;
        let mut report = DrainReport::default();
        if !self.lock_backoff().can_retry() {
            report.deferred = true;
            return Ok(report);
        }

        let mut blocked: HashSet<NodeId> = HashSet::new();
        for mutation in self.pending()? {
            if blocked.contains(&mutation.node_id) {
                continue;
            }
            match self.submit(mutation.clone(), transport, sink).await? {
                Step::Acked => report.acked += 1,
                Step::Rebased => {
                    report.rebased += 1;
                    blocked.insert(mutation.node_id);
                }
                Step::Failed => report.failed += 1,
                Step::Offline => {
                    report.offline = true;
                    break;
                }
            }
        }

        if report.acked + report.rebased + report.failed > 0 {
            log::debug!(
                "Outbox pass: {} acked, {} rebased, {} failed",
                report.acked,
                report.rebased,
                report.failed
            );
        }
        Ok(report)
    }

    async fn submit(
        &self,
        mut mutation: Mutation,
        transport: &dyn MutationTransport,
        sink: &dyn MutationSink,
    ) -> SyncResult<Step> {
        let request = match sink.prepare(&mutation).await {
            Ok(request) => request,
            Err(e) if ends_mutation(&e) => {
                self.fail(mutation, e.to_string(), sink).await?;
                return Ok(Step::Failed);
            }
            Err(e) => return Err(e),
        };

        mutation.status = MutationStatus::Sent;
        let mut batch = StoreBatch::new();
        batch.put_mutation(&mutation)?;
        self.store.commit(batch)?;

        let ack = match transport.submit(request).await {
            Ok(ack) => ack,
            Err(SyncError::Network(reason)) => {
                log::warn!("Outbox offline: {reason}");
                self.lock_backoff().increase_error();
                return self.count_attempt(mutation, reason, sink).await;
            }
            Err(e) => {
                self.fail(mutation, e.to_string(), sink).await?;
                return Ok(Step::Failed);
            }
        };
        self.lock_backoff().reset();

        match ack.status {
            AckStatus::Success => {
                let mut batch = StoreBatch::new();
                batch.delete_mutation(mutation.sequence);
                sink.on_success(&mutation, &ack, batch).await?;
                Ok(Step::Acked)
            }
            AckStatus::Retry => {
                let Some(latest) = ack.latest.as_ref() else {
                    self.fail(mutation, "retry without the latest node".into(), sink).await?;
                    return Ok(Step::Failed);
                };
                self.rebase(mutation, latest, sink).await
            }
            AckStatus::Unauthorized | AckStatus::Failed => {
                let reason = ack.error.unwrap_or_else(|| format!("{:?}", ack.status));
                self.fail(mutation, reason, sink).await?;
                Ok(Step::Failed)
            }
        }
    }

    async fn rebase(&self, mut mutation: Mutation, latest: &Node, sink: &dyn MutationSink) -> SyncResult<Step> {
        let base = mutation.base_revision;
        mutation.attempt += 1;
        if mutation.attempt >= self.config.max_attempts {
            let exhausted = SyncError::ConflictRetry {
                base,
                current: latest.revision,
            };
            self.fail(mutation, exhausted.to_string(), sink).await?;
            return Ok(Step::Failed);
        }

        mutation.base_revision = latest.revision;
        mutation.status = MutationStatus::Pending;
        let mut batch = StoreBatch::new();
        batch.put_mutation(&mutation)?;
        match sink.on_retry(&mutation, latest, batch).await {
            Ok(()) => {
                log::debug!(
                    "Rebased #{} on {} from revision {base} to {}",
                    mutation.sequence,
                    mutation.node_id,
                    latest.revision
                );
                Ok(Step::Rebased)
            }
            Err(e) if ends_mutation(&e) => {
                self.fail(mutation, e.to_string(), sink).await?;
                Ok(Step::Failed)
            }
            Err(e) => Err(e),
        }
    }

    async fn count_attempt(&self, mut mutation: Mutation, reason: String, sink: &dyn MutationSink) -> SyncResult<Step> {
        mutation.attempt += 1;
        if mutation.attempt >= self.config.max_attempts {
            self.fail(mutation, reason, sink).await?;
            return Ok(Step::Offline);
        }
        mutation.status = MutationStatus::Pending;
        mutation.last_error = Some(reason);
        let mut batch = StoreBatch::new();
        batch.put_mutation(&mutation)?;
        self.store.commit(batch)?;
        Ok(Step::Offline)
    }

    async fn fail(&self, mut mutation: Mutation, reason: String, sink: &dyn MutationSink) -> SyncResult<()> {
        log::warn!("Mutation {} on {} failed: {reason}", mutation.local_id, mutation.node_id);
        mutation.status = MutationStatus::Failed;
        mutation.last_error = Some(reason.clone());
        let mut batch = StoreBatch::new();
        batch.put_mutation(&mutation)?;
        sink.on_rejected(&mutation, batch).await?;
        self.bus.publish(Event::local(
            self.workspace_id,
            EventKind::MutationFailed {
                local_id: mutation.local_id,
                node_id: mutation.node_id,
                error: reason,
            },
        ));
        Ok(())
    }

    fn lock_backoff(&self) -> std::sync::MutexGuard<'_, BackoffCalculator> {
        self.backoff.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_driver(&self) -> std::sync::MutexGuard<'_, Option<EventLoop>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Errors about the mutation itself, as opposed to the local replica.
fn ends_mutation(error: &SyncError) -> bool {
    matches!(
        error,
        SyncError::Validation(_) | SyncError::NotFound(_) | SyncError::Unauthorized { .. } | SyncError::Domain(_)
    )
}

impl Drop for MutationOutbox {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MutationBody;
    use crate::storage::StoreConfig;
    use std::collections::VecDeque;
    use tempfile::TempDir;
    use tessera_core::{AttributePatch, MutationPayload, NodeAttributes, PageAttributes};

    /// Replies from a script; an exhausted script means offline.
    #[derive(Default)]
    struct ScriptedTransport {
        replies: Mutex<VecDeque<AckStatus>>,
        sent: Mutex<Vec<MutationRequest>>,
    }

    impl ScriptedTransport {
        fn new(replies: impl IntoIterator<Item = AckStatus>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().collect()),
                sent: Mutex::default(),
            }
        }

        fn sent(&self) -> Vec<MutationRequest> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MutationTransport for ScriptedTransport {
        async fn submit(&self, request: MutationRequest) -> SyncResult<MutationAck> {
            let status = self.replies.lock().unwrap().pop_front();
            self.sent.lock().unwrap().push(request.clone());
            match status {
                None => Err(SyncError::Network("unreachable".into())),
                Some(AckStatus::Success) => Ok(MutationAck::success(request.local_id, None, Some(1))),
                Some(AckStatus::Retry) => Ok(MutationAck::retry(request.local_id, latest(request.node_id, 7))),
                Some(status) => Ok(MutationAck {
                    status,
                    error: Some("denied".into()),
                    ..MutationAck::success(request.local_id, None, None)
                }),
            }
        }
    }

    /// Commits whatever it is handed and records the calls.
    struct RecordingSink {
        store: Arc<Store>,
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl MutationSink for RecordingSink {
        async fn prepare(&self, mutation: &Mutation) -> SyncResult<MutationRequest> {
            Ok(MutationRequest {
                local_id: mutation.local_id,
                node_id: mutation.node_id,
                base_revision: mutation.base_revision,
                body: MutationBody::DeleteNode,
            })
        }

        async fn on_success(&self, _: &Mutation, _: &MutationAck, batch: StoreBatch) -> SyncResult<()> {
            self.calls.lock().unwrap().push("success");
            Ok(self.store.commit(batch)?)
        }

        async fn on_retry(&self, _: &Mutation, _: &Node, batch: StoreBatch) -> SyncResult<()> {
            self.calls.lock().unwrap().push("retry");
            Ok(self.store.commit(batch)?)
        }

        async fn on_rejected(&self, _: &Mutation, batch: StoreBatch) -> SyncResult<()> {
            self.calls.lock().unwrap().push("rejected");
            Ok(self.store.commit(batch)?)
        }
    }

    fn latest(id: NodeId, revision: u64) -> Node {
        Node {
            id,
            parent_id: Some(Uuid::new_v4()),
            root_id: Uuid::new_v4(),
            revision,
            attributes: NodeAttributes::Page(PageAttributes {
                name: "server".into(),
                avatar: None,
                collaborators: None,
            }),
            created_by: Uuid::new_v4(),
            created_at: 0,
            updated_by: None,
            updated_at: None,
            deleted_at: None,
        }
    }

    fn setup(config: OutboxConfig) -> (TempDir, Arc<Store>, MutationOutbox, RecordingSink) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
        let outbox = MutationOutbox::new(Uuid::new_v4(), store.clone(), EventBus::default(), config).unwrap();
        let sink = RecordingSink {
            store: store.clone(),
            calls: Mutex::default(),
        };
        (dir, store, outbox, sink)
    }

    fn update_of(node_id: NodeId) -> Mutation {
        Mutation::new(node_id, 0, MutationPayload::UpdateNode { patch: AttributePatch::default() })
    }

    #[tokio::test]
    async fn test_enqueue_assigns_sequences_in_order() {
        let (_dir, _store, outbox, _sink) = setup(OutboxConfig::for_testing());
        let a = outbox.enqueue(update_of(Uuid::new_v4())).unwrap();
        let b = outbox.enqueue(update_of(Uuid::new_v4())).unwrap();
        assert!(a.sequence < b.sequence);
        let pending: Vec<Uuid> = outbox.pending().unwrap().iter().map(|m| m.local_id).collect();
        assert_eq!(pending, vec![a.local_id, b.local_id]);
    }

    #[tokio::test]
    async fn test_sequences_resume_after_reopen() {
        let dir = TempDir::new().unwrap();
        let last = {
            let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
            let outbox = MutationOutbox::new(Uuid::new_v4(), store, EventBus::default(), OutboxConfig::for_testing()).unwrap();
            outbox.enqueue(update_of(Uuid::new_v4())).unwrap();
            outbox.enqueue(update_of(Uuid::new_v4())).unwrap().sequence
        };
        let store = Arc::new(Store::open(StoreConfig::for_testing(dir.path())).unwrap());
        let outbox = MutationOutbox::new(Uuid::new_v4(), store, EventBus::default(), OutboxConfig::for_testing()).unwrap();
        assert_eq!(outbox.pending().unwrap().len(), 2);
        assert!(outbox.enqueue(update_of(Uuid::new_v4())).unwrap().sequence > last);
    }

    #[tokio::test]
    async fn test_success_removes_entry() {
        let (_dir, _store, outbox, sink) = setup(OutboxConfig::for_testing());
        outbox.enqueue(update_of(Uuid::new_v4())).unwrap();
        let transport = ScriptedTransport::new([AckStatus::Success]);

        let report = outbox.drain_once(&transport, &sink).await.unwrap();
        assert_eq!(report.acked, 1);
        assert!(outbox.pending().unwrap().is_empty());
        assert_eq!(*sink.calls.lock().unwrap(), vec!["success"]);
    }

    #[tokio::test]
    async fn test_retry_blocks_only_that_entity() {
        let (_dir, _store, outbox, sink) = setup(OutboxConfig::for_testing());
        let stuck = Uuid::new_v4();
        outbox.enqueue(update_of(stuck)).unwrap();
        outbox.enqueue(update_of(stuck)).unwrap();
        let other = outbox.enqueue(update_of(Uuid::new_v4())).unwrap();
        let transport = ScriptedTransport::new([AckStatus::Retry, AckStatus::Success]);

        let report = outbox.drain_once(&transport, &sink).await.unwrap();
        assert_eq!(report.rebased, 1);
        assert_eq!(report.acked, 1);
        let sent = transport.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].local_id, other.local_id);

        // the rebased entry keeps its place and picks up the new base
        let pending = outbox.pending_for(stuck).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].base_revision, 7);
        assert_eq!(pending[0].attempt, 1);
    }

    #[tokio::test]
    async fn test_rejection_marks_failed_and_notifies() {
        let (_dir, _store, outbox, sink) = setup(OutboxConfig::for_testing());
        let mut events = outbox.bus.stream();
        let mutation = outbox.enqueue(update_of(Uuid::new_v4())).unwrap();
        let transport = ScriptedTransport::new([AckStatus::Unauthorized]);

        let report = outbox.drain_once(&transport, &sink).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(outbox.pending().unwrap().is_empty());
        let failed = outbox.failed_mutations().unwrap();
        assert_eq!(failed[0].last_error.as_deref(), Some("denied"));
        assert!(matches!(
            &events.try_recv().unwrap().kind,
            EventKind::MutationFailed { local_id, .. } if *local_id == mutation.local_id
        ));

        assert!(outbox.dismiss_failed(mutation.local_id).unwrap());
        assert!(outbox.failed_mutations().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_network_failure_stops_pass_and_closes_gate() {
        let config = OutboxConfig {
            backoff: BackoffConfig::default(),
            ..OutboxConfig::for_testing()
        };
        let (_dir, _store, outbox, sink) = setup(config);
        outbox.enqueue(update_of(Uuid::new_v4())).unwrap();
        outbox.enqueue(update_of(Uuid::new_v4())).unwrap();
        let transport = ScriptedTransport::new(Vec::new());

        let report = outbox.drain_once(&transport, &sink).await.unwrap();
        assert!(report.offline);
        assert_eq!(transport.sent().len(), 1);
        assert_eq!(outbox.pending().unwrap()[0].attempt, 1);

        let again = outbox.drain_once(&transport, &sink).await.unwrap();
        assert!(again.deferred);
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_rebases_are_bounded() {
        let (_dir, _store, outbox, sink) = setup(OutboxConfig::for_testing());
        outbox.enqueue(update_of(Uuid::new_v4())).unwrap();
        let transport = ScriptedTransport::new([AckStatus::Retry; 3]);

        for _ in 0..2 {
            assert_eq!(outbox.drain_once(&transport, &sink).await.unwrap().rebased, 1);
        }
        let report = outbox.drain_once(&transport, &sink).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(outbox.failed_mutations().unwrap()[0]
            .last_error
            .as_deref()
            .unwrap()
            .contains("conflict"));
    }
}
