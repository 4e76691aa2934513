//! Per-entity async mutual exclusion.
//!
//! Read-modify-write sequences on one node (local edit, remote apply,
//! rebase) take the node's lock; different nodes never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

/// Idle entries are pruned once the table grows past this.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Default)]
pub struct EntityLocks {
    table: Mutex<HashMap<Uuid, Arc<AsyncMutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `id`.
    pub async fn lock(&self, id: Uuid) -> OwnedMutexGuard<()> {
        let slot = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            if table.len() > PRUNE_THRESHOLD {
                table.retain(|_, slot| Arc::strong_count(slot) > 1);
            }
            Arc::clone(table.entry(id).or_default())
        };
        slot.lock_owned().await
    }

    /// Lock several entities in a deadlock-free (sorted) order.
    pub async fn lock_all(&self, ids: impl IntoIterator<Item = Uuid>) -> Vec<OwnedMutexGuard<()>> {
        let mut ids: Vec<Uuid> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock(id).await);
        }
        guards
    }

    pub fn len(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
