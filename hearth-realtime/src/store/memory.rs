//! In-memory delay store ordered by due time.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{DelayStore, StoreError};
use crate::dispatch::NotificationEnvelope;

#[derive(Default)]
struct MemoryInner {
    /// Primary ordering: (due_at, key) so a range scan up to `now`
    /// yields exactly the due entries, oldest first.
    by_due: BTreeMap<(u64, Uuid), NotificationEnvelope>,
    /// key → due_at, so delete works from the key alone.
    index: HashMap<Uuid, u64>,
}

/// BTreeMap-backed [`DelayStore`]. No durability — used in tests and
/// deployments where losing scheduled notifications on restart is
/// acceptable.
pub struct MemoryDelayStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryDelayStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
        }
    }
}

impl Default for MemoryDelayStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DelayStore for MemoryDelayStore {
    async fn put(
        &self,
        key: Uuid,
        due_at: u64,
        envelope: &NotificationEnvelope,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(previous_due) = inner.index.insert(key, due_at) {
            inner.by_due.remove(&(previous_due, key));
        }
        inner.by_due.insert((due_at, key), envelope.clone());
        Ok(())
    }

    async fn pull_due(
        &self,
        now: u64,
    ) -> Result<Vec<(Uuid, NotificationEnvelope)>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .by_due
            .range(..=(now, Uuid::from_u128(u128::MAX)))
            .map(|((_, key), envelope)| (*key, envelope.clone()))
            .collect())
    }

    async fn delete(&self, key: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(due_at) = inner.index.remove(&key) {
            inner.by_due.remove(&(due_at, key));
        }
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize, StoreError> {
        Ok(self.inner.lock().await.by_due.len())
    }
}
