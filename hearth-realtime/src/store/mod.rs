//! Delay store: durable holding pen for future-dated envelopes.
//!
//! Architecture:
//! ```text
//! ┌───────────────┐   put(key, due_at)   ┌──────────────────┐
//! │  Scheduler    │ ───────────────────► │    DelayStore    │
//! │ (sweep task)  │ ◄─────────────────── │                  │
//! └───────────────┘   pull_due(now)      │  ordered by due  │
//!         │                              │  time, not by    │
//!         ▼ delete(key) after dispatch   │  insertion       │
//!   NotificationDispatcher               └──────────────────┘
//! ```
//!
//! Plain TTL/expiry stores are not enough here: expiry deletes, it
//! does not call anyone back. Both implementations keep entries in a
//! structure sorted by due time so `pull_due` is a cheap prefix scan.
//!
//! - [`memory::MemoryDelayStore`] — BTreeMap-backed; tests and
//!   single-process deployments.
//! - [`rocks::RocksDelayStore`] — RocksDB-backed; survives restarts.

pub mod memory;
pub mod rocks;

pub use memory::MemoryDelayStore;
pub use rocks::{DelayStoreConfig, RocksDelayStore};

use async_trait::async_trait;
use uuid::Uuid;

use crate::dispatch::NotificationEnvelope;

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    Database(String),
    /// Envelope not found
    NotFound(Uuid),
    /// Serialization failed
    Serialization(String),
    /// Deserialization failed
    Deserialization(String),
    /// Corrupt key bytes
    CorruptKey,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Envelope not found: {id}"),
            StoreError::Serialization(e) => write!(f, "Serialization error: {e}"),
            StoreError::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CorruptKey => write!(f, "Corrupt schedule key"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Sorted key-value store for future-dated envelopes.
///
/// `pull_due` returns entries without removing them; the sweep deletes
/// each entry only after it has been handed to the dispatcher, so a
/// crash between the two at worst re-dispatches.
#[async_trait]
pub trait DelayStore: Send + Sync {
    /// Store an envelope under its due time. Re-putting the same key
    /// replaces the previous entry.
    async fn put(
        &self,
        key: Uuid,
        due_at: u64,
        envelope: &NotificationEnvelope,
    ) -> Result<(), StoreError>;

    /// Every entry with `due_at <= now`, oldest first.
    async fn pull_due(&self, now: u64)
        -> Result<Vec<(Uuid, NotificationEnvelope)>, StoreError>;

    /// Remove an entry. Idempotent.
    async fn delete(&self, key: Uuid) -> Result<(), StoreError>;

    /// Number of envelopes currently held.
    async fn pending_count(&self) -> Result<usize, StoreError>;
}
