//! RocksDB-backed delay store.
//!
//! Column families:
//! - `scheduled` — envelopes keyed `<due_at:8 bytes BE><id:16 bytes>`,
//!   so an iterator from the start walks entries in due order
//! - `schedule_index` — envelope id → full `scheduled` key, so
//!   `delete(key)` needs no scan
//!
//! Values are the envelope's JSON (the payload is free-form JSON
//! already, so a self-describing encoding is the honest choice).

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use async_trait::async_trait;
use std::path::PathBuf;
use uuid::Uuid;

use super::{DelayStore, StoreError};
use crate::dispatch::NotificationEnvelope;

/// Column family names.
const CF_SCHEDULED: &str = "scheduled";
const CF_INDEX: &str = "schedule_index";

const COLUMN_FAMILIES: &[&str] = &[CF_SCHEDULED, CF_INDEX];

/// Scheduled key layout: 8 bytes due time + 16 bytes envelope id.
const KEY_LEN: usize = 24;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct DelayStoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 32MB — envelopes are tiny)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: true — losing a scheduled
    /// notification defeats the point of persisting it)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 8MB)
    pub write_buffer_size: usize,
}

impl Default for DelayStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("hearth_delay"),
            block_cache_size: 32 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 8 * 1024 * 1024,
        }
    }
}

impl DelayStoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// RocksDB-backed [`DelayStore`] that survives restarts.
pub struct RocksDelayStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: DelayStoreConfig,
}

impl RocksDelayStore {
    /// Open the store at the configured path, creating the database
    /// and column families if they don't exist.
    pub fn open(config: DelayStoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    fn cf_options(config: &DelayStoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Envelopes are small JSON blobs; heavier compression buys
        // nothing over LZ4's fast path.
        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("missing column family {name}")))
    }

    /// Build key: due_at (8 bytes BE) + envelope id (16 bytes).
    fn scheduled_key(due_at: u64, key: Uuid) -> [u8; KEY_LEN] {
        let mut bytes = [0u8; KEY_LEN];
        bytes[..8].copy_from_slice(&due_at.to_be_bytes());
        bytes[8..].copy_from_slice(key.as_bytes());
        bytes
    }

    fn due_of(key: &[u8]) -> Result<u64, StoreError> {
        if key.len() != KEY_LEN {
            return Err(StoreError::CorruptKey);
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[..8]);
        Ok(u64::from_be_bytes(buf))
    }

    fn id_of(key: &[u8]) -> Result<Uuid, StoreError> {
        if key.len() != KEY_LEN {
            return Err(StoreError::CorruptKey);
        }
        Uuid::from_slice(&key[8..]).map_err(|_| StoreError::CorruptKey)
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }
}

#[async_trait]
impl DelayStore for RocksDelayStore {
    async fn put(
        &self,
        key: Uuid,
        due_at: u64,
        envelope: &NotificationEnvelope,
    ) -> Result<(), StoreError> {
        let cf_scheduled = self.cf(CF_SCHEDULED)?;
        let cf_index = self.cf(CF_INDEX)?;

        let value = serde_json::to_vec(envelope)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let scheduled_key = Self::scheduled_key(due_at, key);

        // Atomic batch: drop any previous entry for this key, then
        // write the new position plus the id index.
        let mut batch = WriteBatch::default();
        if let Some(previous) = self.db.get_cf(&cf_index, key.as_bytes())? {
            batch.delete_cf(&cf_scheduled, &previous);
        }
        batch.put_cf(&cf_scheduled, scheduled_key, &value);
        batch.put_cf(&cf_index, key.as_bytes(), scheduled_key);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    async fn pull_due(
        &self,
        now: u64,
    ) -> Result<Vec<(Uuid, NotificationEnvelope)>, StoreError> {
        let cf = self.cf(CF_SCHEDULED)?;

        let mut due = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            // Keys are due-ordered; the first future entry ends the scan.
            if Self::due_of(&key)? > now {
                break;
            }
            let envelope: NotificationEnvelope = serde_json::from_slice(&value)
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            due.push((Self::id_of(&key)?, envelope));
        }
        Ok(due)
    }

    async fn delete(&self, key: Uuid) -> Result<(), StoreError> {
        let cf_scheduled = self.cf(CF_SCHEDULED)?;
        let cf_index = self.cf(CF_INDEX)?;

        let Some(scheduled_key) = self.db.get_cf(&cf_index, key.as_bytes())? else {
            return Ok(());
        };
        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_scheduled, &scheduled_key);
        batch.delete_cf(&cf_index, key.as_bytes());
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }

    async fn pending_count(&self) -> Result<usize, StoreError> {
        let cf = self.cf(CF_SCHEDULED)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item.map_err(|e| StoreError::Database(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }
}
