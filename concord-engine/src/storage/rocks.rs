//! RocksDB-backed operation log and snapshot store.
//!
//! Column families:
//! - `operations` — committed operation records (LZ4 compressed, keyed by
//!   doc_id:version so a range scan replays history in order)
//! - `snapshots`  — latest snapshot per document (LZ4 compressed)
//! - `metadata`   — per-document bookkeeping (bincode)
//!
//! The operations column family only ever grows: records are the source
//! of truth for document history and are never rewritten or deleted.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

use super::{OperationLog, OperationRecord, Snapshot, SnapshotStore, StoreError};

/// Column family names.
const CF_OPERATIONS: &str = "operations";
const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_OPERATIONS, CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("concord_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Per-document bookkeeping stored alongside the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentMeta {
    doc_id: Uuid,
    /// Last committed version.
    version: u64,
    /// Version of the latest snapshot, 0 if none.
    snapshot_version: u64,
    /// Creation timestamp (seconds since epoch).
    created_at: u64,
    /// Last modified timestamp (seconds since epoch).
    updated_at: u64,
}

impl DocumentMeta {
    fn new(doc_id: Uuid) -> Self {
        let now = now_secs();
        Self {
            doc_id,
            version: 0,
            snapshot_version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable RocksDB store implementing both the operation log and the
/// snapshot store.
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store at the configured path, creating the database and
    /// column families as needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self { db, config })
    }

    /// Build column-family-specific options.
    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_OPERATIONS => {
                // Many small appends, range-scanned by doc_id prefix.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_SNAPSHOTS => {
                // Large, infrequently rewritten point-lookup values.
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    /// Build an operation key: doc_id (16 bytes) + version (8 bytes
    /// big-endian), so versions scan in order within a document.
    fn op_key(doc_id: Uuid, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }

    fn load_meta(&self, doc_id: Uuid) -> Result<Option<DocumentMeta>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl OperationLog for RocksStore {
    async fn operations_since(
        &self,
        doc_id: Uuid,
        version: u64,
    ) -> Result<Vec<OperationRecord>, StoreError> {
        let cf = self.cf(CF_OPERATIONS)?;
        let start_key = Self::op_key(doc_id, version + 1);

        let mut records = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() < 24 || &key[..16] != doc_id.as_bytes() {
                break;
            }
            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            records.push(decode::<OperationRecord>(&decompressed)?);
        }
        Ok(records)
    }

    async fn save_operation(&self, record: OperationRecord) -> Result<(), StoreError> {
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self
            .load_meta(record.doc_id)?
            .unwrap_or_else(|| DocumentMeta::new(record.doc_id));
        let expected = meta.version + 1;
        if record.version != expected {
            return Err(StoreError::VersionConflict {
                expected,
                got: record.version,
            });
        }
        meta.version = record.version;
        meta.updated_at = now_secs();

        let compressed = lz4_flex::compress_prepend_size(&encode(&record)?);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_ops, Self::op_key(record.doc_id, record.version), &compressed);
        batch.put_cf(&cf_meta, record.doc_id.as_bytes(), &encode(&meta)?);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }
}

impl SnapshotStore for RocksStore {
    async fn latest_snapshot(&self, doc_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => {
                let bytes = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                Ok(Some(decode(&bytes)?))
            }
            None => Ok(None),
        }
    }

    async fn save_snapshot(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let mut meta = self
            .load_meta(snapshot.doc_id)?
            .unwrap_or_else(|| DocumentMeta::new(snapshot.doc_id));
        meta.snapshot_version = snapshot.version;
        meta.updated_at = now_secs();

        let compressed = lz4_flex::compress_prepend_size(&encode(&snapshot)?);

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, snapshot.doc_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, snapshot.doc_id.as_bytes(), &encode(&meta)?);
        self.db.write_opt(batch, &self.write_opts())?;
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
