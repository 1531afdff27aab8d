//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents` — Current document text (LZ4 compressed), keyed by document id
//! - `metadata`  — Version and bookkeeping (bincode), keyed by document id
//! - `history`   — Append-only snapshots (LZ4 compressed), keyed by `<id>\0<seq:8 BE>`
//!
//! Every mutation writes its content and metadata rows through one
//! `WriteBatch`, so a reader never sees a version without its text.
//! Read-modify-write operations (create, compare-and-swap, snapshot append)
//! are serialised by an in-process write lock.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};

use super::{DocumentStore, StoreError, StoredDocument};

/// Column family names.
const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";
const CF_HISTORY: &str = "history";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA, CF_HISTORY];

/// Separates the document id from the sequence number in history keys.
const HISTORY_SEPARATOR: u8 = 0;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/tandem"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Config rooted at `path` with default tuning.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Create config for testing (small caches).
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

/// Per-document bookkeeping stored in the `metadata` column family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: String,
    /// Durable version, bumped only by compare-and-swap writes
    pub version: u64,
    /// Uncompressed content size in bytes
    pub content_size: u64,
    /// Compressed content size in bytes
    pub compressed_size: u64,
    /// Number of history snapshots appended so far
    pub snapshot_count: u64,
    /// Creation timestamp (milliseconds since epoch)
    pub created_at: u64,
    /// Last modified timestamp (milliseconds since epoch)
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(doc_id: &str, version: u64, created_at: SystemTime) -> Self {
        let now = epoch_millis(created_at);
        Self {
            doc_id: doc_id.to_string(),
            version,
            content_size: 0,
            compressed_size: 0,
            snapshot_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = epoch_millis(SystemTime::now());
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed [`DocumentStore`].
pub struct RocksStore {
    /// RocksDB instance (single-threaded mode, concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serialises read-modify-write sequences
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path.
    ///
    /// Creates the database and column families if they don't exist.
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

        log::info!("Opened document store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

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
            CF_DOCUMENTS | CF_METADATA => {
                // Point lookups by document id
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_HISTORY => {
                // Values are already LZ4 framed
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Load document metadata, `None` if the document does not exist.
    pub fn load_metadata(&self, doc_id: &str) -> Result<Option<DocumentMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => Ok(Some(DocumentMetadata::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_content(&self, doc_id: &str) -> Result<String, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(compressed) => decompress_text(&compressed),
            None => Ok(String::new()),
        }
    }

    fn read_document(&self, doc_id: &str) -> Result<Option<StoredDocument>, StoreError> {
        let Some(meta) = self.load_metadata(doc_id)? else {
            return Ok(None);
        };
        let content = self.load_content(doc_id)?;
        Ok(Some(StoredDocument {
            id: doc_id.to_string(),
            content,
            version: meta.version,
            updated_at: SystemTime::UNIX_EPOCH + Duration::from_millis(meta.updated_at),
        }))
    }

    /// All history snapshots for a document, oldest first.
    pub fn history(&self, doc_id: &str) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_HISTORY)?;
        let prefix = history_prefix(doc_id);

        let mut snapshots = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            snapshots.push(decompress_text(&value)?);
        }
        Ok(snapshots)
    }

    /// List all document ids in the store.
    pub fn list_documents(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Writes ───────────────────────────────────────────────────────

    fn write(&self, batch: WriteBatch) -> Result<(), StoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Stage the content row and refresh size bookkeeping in `meta`.
    fn put_content(
        &self,
        batch: &mut WriteBatch,
        meta: &mut DocumentMetadata,
        content: &str,
    ) -> Result<(), StoreError> {
        let compressed = lz4_flex::compress_prepend_size(content.as_bytes());
        meta.content_size = content.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        batch.put_cf(self.cf(CF_DOCUMENTS)?, meta.doc_id.as_bytes(), &compressed);
        Ok(())
    }

    fn put_metadata(
        &self,
        batch: &mut WriteBatch,
        meta: &DocumentMetadata,
    ) -> Result<(), StoreError> {
        batch.put_cf(self.cf(CF_METADATA)?, meta.doc_id.as_bytes(), meta.encode()?);
        Ok(())
    }

    fn create_sync(&self, doc: &StoredDocument) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        if self.load_metadata(&doc.id)?.is_some() {
            return Err(StoreError::AlreadyExists(doc.id.clone()));
        }

        let mut meta = DocumentMetadata::new(&doc.id, doc.version, doc.updated_at);
        let mut batch = WriteBatch::default();
        self.put_content(&mut batch, &mut meta, &doc.content)?;
        self.put_metadata(&mut batch, &meta)?;
        self.write(batch)
    }

    fn compare_and_swap_sync(
        &self,
        doc_id: &str,
        content: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock();
        let mut meta = match self.load_metadata(doc_id)? {
            Some(meta) if meta.version == expected_version => meta,
            _ => return Ok(false),
        };

        meta.version = expected_version + 1;
        meta.touch();
        let mut batch = WriteBatch::default();
        self.put_content(&mut batch, &mut meta, content)?;
        self.put_metadata(&mut batch, &meta)?;
        self.write(batch)?;
        Ok(true)
    }

    fn update_content_sync(&self, doc_id: &str, content: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut meta = self
            .load_metadata(doc_id)?
            .ok_or_else(|| StoreError::NotFound(doc_id.to_string()))?;

        meta.touch();
        let mut batch = WriteBatch::default();
        self.put_content(&mut batch, &mut meta, content)?;
        self.put_metadata(&mut batch, &meta)?;
        self.write(batch)
    }

    fn append_snapshot_sync(&self, doc_id: &str, content: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let mut meta = self
            .load_metadata(doc_id)?
            .ok_or_else(|| StoreError::NotFound(doc_id.to_string()))?;

        let key = history_key(doc_id, meta.snapshot_count);
        meta.snapshot_count += 1;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_HISTORY)?,
            &key,
            lz4_flex::compress_prepend_size(content.as_bytes()),
        );
        self.put_metadata(&mut batch, &meta)?;
        self.write(batch)
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

#[async_trait]
impl DocumentStore for RocksStore {
    async fn get(&self, id: &str) -> Result<Option<StoredDocument>, StoreError> {
        self.read_document(id)
    }

    async fn create(&self, doc: StoredDocument) -> Result<(), StoreError> {
        self.create_sync(&doc)
    }

    async fn conditional_update_content(
        &self,
        id: &str,
        content: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        self.compare_and_swap_sync(id, content, expected_version)
    }

    async fn update_content(&self, id: &str, content: &str) -> Result<(), StoreError> {
        self.update_content_sync(id, content)
    }

    async fn append_snapshot(&self, id: &str, content: &str) -> Result<(), StoreError> {
        self.append_snapshot_sync(id, content)
    }
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.config.path)
            .finish()
    }
}

fn history_prefix(doc_id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(doc_id.len() + 1);
    key.extend_from_slice(doc_id.as_bytes());
    key.push(HISTORY_SEPARATOR);
    key
}

/// History key: `<doc_id><0x00><seq:8 bytes big-endian>`.
fn history_key(doc_id: &str, seq: u64) -> Vec<u8> {
    let mut key = history_prefix(doc_id);
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn decompress_text(compressed: &[u8]) -> Result<String, StoreError> {
    let raw = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    String::from_utf8(raw).map_err(|e| StoreError::Deserialization(e.to_string()))
}

fn epoch_millis(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
