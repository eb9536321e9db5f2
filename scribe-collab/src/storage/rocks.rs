//! RocksDB-backed document store.
//!
//! Column families:
//! - `documents`: UTF-8 text snapshots (LZ4 compressed), keyed by uuid
//! - `metadata`: bincode-encoded [`DocumentRecord`], keyed by uuid
//!
//! Both families are always written together in one batch.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{sort_for_listing, DocumentRecord, DocumentStorage, StoreError};

const CF_DOCUMENTS: &str = "documents";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("scribe_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
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

fn encode_record(record: &DocumentRecord) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_record(bytes: &[u8]) -> Result<DocumentRecord, StoreError> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(record)
}

/// RocksDB-backed document store.
pub struct RocksStore {
    /// Single-threaded column family mode; callers serialize through tokio
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
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

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            CF_DOCUMENTS => {
                // Values are already LZ4 framed.
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Check if a document exists.
    pub fn document_exists(&self, uuid: Uuid) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(cf, uuid.as_bytes())?.is_some())
    }

    /// Force memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        for name in COLUMN_FAMILIES {
            self.db.flush_cf(self.cf(name)?)?;
        }
        Ok(())
    }

    fn load_record(&self, uuid: Uuid) -> Result<Option<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(cf, uuid.as_bytes())?
            .map(|bytes| decode_record(&bytes))
            .transpose()
    }

    /// Write text and record in one atomic batch.
    fn write(&self, record: &DocumentRecord, text: &str) -> Result<(), StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let compressed = lz4_flex::compress_prepend_size(text.as_bytes());
        let key = record.uuid.as_bytes();

        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, key, &compressed);
        batch.put_cf(cf_meta, key, encode_record(record)?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl DocumentStorage for RocksStore {
    fn load_document_text(&self, uuid: Uuid) -> Result<String, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = self
            .db
            .get_cf(cf, uuid.as_bytes())?
            .ok_or(StoreError::NotFound(uuid))?;
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        String::from_utf8(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    fn save_document_text(&self, uuid: Uuid, text: &str) -> Result<DocumentRecord, StoreError> {
        let mut record = self.load_record(uuid)?.ok_or(StoreError::NotFound(uuid))?;
        record.touch();
        self.write(&record, text)?;
        log::debug!("Saved document {uuid} ({} bytes)", text.len());
        Ok(record)
    }

    fn create_document(&self, uuid: Uuid, owner: &str) -> Result<DocumentRecord, StoreError> {
        if self.document_exists(uuid)? {
            return Err(StoreError::AlreadyExists(uuid));
        }
        let record = DocumentRecord::new(uuid, owner);
        self.write(&record, "")?;
        Ok(record)
    }

    fn document_record(&self, uuid: Uuid) -> Result<DocumentRecord, StoreError> {
        self.load_record(uuid)?.ok_or(StoreError::NotFound(uuid))
    }

    fn list_documents(&self, limit: usize) -> Result<Vec<DocumentRecord>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut records = Vec::new();

        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, value) = item?;
            if key.len() != 16 {
                log::warn!("Skipping metadata entry with {}-byte key", key.len());
                continue;
            }
            records.push(decode_record(&value)?);
        }

        sort_for_listing(&mut records, limit);
        Ok(records)
    }

    fn delete_document(&self, uuid: Uuid) -> Result<(), StoreError> {
        if !self.document_exists(uuid)? {
            return Err(StoreError::NotFound(uuid));
        }
        let key = uuid.as_bytes();

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_DOCUMENTS)?, key);
        batch.delete_cf(self.cf(CF_METADATA)?, key);
        self.db.write(batch)?;
        log::info!("Deleted document {uuid}");
        Ok(())
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
