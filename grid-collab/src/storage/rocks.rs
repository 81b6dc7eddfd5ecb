//! RocksDB-backed operation store.
//!
//! Column families:
//! - `documents`: document metadata (bincode: schema, head, timestamps)
//! - `operations`: sealed operations keyed by `doc_id(16) ++ sequence(8, BE)`
//! - `snapshots`: LZ4 projections keyed like operations
//!
//! Big-endian sequence suffixes keep each document's operations contiguous and
//! in commit order, so `read_range` is a single forward scan.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{
    now_secs, open_operation, seal_operation, CompressedSnapshot, DocumentMetadata,
    OperationStore, StoreError,
};
use crate::model::{DocumentId, Operation};

const CF_DOCUMENTS: &str = "documents";
const CF_OPERATIONS: &str = "operations";
const CF_SNAPSHOTS: &str = "snapshots";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_OPERATIONS, CF_SNAPSHOTS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every append before acknowledging it (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("grid_data"),
            block_cache_size: 256 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
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

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable operation store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
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

        log::info!("Opened operation store at {}", config.path.display());
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

        match name {
            CF_DOCUMENTS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_OPERATIONS => {
                // Many small appends, range-scanned by doc_id prefix
                opts.set_max_write_buffer_number(4);
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_SNAPSHOTS => {
                // Values are already LZ4 blocks
                opts.set_max_write_buffer_number(2);
                opts.set_compression_type(DBCompressionType::None);
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    /// doc_id (16 bytes) + sequence (8 bytes big-endian).
    fn sequence_key(doc_id: DocumentId, sequence: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(doc_id.as_bytes());
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }

    /// Split a sequence key, returning `None` for other documents.
    fn parse_key(key: &[u8], doc_id: DocumentId) -> Option<u64> {
        if key.len() != 24 || &key[..16] != doc_id.as_bytes() {
            return None;
        }
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[16..24]);
        Some(u64::from_be_bytes(buf))
    }
}

impl OperationStore for RocksStore {
    fn create_document(&self, meta: &DocumentMetadata) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let key = meta.doc_id.as_bytes();
        if self.db.get_cf(cf, key)?.is_some() {
            return Err(StoreError::DocumentExists(meta.doc_id));
        }
        self.db.put_cf_opt(cf, key, meta.encode()?, &self.write_options())?;
        Ok(())
    }

    fn load_metadata(&self, doc_id: DocumentId) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        match self.db.get_cf(cf, doc_id.as_bytes())? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(doc_id)),
        }
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let bytes: [u8; 16] = key
                .as_ref()
                .try_into()
                .map_err(|_| StoreError::Deserialization("invalid document key".into()))?;
            ids.push(Uuid::from_bytes(bytes));
        }
        Ok(ids)
    }

    fn append(&self, op: &Operation) -> Result<(), StoreError> {
        let cf_ops = self.cf(CF_OPERATIONS)?;
        let cf_docs = self.cf(CF_DOCUMENTS)?;

        let key = Self::sequence_key(op.doc_id, op.sequence);
        if self.db.get_cf(cf_ops, &key)?.is_some() {
            return Err(StoreError::AlreadyStored {
                doc_id: op.doc_id,
                sequence: op.sequence,
            });
        }

        let mut meta = self.load_metadata(op.doc_id)?;
        meta.head = op.sequence;
        meta.updated_at = now_secs();

        // Operation and head land together or not at all
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_ops, &key, seal_operation(op)?);
        batch.put_cf(cf_docs, op.doc_id.as_bytes(), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn read_range(
        &self,
        doc_id: DocumentId,
        from: u64,
        to: u64,
    ) -> Result<Vec<Operation>, StoreError> {
        if from > to {
            return Ok(Vec::new());
        }
        let cf = self.cf(CF_OPERATIONS)?;
        let start = Self::sequence_key(doc_id, from);

        let mut ops = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Forward)) {
            let (key, value) = item?;
            let sequence = match Self::parse_key(&key, doc_id) {
                Some(seq) if seq <= to => seq,
                _ => break,
            };
            ops.push(open_operation(&value, doc_id, sequence)?);
        }
        Ok(ops)
    }

    fn save_snapshot(
        &self,
        doc_id: DocumentId,
        sequence: u64,
        projection: &[u8],
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let snapshot = CompressedSnapshot::compress(sequence, projection);
        self.db.put_cf_opt(
            cf,
            Self::sequence_key(doc_id, sequence),
            snapshot.encode()?,
            &self.write_options(),
        )?;
        Ok(())
    }

    fn latest_snapshot(
        &self,
        doc_id: DocumentId,
        at_or_before: u64,
    ) -> Result<Option<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let start = Self::sequence_key(doc_id, at_or_before);

        let mut iter = self.db.iterator_cf(cf, IteratorMode::From(&start, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, value) = item?;
                match Self::parse_key(&key, doc_id) {
                    Some(sequence) => {
                        let snapshot = CompressedSnapshot::decode(&value)?;
                        Ok(Some((sequence, snapshot.decompress()?)))
                    }
                    None => Ok(None),
                }
            }
            None => Ok(None),
        }
    }
}

/// Number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
