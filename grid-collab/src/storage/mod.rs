//! Durable operation storage.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   append(op)    ┌────────────────────────────────────┐
//! │ ChangeLog   │ ──────────────► │ OperationStore                     │
//! │ (per-doc    │                 │                                    │
//! │  writer)    │ ◄────────────── │  RocksStore  (storage_path = Some) │
//! └─────────────┘   read_range    │  MemoryStore (storage_path = None) │
//!                                 └──────────────┬─────────────────────┘
//!                                                │ column families
//!                                                ▼
//!                     ┌──────────────────────────────────────────────┐
//!                     │ CF "documents" : schema, head, timestamps    │
//!                     │ CF "operations": sealed ops (doc_id ++ seq)  │
//!                     │ CF "snapshots" : LZ4 projections             │
//!                     └──────────────────────────────────────────────┘
//! ```
//!
//! Operations are append-only: a key, once written, is never overwritten.
//! `append` returns only after the operation and the new head are durable.

pub mod envelope;
pub mod memory;
pub mod rocks;
pub mod snapshot;

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;

use crate::model::{DocumentId, Operation};
use crate::schema::TableSchema;

pub use envelope::{open_operation, seal_operation, SealedOperation};
pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};
pub use snapshot::CompressedSnapshot;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("document not found: {0}")]
    NotFound(DocumentId),
    #[error("document already exists: {0}")]
    DocumentExists(DocumentId),
    #[error("operation {sequence} of {doc_id} already stored")]
    AlreadyStored { doc_id: DocumentId, sequence: u64 },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("checksum mismatch for operation {sequence} of {doc_id}")]
    Corrupted { doc_id: DocumentId, sequence: u64 },
}

impl StoreError {
    /// Stored data can no longer be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::Corrupted { .. } | StoreError::Deserialization(_) | StoreError::Compression(_)
        )
    }
}

/// Per-document metadata persisted alongside the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub doc_id: DocumentId,
    pub schema: TableSchema,
    /// Sequence of the last committed operation
    pub head: u64,
    /// Seconds since epoch
    pub created_at: u64,
    /// Seconds since epoch
    pub updated_at: u64,
}

impl DocumentMetadata {
    pub fn new(doc_id: DocumentId, schema: TableSchema) -> Self {
        let now = now_secs();
        Self {
            doc_id,
            schema,
            head: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Backend for the change log.
///
/// Implementations must be safe to read concurrently with a single writer per
/// document; the change log guarantees it never appends to one document from
/// two places at once.
pub trait OperationStore: Send + Sync {
    /// Register a new, empty document.
    fn create_document(&self, meta: &DocumentMetadata) -> Result<(), StoreError>;

    fn load_metadata(&self, doc_id: DocumentId) -> Result<DocumentMetadata, StoreError>;

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError>;

    /// Persist `op` and advance the document head to `op.sequence` atomically.
    fn append(&self, op: &Operation) -> Result<(), StoreError>;

    /// Operations with `from <= sequence <= to`, ascending.
    fn read_range(&self, doc_id: DocumentId, from: u64, to: u64)
        -> Result<Vec<Operation>, StoreError>;

    /// Store an encoded projection taken at `sequence`.
    fn save_snapshot(&self, doc_id: DocumentId, sequence: u64, projection: &[u8])
        -> Result<(), StoreError>;

    /// Newest snapshot at or before `at_or_before`, decompressed.
    fn latest_snapshot(&self, doc_id: DocumentId, at_or_before: u64)
        -> Result<Option<(u64, Vec<u8>)>, StoreError>;
}
