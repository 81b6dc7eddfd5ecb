//! In-memory operation store, used when no storage path is configured.
//!
//! Values go through the same sealing and compression as the RocksDB store so
//! both backends behave identically on reads.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

use super::{
    open_operation, seal_operation, CompressedSnapshot, DocumentMetadata, OperationStore,
    StoreError,
};
use crate::model::{DocumentId, Operation};

#[derive(Default)]
struct MemoryDocument {
    meta: Option<DocumentMetadata>,
    operations: BTreeMap<u64, Vec<u8>>,
    snapshots: BTreeMap<u64, CompressedSnapshot>,
}

/// Volatile store; contents are lost when dropped.
#[derive(Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<DocumentId, MemoryDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored bytes of an operation. Test hook for corruption.
    #[cfg(test)]
    pub(crate) fn tamper(&self, doc_id: DocumentId, sequence: u64, bytes: Vec<u8>) {
        if let Some(doc) = self.documents.write().get_mut(&doc_id) {
            doc.operations.insert(sequence, bytes);
        }
    }
}

impl OperationStore for MemoryStore {
    fn create_document(&self, meta: &DocumentMetadata) -> Result<(), StoreError> {
        let mut docs = self.documents.write();
        let doc = docs.entry(meta.doc_id).or_default();
        if doc.meta.is_some() {
            return Err(StoreError::DocumentExists(meta.doc_id));
        }
        doc.meta = Some(meta.clone());
        Ok(())
    }

    fn load_metadata(&self, doc_id: DocumentId) -> Result<DocumentMetadata, StoreError> {
        self.documents
            .read()
            .get(&doc_id)
            .and_then(|doc| doc.meta.clone())
            .ok_or(StoreError::NotFound(doc_id))
    }

    fn list_documents(&self) -> Result<Vec<DocumentId>, StoreError> {
        Ok(self
            .documents
            .read()
            .iter()
            .filter(|(_, doc)| doc.meta.is_some())
            .map(|(id, _)| *id)
            .collect())
    }

    fn append(&self, op: &Operation) -> Result<(), StoreError> {
        let sealed = seal_operation(op)?;
        let mut docs = self.documents.write();
        let doc = docs.get_mut(&op.doc_id).ok_or(StoreError::NotFound(op.doc_id))?;
        let meta = doc.meta.as_mut().ok_or(StoreError::NotFound(op.doc_id))?;

        if doc.operations.contains_key(&op.sequence) {
            return Err(StoreError::AlreadyStored {
                doc_id: op.doc_id,
                sequence: op.sequence,
            });
        }
        doc.operations.insert(op.sequence, sealed);
        meta.head = op.sequence;
        meta.updated_at = super::now_secs();
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
        let docs = self.documents.read();
        let doc = docs.get(&doc_id).ok_or(StoreError::NotFound(doc_id))?;
        doc.operations
            .range(from..=to)
            .map(|(seq, bytes)| open_operation(bytes, doc_id, *seq))
            .collect()
    }

    fn save_snapshot(
        &self,
        doc_id: DocumentId,
        sequence: u64,
        projection: &[u8],
    ) -> Result<(), StoreError> {
        let mut docs = self.documents.write();
        let doc = docs.get_mut(&doc_id).ok_or(StoreError::NotFound(doc_id))?;
        doc.snapshots
            .insert(sequence, CompressedSnapshot::compress(sequence, projection));
        Ok(())
    }

    fn latest_snapshot(
        &self,
        doc_id: DocumentId,
        at_or_before: u64,
    ) -> Result<Option<(u64, Vec<u8>)>, StoreError> {
        let docs = self.documents.read();
        let doc = docs.get(&doc_id).ok_or(StoreError::NotFound(doc_id))?;
        match doc.snapshots.range(..=at_or_before).next_back() {
            Some((seq, snapshot)) => Ok(Some((*seq, snapshot.decompress()?))),
            None => Ok(None),
        }
    }
}
