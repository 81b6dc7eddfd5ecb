//! Materialized record state folded from committed operations.
//!
//! The change log owns the authoritative projection of each document; clients
//! keep a cached copy and feed it every operation they receive. Application is
//! keyed by sequence number, so replaying an operation is a no-op.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{Change, DocumentId, FieldMap, Operation, RecordId};

/// One materialized row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub fields: FieldMap,
    /// Sequence of the operation that created the record
    pub created_at: u64,
    /// Sequence of the last operation that touched the record
    pub updated_at: u64,
    /// Sequence of the last write per field
    pub field_versions: BTreeMap<String, u64>,
}

impl Record {
    fn new(id: RecordId, sequence: u64) -> Self {
        Self {
            id,
            fields: FieldMap::new(),
            created_at: sequence,
            updated_at: sequence,
            field_versions: BTreeMap::new(),
        }
    }

    fn write_fields(&mut self, fields: &FieldMap, sequence: u64) {
        for (name, value) in fields {
            if value.is_null() {
                self.fields.remove(name);
            } else {
                self.fields.insert(name.clone(), value.clone());
            }
            self.field_versions.insert(name.clone(), sequence);
        }
        self.updated_at = sequence;
    }
}

/// Record set of one document as of `sequence`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    doc_id: DocumentId,
    sequence: u64,
    records: BTreeMap<RecordId, Record>,
    /// Deleted record ids and the sequence that deleted them
    tombstones: BTreeMap<RecordId, u64>,
}

impl Projection {
    pub fn new(doc_id: DocumentId) -> Self {
        Self {
            doc_id,
            sequence: 0,
            records: BTreeMap::new(),
            tombstones: BTreeMap::new(),
        }
    }

    /// Fold operations in order on top of an empty projection.
    pub fn fold<'a, I>(doc_id: DocumentId, ops: I) -> Self
    where
        I: IntoIterator<Item = &'a Operation>,
    {
        let mut projection = Self::new(doc_id);
        for op in ops {
            projection.apply(op);
        }
        projection
    }

    /// Apply a committed operation.
    ///
    /// Returns `false` when the operation was already folded in (its sequence
    /// is not past the projection's) or belongs to another document.
    pub fn apply(&mut self, op: &Operation) -> bool {
        if op.doc_id != self.doc_id || op.sequence <= self.sequence {
            return false;
        }

        match &op.change {
            Change::CreateRecord { record_id, fields } => {
                if !self.tombstones.contains_key(record_id) {
                    self.records
                        .entry(record_id.clone())
                        .or_insert_with(|| Record::new(record_id.clone(), op.sequence))
                        .write_fields(fields, op.sequence);
                }
            }
            Change::SetFields { record_id, fields } => {
                if let Some(record) = self.records.get_mut(record_id) {
                    record.write_fields(fields, op.sequence);
                }
            }
            Change::DeleteRecord { record_id } => {
                self.records.remove(record_id);
                self.tombstones.entry(record_id.clone()).or_insert(op.sequence);
            }
        }

        self.sequence = op.sequence;
        true
    }

    pub fn doc_id(&self) -> DocumentId {
        self.doc_id
    }

    /// Sequence of the last applied operation (0 = empty document).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn record(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sequence that deleted the record, if it was deleted.
    pub fn deleted_at(&self, id: &str) -> Option<u64> {
        self.tombstones.get(id).copied()
    }

    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| e.to_string())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (projection, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| e.to_string())?;
        Ok(projection)
    }
}
