//! Core data model shared by the change log, the gateway and the wire protocol.
//!
//! A document is a table's record set. Every mutation against it is an
//! [`Operation`] carrying exactly one [`Change`]; operations are ordered by a
//! per-document sequence number starting at 1.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;
use uuid::Uuid;

/// Identifies a collaboratively edited document (one table).
pub type DocumentId = Uuid;

/// Identifies one live client connection.
pub type SessionId = Uuid;

/// Identifies a record (row) inside a document.
pub type RecordId = String;

/// Field name → value, ordered so encodings are deterministic.
pub type FieldMap = BTreeMap<String, FieldValue>;

/// A single cell value.
///
/// Externally tagged so it survives bincode; the HTTP layer converts to and
/// from plain JSON with [`FieldValue::from_json`] / [`FieldValue::to_json`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Text(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    /// Convert a JSON value. Objects have no cell representation.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, String> {
        use serde_json::Value;
        match value {
            Value::Null => Ok(FieldValue::Null),
            Value::Bool(b) => Ok(FieldValue::Bool(*b)),
            Value::Number(n) => n
                .as_f64()
                .map(FieldValue::Number)
                .ok_or_else(|| format!("number {n} is not representable")),
            Value::String(s) => Ok(FieldValue::Text(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(FieldValue::from_json)
                .collect::<Result<Vec<_>, _>>()
                .map(FieldValue::List),
            Value::Object(_) => Err("object values are not supported in cells".to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(*b),
            FieldValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::List(items) => Value::Array(items.iter().map(FieldValue::to_json).collect()),
        }
    }
}

/// Structural class of a change, used for conflict precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChangeKind {
    Create,
    Mutate,
    Delete,
}

/// The payload of an operation: one record-level mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    CreateRecord { record_id: RecordId, fields: FieldMap },
    /// `Null` values clear the field.
    SetFields { record_id: RecordId, fields: FieldMap },
    DeleteRecord { record_id: RecordId },
}

impl Change {
    pub fn create(record_id: impl Into<RecordId>, fields: FieldMap) -> Self {
        Change::CreateRecord { record_id: record_id.into(), fields }
    }

    pub fn set(record_id: impl Into<RecordId>, fields: FieldMap) -> Self {
        Change::SetFields { record_id: record_id.into(), fields }
    }

    /// Single-field convenience for [`Change::SetFields`].
    pub fn set_field(
        record_id: impl Into<RecordId>,
        field: impl Into<String>,
        value: FieldValue,
    ) -> Self {
        let mut fields = FieldMap::new();
        fields.insert(field.into(), value);
        Change::set(record_id, fields)
    }

    pub fn delete(record_id: impl Into<RecordId>) -> Self {
        Change::DeleteRecord { record_id: record_id.into() }
    }

    pub fn record_id(&self) -> &str {
        match self {
            Change::CreateRecord { record_id, .. }
            | Change::SetFields { record_id, .. }
            | Change::DeleteRecord { record_id } => record_id,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Change::CreateRecord { .. } => ChangeKind::Create,
            Change::SetFields { .. } => ChangeKind::Mutate,
            Change::DeleteRecord { .. } => ChangeKind::Delete,
        }
    }

    pub fn fields(&self) -> Option<&FieldMap> {
        match self {
            Change::CreateRecord { fields, .. } | Change::SetFields { fields, .. } => Some(fields),
            Change::DeleteRecord { .. } => None,
        }
    }
}

/// A committed, immutable mutation of one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub doc_id: DocumentId,
    /// Position in the document's log, starting at 1
    pub sequence: u64,
    /// Session that submitted the change (nil for anonymous HTTP writes)
    pub session_id: SessionId,
    /// Per-session submit counter; 0 disables duplicate detection
    pub client_sequence: u64,
    pub change: Change,
    /// Commit time in milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_field_value_from_json() {
        assert_eq!(FieldValue::from_json(&json!(null)).unwrap(), FieldValue::Null);
        assert_eq!(FieldValue::from_json(&json!(true)).unwrap(), FieldValue::Bool(true));
        assert_eq!(FieldValue::from_json(&json!(2.5)).unwrap(), FieldValue::Number(2.5));
        assert_eq!(FieldValue::from_json(&json!("x")).unwrap(), FieldValue::text("x"));
        assert_eq!(
            FieldValue::from_json(&json!(["a", "b"])).unwrap(),
            FieldValue::List(vec![FieldValue::text("a"), FieldValue::text("b")])
        );
        assert!(FieldValue::from_json(&json!({"nested": 1})).is_err());
    }

    #[test]
    fn test_field_value_to_json() {
        assert_eq!(FieldValue::Number(3.0).to_json(), json!(3.0));
        assert_eq!(FieldValue::Number(f64::NAN).to_json(), json!(null));
        assert_eq!(
            FieldValue::List(vec![FieldValue::Bool(false)]).to_json(),
            json!([false])
        );
    }

    #[test]
    fn test_change_accessors() {
        let create = Change::create("rec1", FieldMap::new());
        let set = Change::set_field("rec1", "name", FieldValue::text("X"));
        let delete = Change::delete("rec1");

        assert_eq!(create.kind(), ChangeKind::Create);
        assert_eq!(set.kind(), ChangeKind::Mutate);
        assert_eq!(delete.kind(), ChangeKind::Delete);
        assert_eq!(set.record_id(), "rec1");
        assert_eq!(set.fields().unwrap().len(), 1);
        assert!(delete.fields().is_none());
    }

    #[test]
    fn test_change_kind_precedence() {
        assert!(ChangeKind::Create < ChangeKind::Mutate);
        assert!(ChangeKind::Mutate < ChangeKind::Delete);
    }

    #[test]
    fn test_operation_bincode_roundtrip() {
        let op = Operation {
            doc_id: Uuid::new_v4(),
            sequence: 7,
            session_id: Uuid::new_v4(),
            client_sequence: 3,
            change: Change::set_field("rec1", "score", FieldValue::Number(4.5)),
            timestamp_ms: now_millis(),
        };
        let bytes = bincode::serde::encode_to_vec(&op, bincode::config::standard()).unwrap();
        let (decoded, _): (Operation, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, op);
    }
}
