//! Conflict resolution for submissions built on a stale base.
//!
//! A client proposes a change against the document as of `base`. When other
//! operations committed after `base`, the change is rebased over them:
//!
//! ```text
//! base ── op(base+1) ── op(base+2) ── … ── head ── proposed'
//!              └──── intervening ────┘
//! ```
//!
//! Field writes are last-writer-wins per (record, field) in commit order, so the
//! proposed values win over intervening ones. Structural changes follow a fixed
//! precedence, creation before mutation before deletion, and a record deleted by
//! an intervening operation is never written again.

use std::collections::BTreeSet;
use thiserror::Error;

use crate::model::{Change, ChangeKind, Operation, RecordId};

/// The proposed change targets a record that an intervening operation deleted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record '{record_id}' was deleted at sequence {deleted_at}")]
pub struct Unresolvable {
    pub record_id: RecordId,
    pub deleted_at: u64,
}

/// Outcome of rebasing a change.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The change to commit after the intervening operations
    pub change: Change,
    /// (record, field) pairs whose intervening value this change overwrites
    pub overridden: Vec<(RecordId, String)>,
}

/// Deterministic, stateless transform engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformEngine;

impl TransformEngine {
    pub fn new() -> Self {
        Self
    }

    /// Rebase `proposed` (built at `base`) over `intervening`.
    ///
    /// Operations at or below `base` are ignored; the rest are visited in
    /// sequence order regardless of slice order.
    pub fn resolve(
        &self,
        base: u64,
        proposed: Change,
        intervening: &[Operation],
    ) -> Result<Resolution, Unresolvable> {
        let mut relevant: Vec<&Operation> = intervening
            .iter()
            .filter(|op| op.sequence > base && op.change.record_id() == proposed.record_id())
            .collect();
        relevant.sort_by_key(|op| op.sequence);

        let mut change = proposed;
        let mut overridden = BTreeSet::new();

        for op in relevant {
            change = match (op.change.kind(), change) {
                (ChangeKind::Delete, Change::DeleteRecord { record_id }) => {
                    Change::DeleteRecord { record_id }
                }
                (ChangeKind::Delete, _) => {
                    return Err(Unresolvable {
                        record_id: op.change.record_id().to_string(),
                        deleted_at: op.sequence,
                    });
                }
                // Both sides created the record: ours degrades to a field write.
                (ChangeKind::Create, Change::CreateRecord { record_id, fields }) => {
                    collect_overlap(&mut overridden, &op.change, &record_id, &fields);
                    Change::SetFields { record_id, fields }
                }
                // The record already existed at base; the record checks refuse it.
                (ChangeKind::Mutate, create @ Change::CreateRecord { .. }) => create,
                (_, Change::SetFields { record_id, fields }) => {
                    collect_overlap(&mut overridden, &op.change, &record_id, &fields);
                    Change::SetFields { record_id, fields }
                }
                (_, delete @ Change::DeleteRecord { .. }) => delete,
            };
        }

        Ok(Resolution {
            change,
            overridden: overridden.into_iter().collect(),
        })
    }
}

fn collect_overlap(
    overridden: &mut BTreeSet<(RecordId, String)>,
    theirs: &Change,
    record_id: &str,
    ours: &crate::model::FieldMap,
) {
    if let Some(their_fields) = theirs.fields() {
        for name in their_fields.keys().filter(|name| ours.contains_key(*name)) {
            overridden.insert((record_id.to_string(), name.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FieldMap, FieldValue};
    use uuid::Uuid;

    fn op(sequence: u64, change: Change) -> Operation {
        Operation {
            doc_id: Uuid::nil(),
            sequence,
            session_id: Uuid::new_v4(),
            client_sequence: 0,
            change,
            timestamp_ms: 0,
        }
    }

    fn name(value: &str) -> FieldMap {
        let mut f = FieldMap::new();
        f.insert("name".into(), FieldValue::text(value));
        f
    }

    #[test]
    fn test_concurrent_field_write_last_writer_wins() {
        let engine = TransformEngine::new();
        let intervening = vec![op(6, Change::set_field("1", "name", FieldValue::text("X")))];
        let proposed = Change::set_field("1", "name", FieldValue::text("Y"));

        let resolution = engine.resolve(5, proposed.clone(), &intervening).unwrap();
        assert_eq!(resolution.change, proposed);
        assert_eq!(resolution.overridden, vec![("1".to_string(), "name".to_string())]);
    }

    #[test]
    fn test_disjoint_fields_not_overridden() {
        let engine = TransformEngine::new();
        let intervening = vec![op(6, Change::set_field("1", "status", FieldValue::text("done")))];
        let proposed = Change::set_field("1", "name", FieldValue::text("Y"));

        let resolution = engine.resolve(5, proposed.clone(), &intervening).unwrap();
        assert_eq!(resolution.change, proposed);
        assert!(resolution.overridden.is_empty());
    }

    #[test]
    fn test_edit_after_intervening_delete_is_unresolvable() {
        let engine = TransformEngine::new();
        let intervening = vec![op(6, Change::delete("1"))];
        let proposed = Change::set_field("1", "name", FieldValue::text("Y"));

        let err = engine.resolve(5, proposed, &intervening).unwrap_err();
        assert_eq!(err, Unresolvable { record_id: "1".into(), deleted_at: 6 });
    }

    #[test]
    fn test_create_after_intervening_delete_is_unresolvable() {
        let engine = TransformEngine::new();
        let intervening = vec![op(6, Change::delete("1"))];
        assert!(engine.resolve(5, Change::create("1", name("new")), &intervening).is_err());
    }

    #[test]
    fn test_delete_after_delete_stays_delete() {
        let engine = TransformEngine::new();
        let intervening = vec![op(6, Change::delete("1"))];
        let resolution = engine.resolve(5, Change::delete("1"), &intervening).unwrap();
        assert_eq!(resolution.change, Change::delete("1"));
    }

    #[test]
    fn test_delete_wins_over_mutation() {
        let engine = TransformEngine::new();
        let intervening = vec![op(6, Change::set_field("1", "name", FieldValue::text("X")))];
        let resolution = engine.resolve(5, Change::delete("1"), &intervening).unwrap();
        assert_eq!(resolution.change, Change::delete("1"));
    }

    #[test]
    fn test_concurrent_create_becomes_set() {
        let engine = TransformEngine::new();
        let intervening = vec![op(6, Change::create("1", name("theirs")))];
        let resolution = engine.resolve(5, Change::create("1", name("ours")), &intervening).unwrap();
        assert_eq!(resolution.change, Change::set("1", name("ours")));
        assert_eq!(resolution.overridden.len(), 1);
    }

    #[test]
    fn test_stale_create_over_edited_record_stays_create() {
        // r1 existed at base 5 and was only edited since
        let engine = TransformEngine::new();
        let intervening = vec![op(6, Change::set_field("1", "status", FieldValue::text("x")))];
        let proposed = Change::create("1", name("ours"));
        let resolution = engine.resolve(5, proposed.clone(), &intervening).unwrap();
        assert_eq!(resolution.change, proposed);
        assert!(resolution.overridden.is_empty());
    }

    #[test]
    fn test_other_records_ignored() {
        let engine = TransformEngine::new();
        let intervening = vec![op(6, Change::delete("2")), op(7, Change::create("3", name("c")))];
        let proposed = Change::set_field("1", "name", FieldValue::text("Y"));
        let resolution = engine.resolve(5, proposed.clone(), &intervening).unwrap();
        assert_eq!(resolution.change, proposed);
    }

    #[test]
    fn test_ops_at_or_below_base_ignored() {
        let engine = TransformEngine::new();
        let intervening = vec![op(5, Change::delete("1"))];
        let proposed = Change::set_field("1", "name", FieldValue::text("Y"));
        assert!(engine.resolve(5, proposed, &intervening).is_ok());
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let engine = TransformEngine::new();
        let intervening = vec![
            op(7, Change::set_field("1", "name", FieldValue::text("B"))),
            op(6, Change::set_field("1", "name", FieldValue::text("A"))),
        ];
        let proposed = Change::set_field("1", "name", FieldValue::text("Y"));
        let a = engine.resolve(5, proposed.clone(), &intervening).unwrap();
        let mut reversed = intervening.clone();
        reversed.reverse();
        let b = engine.resolve(5, proposed, &reversed).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_delete_sequence_order_matters() {
        // Mutation then delete: the delete (later) decides.
        let engine = TransformEngine::new();
        let intervening = vec![
            op(7, Change::delete("1")),
            op(6, Change::set_field("1", "name", FieldValue::text("A"))),
        ];
        let err = engine
            .resolve(5, Change::set_field("1", "name", FieldValue::text("Y")), &intervening)
            .unwrap_err();
        assert_eq!(err.deleted_at, 7);
    }
}
