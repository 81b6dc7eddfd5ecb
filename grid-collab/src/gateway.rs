//! Mutation gateway: the only path by which changes enter a document log.
//!
//! `submit` runs entirely inside the document's writer section:
//! duplicate check, schema validation, rebase over intervening operations,
//! record checks against the projection, then append at `head + 1`.

use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::change_log::{ChangeLog, ChangeLogError, DocumentLog};
use crate::model::{now_millis, Change, DocumentId, Operation, RecordId, SessionId};
use crate::projection::Projection;
use crate::schema::{SchemaViolation, TableSchema};
use crate::transform::{TransformEngine, Unresolvable};

/// A proposed change and the state it was built against.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub doc_id: DocumentId,
    /// Head of the document as the client last saw it
    pub base_sequence: u64,
    pub session_id: SessionId,
    /// Per-session counter; 0 disables duplicate detection
    pub client_sequence: u64,
    pub change: Change,
}

impl SubmitRequest {
    /// Anonymous submit without duplicate detection.
    pub fn new(doc_id: DocumentId, base_sequence: u64, change: Change) -> Self {
        Self {
            doc_id,
            base_sequence,
            session_id: Uuid::nil(),
            client_sequence: 0,
            change,
        }
    }

    pub fn from_session(mut self, session_id: SessionId, client_sequence: u64) -> Self {
        self.session_id = session_id;
        self.client_sequence = client_sequence;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmitError {
    #[error("schema violation: {0}")]
    SchemaViolation(#[from] SchemaViolation),
    #[error("unresolvable conflict: {0}")]
    Unresolvable(#[from] Unresolvable),
    #[error("base sequence {base} is ahead of head {head}")]
    InvalidBase { base: u64, head: u64 },
    #[error("record '{0}' does not exist")]
    UnknownRecord(RecordId),
    #[error("record '{0}' already exists")]
    RecordExists(RecordId),
    #[error(transparent)]
    Log(#[from] ChangeLogError),
}

impl SubmitError {
    /// Storage or log integrity failure, as opposed to a rejected change.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SubmitError::Log(e) if e.is_fatal())
    }

    /// Stable machine-readable code for clients.
    pub fn code(&self) -> &'static str {
        match self {
            SubmitError::SchemaViolation(_) => "schema_violation",
            SubmitError::Unresolvable(_) => "unresolvable",
            SubmitError::InvalidBase { .. } => "invalid_base",
            SubmitError::UnknownRecord(_) => "unknown_record",
            SubmitError::RecordExists(_) => "record_exists",
            SubmitError::Log(ChangeLogError::UnknownDocument(_)) => "unknown_document",
            SubmitError::Log(ChangeLogError::DocumentExists(_)) => "document_exists",
            SubmitError::Log(ChangeLogError::AheadOfHead { .. }) => "ahead_of_head",
            SubmitError::Log(_) => "internal",
        }
    }
}

pub struct MutationGateway {
    log: Arc<ChangeLog>,
    engine: TransformEngine,
}

impl MutationGateway {
    pub fn new(log: Arc<ChangeLog>) -> Self {
        Self {
            log,
            engine: TransformEngine::new(),
        }
    }

    pub fn change_log(&self) -> &Arc<ChangeLog> {
        &self.log
    }

    pub fn create_document(
        &self,
        doc_id: DocumentId,
        schema: TableSchema,
    ) -> Result<Arc<DocumentLog>, SubmitError> {
        schema.check()?;
        Ok(self.log.create_document(doc_id, schema)?)
    }

    pub fn schema(&self, doc_id: DocumentId) -> Result<TableSchema, SubmitError> {
        Ok(self.log.document(doc_id)?.schema().clone())
    }

    pub async fn records(&self, doc_id: DocumentId) -> Result<Projection, SubmitError> {
        Ok(self.log.snapshot(doc_id).await?)
    }

    /// Validate, reconcile and commit a change.
    ///
    /// Resubmitting an already committed `(session, client_sequence)` returns
    /// the original operation without appending.
    pub async fn submit(&self, req: SubmitRequest) -> Result<Arc<Operation>, SubmitError> {
        let log = self.log.document(req.doc_id)?;
        let mut writer = log.writer().await;

        if let Some(op) = writer.committed_submit(req.session_id, req.client_sequence)? {
            log::debug!(
                "Duplicate submit {}/{} on {} resolved to #{}",
                req.session_id,
                req.client_sequence,
                req.doc_id,
                op.sequence
            );
            return Ok(Arc::new(op));
        }

        writer.schema().validate(&req.change)?;

        let head = writer.head();
        if req.base_sequence > head {
            return Err(SubmitError::InvalidBase {
                base: req.base_sequence,
                head,
            });
        }

        let change = if req.base_sequence < head {
            let intervening = writer.intervening(req.base_sequence)?;
            let resolution = self
                .engine
                .resolve(req.base_sequence, req.change, &intervening)
                .inspect_err(|e| {
                    log::info!("Rejected stale submit on {}: {}", req.doc_id, e);
                })?;
            if !resolution.overridden.is_empty() {
                log::debug!(
                    "Submit on {} at base {} overrides {:?}",
                    req.doc_id,
                    req.base_sequence,
                    resolution.overridden
                );
            }
            resolution.change
        } else {
            req.change
        };

        check_records(writer.projection(), &change)?;

        let op = Operation {
            doc_id: req.doc_id,
            sequence: head + 1,
            session_id: req.session_id,
            client_sequence: req.client_sequence,
            change,
            timestamp_ms: now_millis(),
        };
        let committed = writer.append(op).inspect_err(|e| {
            if e.is_fatal() {
                log::error!("Append to {} failed: {}", req.doc_id, e);
            }
        })?;
        Ok(committed)
    }
}

/// Structural checks against the current record set.
fn check_records(projection: &Projection, change: &Change) -> Result<(), SubmitError> {
    let id = change.record_id();
    let live = projection.record(id).is_some();
    let deleted = projection.deleted_at(id).is_some();

    match change {
        // A tombstoned id stays taken
        Change::CreateRecord { .. } if live || deleted => {
            Err(SubmitError::RecordExists(id.to_string()))
        }
        Change::SetFields { .. } if !live => Err(SubmitError::UnknownRecord(id.to_string())),
        Change::DeleteRecord { .. } if !live && !deleted => {
            Err(SubmitError::UnknownRecord(id.to_string()))
        }
        _ => Ok(()),
    }
}
