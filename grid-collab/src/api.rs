//! HTTP mutation and read endpoints.
//!
//! | Method | Path                          | Result                         |
//! |--------|-------------------------------|--------------------------------|
//! | POST   | `/documents`                  | 201 document                   |
//! | GET    | `/documents/:id`              | document head and schema       |
//! | POST   | `/documents/:id/operations`   | 201 committed operation        |
//! | GET    | `/documents/:id/operations`   | operations after `?since=n`    |
//! | GET    | `/documents/:id/records`      | records, optionally `?at=n`    |
//! | GET    | `/health`                     | liveness                       |
//!
//! Rejections use a JSON body `{ "error": code, "message": text }` with 404
//! for unknown documents, 409 for unresolvable conflicts and 422 for changes
//! that do not fit the schema or the current records.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::change_log::ChangeLogError;
use crate::gateway::{MutationGateway, SubmitError, SubmitRequest};
use crate::model::{Change, DocumentId, FieldMap, FieldValue, Operation};
use crate::projection::{Projection, Record};
use crate::schema::TableSchema;

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<MutationGateway>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/documents", axum::routing::post(create_document))
        .route("/documents/:id", get(get_document))
        .route(
            "/documents/:id/operations",
            get(list_operations).post(submit_operation),
        )
        .route("/documents/:id/records", get(get_records))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Submit(#[from] SubmitError),
    #[error("invalid field value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

impl From<ChangeLogError> for ApiError {
    fn from(e: ChangeLogError) -> Self {
        ApiError::Submit(SubmitError::Log(e))
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::InvalidValue { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_value"),
            ApiError::Submit(e) => {
                let status = match e {
                    SubmitError::Unresolvable(_) => StatusCode::CONFLICT,
                    SubmitError::SchemaViolation(_)
                    | SubmitError::InvalidBase { .. }
                    | SubmitError::UnknownRecord(_)
                    | SubmitError::RecordExists(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    SubmitError::Log(ChangeLogError::UnknownDocument(_)) => StatusCode::NOT_FOUND,
                    SubmitError::Log(ChangeLogError::DocumentExists(_)) => StatusCode::CONFLICT,
                    SubmitError::Log(ChangeLogError::AheadOfHead { .. }) => {
                        StatusCode::UNPROCESSABLE_ENTITY
                    }
                    SubmitError::Log(other) => {
                        log::error!("Change log error: {}", other);
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.code())
            }
        };

        let body = ErrorResponse {
            error: code.to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Wire form of a change: `{ "type": "setFields", "recordId": .., "fields": {..} }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ChangeDto {
    CreateRecord {
        record_id: String,
        fields: Map<String, Value>,
    },
    SetFields {
        record_id: String,
        fields: Map<String, Value>,
    },
    DeleteRecord {
        record_id: String,
    },
}

impl ChangeDto {
    pub fn into_change(self) -> Result<Change, ApiError> {
        Ok(match self {
            ChangeDto::CreateRecord { record_id, fields } => Change::CreateRecord {
                record_id,
                fields: fields_from_json(fields)?,
            },
            ChangeDto::SetFields { record_id, fields } => Change::SetFields {
                record_id,
                fields: fields_from_json(fields)?,
            },
            ChangeDto::DeleteRecord { record_id } => Change::DeleteRecord { record_id },
        })
    }
}

impl From<&Change> for ChangeDto {
    fn from(change: &Change) -> Self {
        match change {
            Change::CreateRecord { record_id, fields } => ChangeDto::CreateRecord {
                record_id: record_id.clone(),
                fields: fields_to_json(fields),
            },
            Change::SetFields { record_id, fields } => ChangeDto::SetFields {
                record_id: record_id.clone(),
                fields: fields_to_json(fields),
            },
            Change::DeleteRecord { record_id } => ChangeDto::DeleteRecord {
                record_id: record_id.clone(),
            },
        }
    }
}

fn fields_from_json(fields: Map<String, Value>) -> Result<FieldMap, ApiError> {
    fields
        .into_iter()
        .map(|(name, value)| match FieldValue::from_json(&value) {
            Ok(v) => Ok((name, v)),
            Err(reason) => Err(ApiError::InvalidValue { field: name, reason }),
        })
        .collect()
}

fn fields_to_json(fields: &FieldMap) -> Map<String, Value> {
    fields
        .iter()
        .map(|(name, value)| (name.clone(), value.to_json()))
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentRequest {
    pub id: Option<Uuid>,
    #[serde(default)]
    pub schema: TableSchema,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResponse {
    pub id: DocumentId,
    pub head: u64,
    pub schema: TableSchema,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitOperationRequest {
    pub base_sequence: u64,
    pub session_id: Option<Uuid>,
    pub client_sequence: Option<u64>,
    pub change: ChangeDto,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDto {
    pub doc_id: DocumentId,
    pub sequence: u64,
    pub session_id: Uuid,
    pub client_sequence: u64,
    pub change: ChangeDto,
    pub timestamp_ms: u64,
}

impl From<&Operation> for OperationDto {
    fn from(op: &Operation) -> Self {
        Self {
            doc_id: op.doc_id,
            sequence: op.sequence,
            session_id: op.session_id,
            client_sequence: op.client_sequence,
            change: ChangeDto::from(&op.change),
            timestamp_ms: op.timestamp_ms,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDto {
    pub id: String,
    pub fields: Map<String, Value>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl From<&Record> for RecordDto {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            fields: fields_to_json(&record.fields),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordsResponse {
    pub doc_id: DocumentId,
    pub sequence: u64,
    pub records: Vec<RecordDto>,
}

impl From<&Projection> for RecordsResponse {
    fn from(projection: &Projection) -> Self {
        Self {
            doc_id: projection.doc_id(),
            sequence: projection.sequence(),
            records: projection.records().map(RecordDto::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SinceQuery {
    pub since: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct AtQuery {
    pub at: Option<u64>,
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "documents": state.gateway.change_log().documents().len(),
    }))
}

async fn create_document(
    State(state): State<AppState>,
    Json(req): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<DocumentResponse>), ApiError> {
    let doc_id = req.id.unwrap_or_else(Uuid::new_v4);
    let log = state.gateway.create_document(doc_id, req.schema)?;
    Ok((
        StatusCode::CREATED,
        Json(DocumentResponse {
            id: doc_id,
            head: log.head(),
            schema: log.schema().clone(),
        }),
    ))
}

async fn get_document(
    State(state): State<AppState>,
    Path(doc_id): Path<Uuid>,
) -> Result<Json<DocumentResponse>, ApiError> {
    let log = state.gateway.change_log().document(doc_id)?;
    Ok(Json(DocumentResponse {
        id: doc_id,
        head: log.head(),
        schema: log.schema().clone(),
    }))
}

async fn submit_operation(
    State(state): State<AppState>,
    Path(doc_id): Path<Uuid>,
    Json(req): Json<SubmitOperationRequest>,
) -> Result<(StatusCode, Json<OperationDto>), ApiError> {
    let change = req.change.into_change()?;
    let mut submit = SubmitRequest::new(doc_id, req.base_sequence, change);
    if let Some(session_id) = req.session_id {
        submit = submit.from_session(session_id, req.client_sequence.unwrap_or(0));
    }

    let op = state.gateway.submit(submit).await?;
    log::debug!("HTTP submit committed {}#{}", op.doc_id, op.sequence);
    Ok((StatusCode::CREATED, Json(OperationDto::from(op.as_ref()))))
}

async fn list_operations(
    State(state): State<AppState>,
    Path(doc_id): Path<Uuid>,
    Query(query): Query<SinceQuery>,
) -> Result<Json<Vec<OperationDto>>, ApiError> {
    let cursor = state
        .gateway
        .change_log()
        .read_since(doc_id, query.since.unwrap_or(0))?;
    let ops = cursor
        .map(|r| r.map(|op| OperationDto::from(&op)))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Json(ops))
}

async fn get_records(
    State(state): State<AppState>,
    Path(doc_id): Path<Uuid>,
    Query(query): Query<AtQuery>,
) -> Result<Json<RecordsResponse>, ApiError> {
    let projection = match query.at {
        Some(at) => state.gateway.change_log().snapshot_at(doc_id, at)?,
        None => state.gateway.records(doc_id).await?,
    };
    Ok(Json(RecordsResponse::from(&projection)))
}
