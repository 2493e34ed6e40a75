//! HTTP handlers for the Provider transport.

use crate::transaction::TransactionRecord;
use crate::AppState;
use attest_types::{Attribute, InitiateQuery, InitiateRequest, InitiateResponse, StagedQuery};
use axum::{
    extract::{Extension, Json, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

/// Handler for `GET /init`. Credentials arrive as one JSON-encoded field.
pub async fn initiate_query_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<InitiateQuery>,
) -> Result<Json<InitiateResponse>, ApiError> {
    let missing = query.missing_fields();
    if !missing.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "missing parameters: {}",
            missing.join(", ")
        )));
    }
    let request = query
        .decode()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    initiate(&state, request)
}

/// Handler for `POST /init`.
pub async fn initiate_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(request): Json<InitiateRequest>,
) -> Result<Json<InitiateResponse>, ApiError> {
    initiate(&state, request)
}

/// Starts a transaction once the procedure is known and the credentials
/// match its requirements one-to-one by name.
fn initiate(state: &AppState, request: InitiateRequest) -> Result<Json<InitiateResponse>, ApiError> {
    if request.mid_b64.trim().is_empty() || request.mid_hex.trim().is_empty() {
        return Err(ApiError::BadRequest("missing parameters: mid_b64, mid_hex".to_string()));
    }

    let procedure = state.procedures.get(&request.procedure_id).ok_or_else(|| {
        ApiError::BadRequest(format!("procedure unknown: {}", request.procedure_id))
    })?;

    let desc = &procedure.desc;
    if request.credentials.len() != desc.requirements.len() {
        return Err(ApiError::BadRequest(format!(
            "wrong number of credentials: expected {}, got {}",
            desc.requirements.len(),
            request.credentials.len()
        )));
    }
    let missing = desc.missing_credentials(&request.credentials);
    if !missing.is_empty() {
        return Err(ApiError::BadRequest(format!(
            "missing credentials: {}",
            missing.join(", ")
        )));
    }

    let peer = request.peer();
    let id = state
        .engine
        .execute(procedure.clone(), request.credentials, peer);

    Ok(Json(InitiateResponse {
        message: format!("Transaction started for mid {}.", request.mid_b64),
        transaction_id: Some(id),
    }))
}

/// Handler for `GET /data`: the holder's currently staged attributes.
pub async fn staged_data_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(query): Query<StagedQuery>,
) -> Result<Json<Vec<Attribute>>, ApiError> {
    let holder = query
        .mid_b64
        .filter(|mid| !mid.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("requires mid".to_string()))?;
    Ok(Json(state.engine.get_queued_attributes(&holder)))
}

/// Handler for `GET /transactions/{id}`.
pub async fn transaction_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<TransactionRecord>, ApiError> {
    let id = Uuid::parse_str(&id)
        .map_err(|_| ApiError::BadRequest(format!("invalid transaction id: {id}")))?;
    state
        .engine
        .transaction(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("transaction {id}")))
}
