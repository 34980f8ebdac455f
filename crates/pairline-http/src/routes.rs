//! HTTP route handlers.
//!
//! Both pairing routes end in the same place: one `initiate` call whose
//! result is mapped to a status code and a JSON body.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use pairline_core::pairing::{PairingError, PairingResult, SessionAttempt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::SharedState;

/// Query string of `GET /pair`.
#[derive(Debug, Deserialize)]
pub struct PairQuery {
    #[serde(default)]
    pub number: Option<String>,
}

/// Body of `POST /api/pair`.
#[derive(Debug, Deserialize)]
pub struct PairRequest {
    #[serde(rename = "phoneNumber", default)]
    pub phone_number: Option<String>,
}

/// Error body: `{"status":"error","error":"..."}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            status: "error",
            error: error.into(),
        }
    }
}

/// Body of both pairing routes.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum PairResponse {
    Result(PairingResult),
    Error(ErrorResponse),
}

/// HTTP status for a pairing failure.
pub fn error_status(error: &PairingError) -> StatusCode {
    match error {
        PairingError::Validation(_) => StatusCode::BAD_REQUEST,
        PairingError::Authentication(_) => StatusCode::UNAUTHORIZED,
        PairingError::Timeout => StatusCode::REQUEST_TIMEOUT,
        PairingError::Superseded => StatusCode::CONFLICT,
        PairingError::ReconnectsExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        PairingError::Initialization(_)
        | PairingError::PairingCode { .. }
        | PairingError::Transfer(_)
        | PairingError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Handler for GET /pair?number=<phone>
pub async fn pair_query_handler(
    State(state): State<Arc<SharedState>>,
    Query(query): Query<PairQuery>,
) -> (StatusCode, Json<PairResponse>) {
    pair(&state, query.number.as_deref().unwrap_or_default()).await
}

/// Handler for POST /api/pair
pub async fn pair_json_handler(
    State(state): State<Arc<SharedState>>,
    Json(request): Json<PairRequest>,
) -> (StatusCode, Json<PairResponse>) {
    pair(&state, request.phone_number.as_deref().unwrap_or_default()).await
}

async fn pair(state: &SharedState, phone_number: &str) -> (StatusCode, Json<PairResponse>) {
    log::debug!("HTTP pair request for {:?}", phone_number);

    match state.orchestrator.initiate(phone_number).await {
        Ok(result) => (StatusCode::OK, Json(PairResponse::Result(result))),
        Err(e) => {
            let status = error_status(&e);
            if status.is_server_error() {
                log::error!("Pairing request failed: {}", e);
            } else {
                log::info!("Pairing request rejected ({}): {}", status, e);
            }
            (
                status,
                Json(PairResponse::Error(ErrorResponse::new(e.to_string()))),
            )
        }
    }
}

/// Handler for GET /api/sessions
pub async fn sessions_handler(State(state): State<Arc<SharedState>>) -> Json<Vec<SessionAttempt>> {
    Json(state.orchestrator.attempts())
}

/// Handler for GET /health
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

// ============================================================================
// TESTS
// ============================================================================
