//! Axum Handlers for the REST API
//!
//! Session introspection, care-team notifications, conversation resets and
//! liveness. `utoipa` annotations feed the OpenAPI document.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::{error, info};

use crate::{
    models::{
        ErrorResponse, HealthResponse, NotifyPayload, NotifyResponse, ResetResponse,
        SessionsResponse,
    },
    state::AppState,
};

pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse { message })).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// List every live WebSocket session.
#[utoipa::path(
    get,
    path = "/ws/sessions",
    responses(
        (status = 200, description = "Live sessions", body = SessionsResponse)
    )
)]
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionsResponse> {
    let sessions = state.orchestrator.connections().sessions_info();
    Json(SessionsResponse {
        active_sessions: sessions.len(),
        sessions,
    })
}

/// Push a care-team notification to all of a patient's open sessions.
#[utoipa::path(
    post,
    path = "/patients/{patient_id}/notify",
    request_body = NotifyPayload,
    responses(
        (status = 200, description = "Delivery report", body = NotifyResponse),
        (status = 400, description = "Empty message", body = ErrorResponse),
        (status = 404, description = "Patient has no open sessions", body = ErrorResponse)
    ),
    params(
        ("patient_id" = String, Path, description = "Patient identifier")
    )
)]
pub async fn notify_patient(
    State(state): State<Arc<AppState>>,
    Path(patient_id): Path<String>,
    Json(payload): Json<NotifyPayload>,
) -> Result<Json<NotifyResponse>, ApiError> {
    if payload.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message must not be empty".to_string()));
    }
    if state
        .orchestrator
        .connections()
        .get_patient_sessions(&patient_id)
        .is_empty()
    {
        return Err(ApiError::NotFound(format!(
            "No open sessions for patient {}",
            patient_id
        )));
    }
    let report = state
        .orchestrator
        .notify_patient(&patient_id, &payload.message)
        .await;
    Ok(Json(NotifyResponse {
        delivered: report.delivered,
        failed: report.failed,
    }))
}

/// Reset a patient's intake conversation and cached chat history.
#[utoipa::path(
    post,
    path = "/chat/{patient_id}/reset",
    responses(
        (status = 200, description = "Conversation reset", body = ResetResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    params(
        ("patient_id" = String, Path, description = "Patient identifier")
    )
)]
pub async fn reset_chat(
    State(state): State<Arc<AppState>>,
    Path(patient_id): Path<String>,
) -> Result<Json<ResetResponse>, ApiError> {
    state.orchestrator.reset_patient(&patient_id).await?;
    info!(%patient_id, "Reset via REST");
    Ok(Json(ResetResponse {
        patient_id,
        message: "Conversation reset".to_string(),
    }))
}

/// Liveness probe.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_sessions: state.orchestrator.connections().len(),
        voice_available: state.orchestrator.voice_available(),
    })
}
