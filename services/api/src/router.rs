//! Axum Router Configuration
//!
//! HTTP routing for the service: the three patient WebSocket channels, the
//! REST endpoints, and the OpenAPI documentation.

use crate::{
    handlers,
    models::{
        ErrorResponse, HealthResponse, NotifyPayload, NotifyResponse, ResetResponse, SessionInfo,
        SessionsResponse,
    },
    state::AppState,
    ws::{chat_ws_handler, intake_ws_handler, voice_ws_handler},
};

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::list_sessions,
        handlers::notify_patient,
        handlers::reset_chat,
        handlers::health,
    ),
    components(
        schemas(SessionInfo, SessionsResponse, NotifyPayload, NotifyResponse, ResetResponse, HealthResponse, ErrorResponse)
    ),
    tags(
        (name = "MedForce API", description = "Real-time patient agent channels and session introspection")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_router = Router::new()
        .route("/ws/pre-consult/{patient_id}", get(intake_ws_handler))
        .route("/ws/chat/{patient_id}", get(chat_ws_handler))
        .route("/ws/voice/{patient_id}", get(voice_ws_handler))
        .route("/ws/sessions", get(handlers::list_sessions))
        .route(
            "/patients/{patient_id}/notify",
            post(handlers::notify_patient),
        )
        .route("/chat/{patient_id}/reset", post(handlers::reset_chat))
        .route("/health", get(handlers::health))
        .with_state(app_state);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}
