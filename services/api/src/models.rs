//! REST API Models
//!
//! Request and response bodies of the HTTP endpoints, annotated for OpenAPI
//! generation with `utoipa`.

use crate::ws::{protocol::AgentMode, session::SessionState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Monitoring snapshot of one live session.
#[derive(Serialize, Deserialize, ToSchema, Debug, Clone, PartialEq)]
pub struct SessionInfo {
    #[schema(value_type = String, format = Uuid)]
    pub session_id: Uuid,
    pub patient_id: String,
    #[schema(value_type = String, example = "chat")]
    pub mode: AgentMode,
    #[schema(value_type = String, example = "idle")]
    pub state: SessionState,
    pub connected_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub message_count: u64,
    pub duration_seconds: f64,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, Clone)]
pub struct SessionsResponse {
    pub active_sessions: usize,
    pub sessions: Vec<SessionInfo>,
}

#[derive(Deserialize, ToSchema)]
pub struct NotifyPayload {
    #[schema(example = "Your lab results are ready.")]
    pub message: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug, PartialEq)]
pub struct NotifyResponse {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct ResetResponse {
    pub patient_id: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, ToSchema, Debug)]
pub struct HealthResponse {
    pub status: String,
    pub active_sessions: usize,
    pub voice_available: bool,
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_session_info_serialization() {
        let at = Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap();
        let info = SessionInfo {
            session_id: Uuid::nil(),
            patient_id: "P0001".into(),
            mode: AgentMode::Chat,
            state: SessionState::Idle,
            connected_at: at,
            last_activity: at,
            message_count: 3,
            duration_seconds: 1.5,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["mode"], "chat");
        assert_eq!(json["state"], "idle");
        assert_eq!(json["connected_at"], "2025-01-02T03:04:05Z");
        assert_eq!(json["message_count"], 3);
    }

    #[test]
    fn test_error_response_serialization() {
        let json = serde_json::to_string(&ErrorResponse {
            message: "boom".into(),
        })
        .unwrap();
        assert_eq!(json, r#"{"message":"boom"}"#);
    }
}
