//! Client for the clinical board content API.

use crate::telemetry::{TelemetryEvent, TelemetrySink};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BoardError {
    #[error("Board request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("Board API returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// One task inside a board TODO list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct TodoTask {
    /// What needs to be done.
    pub text: String,
    /// Who or what should carry the task out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Task status, e.g. `pending`.
    #[serde(default = "default_task_status")]
    pub status: String,
}

fn default_task_status() -> String {
    "pending".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TodoList {
    pub title: String,
    pub description: String,
    pub todos: Vec<TodoTask>,
}

#[async_trait]
pub trait BoardClient: Send + Sync {
    /// Moves the board viewport to the given item.
    async fn focus_item(&self, patient_id: &str, object_id: &str) -> Result<Value, BoardError>;

    async fn create_todo(&self, patient_id: &str, todo: &TodoList) -> Result<Value, BoardError>;

    /// Forwards a clinical question to the guideline service.
    async fn ask_guideline(&self, patient_id: &str, question: &str) -> Result<Value, BoardError>;

    async fn board_items(&self, patient_id: &str) -> Result<Value, BoardError>;
}

pub struct HttpBoardClient {
    http: reqwest::Client,
    base_url: String,
    telemetry: Arc<dyn TelemetrySink>,
}

impl HttpBoardClient {
    pub fn new(base_url: impl Into<String>, telemetry: Arc<dyn TelemetrySink>) -> Result<Self, BoardError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            telemetry,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post(
        &self,
        source: &'static str,
        patient_id: &str,
        path: &str,
        payload: Value,
    ) -> Result<Value, BoardError> {
        let event = TelemetryEvent::new(source, payload.clone()).patient(patient_id);
        let result = async {
            let response = self.http.post(self.url(path)).json(&payload).send().await?;
            read_response(response).await
        }
        .await;
        self.report(event, &result);
        result
    }

    fn report(&self, event: TelemetryEvent, result: &Result<Value, BoardError>) {
        let event = match result {
            Ok(body) => event.response(body.clone()),
            Err(e) => {
                warn!(source = event.source, error = %e, "Board request failed");
                event.error(e)
            }
        };
        self.telemetry.record(event);
    }
}

async fn read_response(response: reqwest::Response) -> Result<Value, BoardError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(BoardError::Status {
            status: status.as_u16(),
            body,
        });
    }
    if body.trim().is_empty() {
        return Ok(json!({}));
    }
    Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
}

#[async_trait]
impl BoardClient for HttpBoardClient {
    async fn focus_item(&self, patient_id: &str, object_id: &str) -> Result<Value, BoardError> {
        info!(%patient_id, %object_id, "Focusing board item");
        let payload = json!({
            "patientId": patient_id,
            "objectId": object_id,
            "focusOptions": { "zoom": 0.5 },
        });
        self.post("board.focus", patient_id, "/api/focus", payload)
            .await
    }

    async fn create_todo(&self, patient_id: &str, todo: &TodoList) -> Result<Value, BoardError> {
        info!(%patient_id, title = %todo.title, "Creating board TODO");
        let payload = json!({
            "patientId": patient_id,
            "title": todo.title,
            "description": todo.description,
            "todos": todo.todos,
        });
        self.post("board.todo", patient_id, "/api/enhanced-todo", payload)
            .await
    }

    async fn ask_guideline(&self, patient_id: &str, question: &str) -> Result<Value, BoardError> {
        let payload = json!({
            "patientId": patient_id,
            "query": question,
            "metadata": { "source": "voice" },
        });
        self.post("board.guideline", patient_id, "/api/send-to-easl", payload)
            .await
    }

    async fn board_items(&self, patient_id: &str) -> Result<Value, BoardError> {
        let path = format!("/api/board-items/{}", patient_id);
        let event = TelemetryEvent::new("board.items", json!({ "path": path })).patient(patient_id);
        let result = async {
            let response = self.http.get(self.url(&path)).send().await?;
            read_response(response).await
        }
        .await;
        self.report(event, &result);
        result
    }
}
