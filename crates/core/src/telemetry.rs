//! Side-channel telemetry for upstream calls.
//!
//! Collaborators report request/response payloads through an injected
//! [`TelemetrySink`] rather than persisting ad hoc debug files.

use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// One observed exchange with an external collaborator.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    /// Which collaborator produced the event, e.g. `board.focus` or `tool`.
    pub source: &'static str,
    pub patient_id: Option<String>,
    pub request: Value,
    pub response: Option<Value>,
    pub error: Option<String>,
}

impl TelemetryEvent {
    pub fn new(source: &'static str, request: Value) -> Self {
        Self {
            source,
            patient_id: None,
            request,
            response: None,
            error: None,
        }
    }

    pub fn patient(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id.into());
        self
    }

    pub fn response(mut self, response: Value) -> Self {
        self.response = Some(response);
        self
    }

    pub fn error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

/// Emits every event as a `debug` tracing record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: TelemetryEvent) {
        debug!(
            source = event.source,
            patient_id = event.patient_id.as_deref().unwrap_or("-"),
            request = %event.request,
            response = %event.response.as_ref().map(serde_json::Value::to_string).unwrap_or_default(),
            error = event.error.as_deref().unwrap_or(""),
            "telemetry"
        );
    }
}

pub fn tracing_sink() -> Arc<dyn TelemetrySink> {
    Arc::new(TracingTelemetry)
}
