//! Tool registry and dispatch.
//!
//! The [`ToolDispatcher`] maps a declared tool name to a [`ToolHandler`] and
//! runs it against model-supplied arguments. Dispatch never fails: unknown
//! tools, handler errors and handler panics all come back as a structured
//! error payload, so every tool call the model makes gets exactly one
//! correlated response.

use crate::{
    llm_client::ToolCall,
    telemetry::{TelemetryEvent, TelemetrySink, TracingTelemetry},
};
use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use schemars::{JsonSchema, generate::SchemaSettings};
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::{any::Any, collections::BTreeMap, panic::AssertUnwindSafe, sync::Arc};
use tracing::{error, info, warn};

/// The schema of one tool as exposed to the language model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    /// JSON schema of the argument object.
    pub parameters: Value,
}

impl ToolDeclaration {
    /// Builds a declaration whose parameter schema is derived from `A`.
    pub fn for_args<A: JsonSchema>(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            parameters: parameters_schema::<A>(),
        }
    }
}

/// Generates a model-friendly JSON schema for an argument struct.
///
/// Optional fields are emitted as plain types (no `null` unions) and the
/// root `$schema`/`title` keys are dropped.
pub fn parameters_schema<A: JsonSchema>() -> Value {
    let schema = SchemaSettings::draft07()
        .with(|settings| settings.option_add_null_type = false)
        .into_generator()
        .into_root_schema_for::<A>();
    let mut value = serde_json::to_value(&schema).unwrap_or_else(|_| json!({"type": "object"}));
    if let Value::Object(map) = &mut value {
        map.remove("$schema");
        map.remove("title");
        map.entry("type").or_insert_with(|| json!("object"));
    }
    value
}

/// Caller-supplied context for a tool invocation.
///
/// The patient is bound by the session, never by model arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub patient_id: String,
    pub session_id: Option<String>,
}

impl ToolContext {
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl ToString) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn declaration(&self) -> ToolDeclaration;

    async fn call(&self, ctx: &ToolContext, arguments: Value) -> Result<Value>;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ToolError {
    #[error("Tool '{0}' is already registered")]
    Duplicate(String),
}

/// The uniform result shape handed back to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub payload: Map<String, Value>,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(value: Value) -> Self {
        Self {
            payload: normalize(value),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("error".to_string(), Value::String(message.into()));
        Self {
            payload,
            is_error: true,
        }
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.payload.clone())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.payload.get("error").and_then(Value::as_str)
    }
}

/// A result correlated with the tool call that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    pub call_id: String,
    pub name: String,
    pub result: ToolResult,
}

/// Wraps any non-object value as `{"result": value}`.
pub fn normalize(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("result".to_string(), other);
            map
        }
    }
}

pub struct ToolDispatcher {
    handlers: BTreeMap<String, Arc<dyn ToolHandler>>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl Default for ToolDispatcher {
    fn default() -> Self {
        Self::empty()
    }
}

impl ToolDispatcher {
    /// A dispatcher exposing no tools, as used by the intake flow.
    pub fn empty() -> Self {
        Self::new(Arc::new(TracingTelemetry))
    }

    pub fn new(telemetry: Arc<dyn TelemetrySink>) -> Self {
        Self {
            handlers: BTreeMap::new(),
            telemetry,
        }
    }

    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) -> Result<(), ToolError> {
        let name = handler.declaration().name;
        if self.handlers.contains_key(&name) {
            return Err(ToolError::Duplicate(name));
        }
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered tool names in sorted order.
    pub fn tool_names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.handlers.values().map(|h| h.declaration()).collect()
    }

    /// Runs the named tool. Never returns an error; failures are encoded in
    /// the returned [`ToolResult`].
    pub async fn execute(&self, ctx: &ToolContext, tool_name: &str, arguments: Value) -> ToolResult {
        let Some(handler) = self.handlers.get(tool_name) else {
            warn!(tool = %tool_name, "Model requested an unknown tool");
            let mut result = ToolResult::error(format!("Tool '{}' not found", tool_name));
            result.payload.insert(
                "available_tools".to_string(),
                Value::from(self.tool_names()),
            );
            return result;
        };

        info!(tool = %tool_name, patient_id = %ctx.patient_id, "Executing tool");
        let request = arguments.clone();
        let outcome = AssertUnwindSafe(handler.call(ctx, arguments))
            .catch_unwind()
            .await;

        let result = match outcome {
            Ok(Ok(value)) => ToolResult::success(value),
            Ok(Err(e)) => {
                warn!(tool = %tool_name, error = ?e, "Tool execution failed");
                ToolResult::error(format!("{:#}", e))
            }
            Err(panic) => {
                error!(tool = %tool_name, "Tool handler panicked");
                ToolResult::error(format!(
                    "Tool '{}' crashed: {}",
                    tool_name,
                    panic_message(panic.as_ref())
                ))
            }
        };

        let mut event = TelemetryEvent::new("tool", json!({"tool": tool_name, "arguments": request}))
            .patient(ctx.patient_id.clone());
        event = if result.is_error {
            event.error(result.error_message().unwrap_or_default())
        } else {
            event.response(result.to_value())
        };
        self.telemetry.record(event);

        result
    }

    /// Executes a model tool call and correlates the result with its id.
    pub async fn respond(&self, ctx: &ToolContext, call: &ToolCall) -> ToolResponse {
        ToolResponse {
            call_id: call.id.clone(),
            name: call.name.clone(),
            result: self.execute(ctx, &call.name, call.arguments.clone()).await,
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
