//! The clinical tool set exposed to chat and voice agents.
//!
//! Every handler resolves the patient from the calling session's
//! [`ToolContext`]. Missing records are reported to the model as a
//! `not_found` payload instead of an error.

use crate::{
    board::{BoardClient, TodoList, TodoTask},
    records::PatientRecords,
    telemetry::TelemetrySink,
    tools::{ToolContext, ToolDeclaration, ToolDispatcher, ToolError, ToolHandler},
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::sync::Arc;

const SNIPPET_CONTEXT_CHARS: usize = 200;

#[derive(Debug, Deserialize, JsonSchema)]
pub struct LabsArgs {
    /// Optional: specific biomarker to retrieve (e.g. 'ALT', 'Bilirubin'). If not specified, returns all.
    #[serde(default)]
    pub biomarker: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MedicationsArgs {
    /// If true, only return medications without an end date or ending in the future.
    #[serde(default)]
    pub active_only: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct EncountersArgs {
    /// Maximum number of encounters to return (default 10).
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SearchArgs {
    /// Text to search for in the patient's profile and clinical context.
    pub query: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FocusArgs {
    /// Identifier of the board item to focus, e.g. 'dashboard-item-lab-table'.
    pub object_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateTaskArgs {
    /// Title of the TODO list.
    pub title: String,
    /// What the TODO list is for.
    #[serde(default)]
    pub description: Option<String>,
    /// The individual tasks.
    pub tasks: Vec<TodoTask>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GuidelineArgs {
    /// The clinical question to send to the guideline service.
    pub question: String,
}

fn parse_args<A: DeserializeOwned>(arguments: Value) -> Result<A> {
    Ok(serde_json::from_value(arguments)?)
}

fn not_found(what: &str, patient_id: &str) -> Value {
    json!({
        "status": "not_found",
        "message": format!("No {} found for patient {}.", what, patient_id),
    })
}

/// Merges `extra` into a `{"status": "success"}` object.
fn success(extra: Value) -> Value {
    let mut out = json!({ "status": "success" });
    if let (Value::Object(out), Value::Object(extra)) = (&mut out, extra) {
        out.extend(extra);
    }
    out
}

pub struct PatientLabsTool {
    records: PatientRecords,
}

#[async_trait]
impl ToolHandler for PatientLabsTool {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::for_args::<LabsArgs>(
            "get_patient_labs",
            "Retrieve laboratory test results for the patient. Returns chronological lab values including dates, biomarker names, values, and reference ranges.",
        )
    }

    async fn call(&self, ctx: &ToolContext, arguments: Value) -> Result<Value> {
        let args: LabsArgs = parse_args(arguments)?;
        let Some(labs) = self
            .records
            .read_json(&ctx.patient_id, "board_items/dashboard_lab_track.json")
            .await?
        else {
            return Ok(not_found("laboratory results", &ctx.patient_id));
        };

        match args.biomarker {
            Some(biomarker) => {
                let needle = biomarker.to_lowercase();
                let filtered: Vec<Value> = labs
                    .get("biomarkers")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter(|item| {
                                item.get("name")
                                    .and_then(Value::as_str)
                                    .is_some_and(|name| name.to_lowercase().contains(&needle))
                            })
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(json!({
                    "status": "success",
                    "count": filtered.len(),
                    "biomarkers": filtered,
                }))
            }
            None => Ok(success(labs)),
        }
    }
}

pub struct PatientMedicationsTool {
    records: PatientRecords,
}

/// A medication is active when it has no end date or ends after `now`.
fn is_active(medication: &Value, now: &str) -> bool {
    match medication.get("endDate") {
        None | Some(Value::Null) => true,
        Some(Value::String(end)) => end.is_empty() || end.as_str() > now,
        Some(_) => false,
    }
}

#[async_trait]
impl ToolHandler for PatientMedicationsTool {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::for_args::<MedicationsArgs>(
            "get_patient_medications",
            "Retrieve the patient's medication history, optionally restricted to active medications.",
        )
    }

    async fn call(&self, ctx: &ToolContext, arguments: Value) -> Result<Value> {
        let args: MedicationsArgs = parse_args(arguments)?;
        let Some(medications) = self
            .records
            .read_json(&ctx.patient_id, "board_items/dashboard_medication_track.json")
            .await?
        else {
            return Ok(not_found("medication records", &ctx.patient_id));
        };

        if !args.active_only {
            return Ok(success(medications));
        }
        let now = Utc::now().format("%Y-%m-%dT%H:%M:%S").to_string();
        let active: Vec<Value> = medications
            .get("medications")
            .and_then(Value::as_array)
            .map(|meds| meds.iter().filter(|m| is_active(m, &now)).cloned().collect())
            .unwrap_or_default();
        Ok(json!({
            "status": "success",
            "count": active.len(),
            "medications": active,
        }))
    }
}

pub struct PatientEncountersTool {
    records: PatientRecords,
}

#[async_trait]
impl ToolHandler for PatientEncountersTool {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::for_args::<EncountersArgs>(
            "get_patient_encounters",
            "Retrieve the patient's clinical encounters, most relevant first.",
        )
    }

    async fn call(&self, ctx: &ToolContext, arguments: Value) -> Result<Value> {
        let args: EncountersArgs = parse_args(arguments)?;
        let limit = args.limit.unwrap_or(10);
        let Some(data) = self
            .records
            .read_json(&ctx.patient_id, "board_items/encounters.json")
            .await?
        else {
            return Ok(not_found("encounter records", &ctx.patient_id));
        };

        let encounters: Vec<Value> = match &data {
            Value::Array(items) => items.iter().take(limit).cloned().collect(),
            Value::Object(map) => map
                .get("encounters")
                .and_then(Value::as_array)
                .map(|items| items.iter().take(limit).cloned().collect())
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        Ok(json!({
            "status": "success",
            "count": encounters.len(),
            "encounters": encounters,
        }))
    }
}

pub struct SearchPatientDataTool {
    records: PatientRecords,
}

/// Returns the text around the first case-insensitive match of `query`,
/// with `...` marking truncation on either side.
pub fn extract_snippet(text: &str, query: &str, context_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let lowered: Vec<char> = chars.iter().map(|c| fold(*c)).collect();
    let needle: Vec<char> = query.chars().map(fold).collect();
    if needle.is_empty() {
        return String::new();
    }
    let Some(pos) = lowered
        .windows(needle.len())
        .position(|window| window == needle.as_slice())
    else {
        return String::new();
    };

    let start = pos.saturating_sub(context_chars);
    let end = (pos + needle.len() + context_chars).min(chars.len());
    let mut snippet: String = chars[start..end].iter().collect();
    if start > 0 {
        snippet.insert_str(0, "...");
    }
    if end < chars.len() {
        snippet.push_str("...");
    }
    snippet
}

fn fold(c: char) -> char {
    c.to_lowercase().next().unwrap_or(c)
}

#[async_trait]
impl ToolHandler for SearchPatientDataTool {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::for_args::<SearchArgs>(
            "search_patient_data",
            "Search the patient's profile and clinical context for a term and return matching snippets.",
        )
    }

    async fn call(&self, ctx: &ToolContext, arguments: Value) -> Result<Value> {
        let args: SearchArgs = parse_args(arguments)?;
        let mut results = Vec::new();
        for relative in ["patient_profile.txt", "board_items/patient_context.json"] {
            let Ok(content) = self.records.read_text(&ctx.patient_id, relative).await else {
                continue;
            };
            let snippet = extract_snippet(&content, &args.query, SNIPPET_CONTEXT_CHARS);
            if !snippet.is_empty() {
                let source = relative.rsplit('/').next().unwrap_or(relative);
                results.push(json!({ "source": source, "snippet": snippet }));
            }
        }
        Ok(json!({
            "query": args.query,
            "count": results.len(),
            "results": results,
        }))
    }
}

pub struct FocusBoardItemTool {
    board: Arc<dyn BoardClient>,
}

#[async_trait]
impl ToolHandler for FocusBoardItemTool {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::for_args::<FocusArgs>(
            "focus_board_item",
            "Navigate the clinical board to a specific item so the clinician can see it.",
        )
    }

    async fn call(&self, ctx: &ToolContext, arguments: Value) -> Result<Value> {
        let args: FocusArgs = parse_args(arguments)?;
        let response = self.board.focus_item(&ctx.patient_id, &args.object_id).await?;
        Ok(json!({
            "status": "success",
            "object_id": args.object_id,
            "board": response,
        }))
    }
}

pub struct CreateTaskTool {
    board: Arc<dyn BoardClient>,
}

#[async_trait]
impl ToolHandler for CreateTaskTool {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::for_args::<CreateTaskArgs>(
            "create_task",
            "Create a TODO list with follow-up tasks on the clinical board.",
        )
    }

    async fn call(&self, ctx: &ToolContext, arguments: Value) -> Result<Value> {
        let args: CreateTaskArgs = parse_args(arguments)?;
        let todo = TodoList {
            title: args.title,
            description: args.description.unwrap_or_default(),
            todos: args.tasks,
        };
        let response = self.board.create_todo(&ctx.patient_id, &todo).await?;
        Ok(json!({
            "status": "success",
            "message": format!("Created TODO list '{}' on the board", todo.title),
            "task_count": todo.todos.len(),
            "board": response,
        }))
    }
}

pub struct EscalateGuidelineTool {
    board: Arc<dyn BoardClient>,
}

#[async_trait]
impl ToolHandler for EscalateGuidelineTool {
    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration::for_args::<GuidelineArgs>(
            "escalate_guideline",
            "Send a clinical question to the EASL guideline service for an evidence-based answer.",
        )
    }

    async fn call(&self, ctx: &ToolContext, arguments: Value) -> Result<Value> {
        let args: GuidelineArgs = parse_args(arguments)?;
        let response = self.board.ask_guideline(&ctx.patient_id, &args.question).await?;
        Ok(json!({
            "status": "success",
            "question": args.question,
            "board": response,
        }))
    }
}

/// Builds the dispatcher shared by the chat and voice channels.
pub fn clinical_toolset(
    records: PatientRecords,
    board: Arc<dyn BoardClient>,
    telemetry: Arc<dyn TelemetrySink>,
) -> Result<ToolDispatcher, ToolError> {
    let mut dispatcher = ToolDispatcher::new(telemetry);
    let handlers: Vec<Arc<dyn ToolHandler>> = vec![
        Arc::new(PatientLabsTool {
            records: records.clone(),
        }),
        Arc::new(PatientMedicationsTool {
            records: records.clone(),
        }),
        Arc::new(PatientEncountersTool {
            records: records.clone(),
        }),
        Arc::new(SearchPatientDataTool { records }),
        Arc::new(FocusBoardItemTool {
            board: board.clone(),
        }),
        Arc::new(CreateTaskTool {
            board: board.clone(),
        }),
        Arc::new(EscalateGuidelineTool { board }),
    ];
    for handler in handlers {
        dispatcher.register(handler)?;
    }
    Ok(dispatcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{board::BoardError, records::InMemoryObjectStore, telemetry::tracing_sink};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBoard {
        focused: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl BoardClient for FakeBoard {
        async fn focus_item(&self, patient_id: &str, object_id: &str) -> Result<Value, BoardError> {
            self.focused
                .lock()
                .unwrap()
                .push((patient_id.to_string(), object_id.to_string()));
            Ok(json!({"ok": true}))
        }

        async fn create_todo(&self, _patient_id: &str, todo: &TodoList) -> Result<Value, BoardError> {
            Ok(json!({"id": "todo-1", "title": todo.title}))
        }

        async fn ask_guideline(&self, _patient_id: &str, _question: &str) -> Result<Value, BoardError> {
            Err(BoardError::Status {
                status: 503,
                body: "unavailable".into(),
            })
        }

        async fn board_items(&self, _patient_id: &str) -> Result<Value, BoardError> {
            Ok(json!([]))
        }
    }

    fn toolset(store: InMemoryObjectStore) -> (ToolDispatcher, Arc<FakeBoard>) {
        let board = Arc::new(FakeBoard::default());
        let dispatcher = clinical_toolset(
            PatientRecords::new(Arc::new(store)),
            board.clone(),
            tracing_sink(),
        )
        .unwrap();
        (dispatcher, board)
    }

    #[test]
    fn test_toolset_declares_all_clinical_tools() {
        let (dispatcher, _) = toolset(InMemoryObjectStore::new());
        assert_eq!(
            dispatcher.tool_names(),
            vec![
                "create_task",
                "escalate_guideline",
                "focus_board_item",
                "get_patient_encounters",
                "get_patient_labs",
                "get_patient_medications",
                "search_patient_data",
            ]
        );
        let search = dispatcher
            .declarations()
            .into_iter()
            .find(|d| d.name == "search_patient_data")
            .unwrap();
        assert_eq!(search.parameters["required"], json!(["query"]));
    }

    #[tokio::test]
    async fn test_labs_filter_is_case_insensitive() {
        let store = InMemoryObjectStore::new();
        store.insert(
            "patient_data/P0001/board_items/dashboard_lab_track.json",
            json!({"biomarkers": [{"name": "ALT"}, {"name": "Bilirubin"}, {"name": "alt (repeat)"}]})
                .to_string(),
        );
        let (dispatcher, _) = toolset(store);

        let result = dispatcher
            .execute(&ToolContext::new("P0001"), "get_patient_labs", json!({"biomarker": "Alt"}))
            .await;
        assert!(!result.is_error);
        assert_eq!(result.payload["count"], 2);

        let all = dispatcher
            .execute(&ToolContext::new("P0001"), "get_patient_labs", json!({}))
            .await;
        assert_eq!(all.payload["status"], "success");
        assert_eq!(all.payload["biomarkers"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_missing_records_are_not_found_payloads() {
        let (dispatcher, _) = toolset(InMemoryObjectStore::new());
        for tool in ["get_patient_labs", "get_patient_medications", "get_patient_encounters"] {
            let result = dispatcher
                .execute(&ToolContext::new("P0404"), tool, json!({}))
                .await;
            assert!(!result.is_error, "{tool}");
            assert_eq!(result.payload["status"], "not_found");
        }
    }

    #[tokio::test]
    async fn test_active_medications_and_encounter_limit() {
        let store = InMemoryObjectStore::new();
        store.insert(
            "patient_data/P0001/board_items/dashboard_medication_track.json",
            json!({"medications": [
                {"name": "Amoxicillin", "endDate": "2001-01-01"},
                {"name": "Ursodiol"},
                {"name": "Prednisolone", "endDate": "2999-12-31"},
            ]})
            .to_string(),
        );
        store.insert(
            "patient_data/P0001/board_items/encounters.json",
            json!([{"id": 1}, {"id": 2}, {"id": 3}]).to_string(),
        );
        let (dispatcher, _) = toolset(store);
        let ctx = ToolContext::new("P0001");

        let meds = dispatcher
            .execute(&ctx, "get_patient_medications", json!({"active_only": true}))
            .await;
        assert_eq!(meds.payload["count"], 2);

        let encounters = dispatcher
            .execute(&ctx, "get_patient_encounters", json!({"limit": 2}))
            .await;
        assert_eq!(encounters.payload["count"], 2);
    }

    #[tokio::test]
    async fn test_board_tools_use_session_patient() {
        let (dispatcher, board) = toolset(InMemoryObjectStore::new());
        let ctx = ToolContext::new("P0002");

        let result = dispatcher
            .execute(
                &ctx,
                "focus_board_item",
                json!({"object_id": "dashboard-item-lab-table", "patient_id": "P9999"}),
            )
            .await;
        assert!(!result.is_error);
        assert_eq!(
            board.focused.lock().unwrap().as_slice(),
            &[("P0002".to_string(), "dashboard-item-lab-table".to_string())]
        );

        let failed = dispatcher
            .execute(&ctx, "escalate_guideline", json!({"question": "Steroids in DILI?"}))
            .await;
        assert!(failed.is_error);
    }

    #[tokio::test]
    async fn test_missing_required_argument_is_error_result() {
        let (dispatcher, _) = toolset(InMemoryObjectStore::new());
        let result = dispatcher
            .execute(&ToolContext::new("P0001"), "search_patient_data", json!({}))
            .await;
        assert!(result.is_error);
    }

    #[test]
    fn test_extract_snippet_adds_ellipses() {
        let text = format!("{}jaundice{}", "a".repeat(300), "b".repeat(300));
        let snippet = extract_snippet(&text, "JAUNDICE", 200);
        assert!(snippet.starts_with("..."));
        assert!(snippet.ends_with("..."));
        assert_eq!(snippet.chars().count(), 3 + 200 + 8 + 200 + 3);

        assert_eq!(extract_snippet("Mild jaundice", "jaundice", 200), "Mild jaundice");
        assert_eq!(extract_snippet("nothing here", "ALT", 200), "");
    }
}
