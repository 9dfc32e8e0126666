//! Administrative intake: the front-desk conversation that collects forms
//! and offers appointment slots before a consultation.

use crate::{
    llm_client::{ChatMessage, LLMAction, LLMClient},
    records::{ObjectStore, PatientRecords, StoreError},
};
use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_GREETING: &str =
    "Hello, this is Linda the Hepatology Clinic admin desk. How can I help you today?";

pub const DEFAULT_INTAKE_PROMPT: &str = "You are Linda, the administrative desk of a hepatology clinic. \
Help the patient register, collect their intake form and book an appointment. Never give medical advice. \
Always answer with a single JSON object: {\"message\": string, \"action_type\": \"TEXT_ONLY\" | \"SEND_FORM\" | \"OFFER_SLOTS\", \
\"form\"?: object, \"slots\"?: [{\"date\", \"time\", \"provider\", \"location\"}]}. \
Use SEND_FORM when the patient should fill in the intake form and OFFER_SLOTS when proposing appointments.";

const CONVERSATION_FILE: &str = "pre_consultation_chat.json";
const FORM_FILE: &str = "patient_form.json";
const OFFERED_SLOTS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Intake reply could not be normalised: {0}")]
    Malformed(String),
}

/// One patient message to the intake desk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntakeRequest {
    pub patient_message: String,
    /// Filenames already uploaded out of band.
    pub attachments: Vec<String>,
    pub form: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub time: String,
    #[serde(default, alias = "doctor", alias = "clinician")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntakeAction {
    TextOnly,
    SendForm { form: Value },
    OfferSlots { slots: Vec<Slot> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntakeReply {
    pub message: String,
    pub action: IntakeAction,
    /// The reply object as produced by the model.
    pub raw: Value,
}

impl IntakeReply {
    pub fn text(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            raw: json!({ "message": message, "action_type": "TEXT_ONLY" }),
            message,
            action: IntakeAction::TextOnly,
        }
    }

    /// Normalises a loosely shaped model reply.
    ///
    /// Accepts an object, a one-element list holding an object, or a bare
    /// string (treated as a text-only reply). Unknown action types fall
    /// back to text.
    pub fn from_value(value: Value) -> Result<Self, IntakeError> {
        let object = match value {
            Value::Object(map) => map,
            Value::Array(mut items) if items.len() == 1 => match items.remove(0) {
                Value::Object(map) => map,
                other => {
                    return Err(IntakeError::Malformed(format!(
                        "list element is not an object: {}",
                        other
                    )));
                }
            },
            Value::String(text) => return Ok(Self::text(text)),
            other => {
                return Err(IntakeError::Malformed(format!(
                    "unexpected reply shape: {}",
                    other
                )));
            }
        };

        let message = ["message", "content", "response"]
            .iter()
            .find_map(|key| object.get(*key).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        let action_type = object
            .get("action_type")
            .and_then(Value::as_str)
            .unwrap_or("TEXT_ONLY")
            .to_ascii_uppercase();

        let action = match action_type.as_str() {
            "SEND_FORM" => IntakeAction::SendForm {
                form: object
                    .get("form")
                    .or_else(|| object.get("form_fields"))
                    .cloned()
                    .unwrap_or_else(|| json!({})),
            },
            "OFFER_SLOTS" => IntakeAction::OfferSlots {
                slots: parse_slots(
                    object
                        .get("slots")
                        .or_else(|| object.get("available_slots")),
                ),
            },
            "TEXT_ONLY" => IntakeAction::TextOnly,
            other => {
                warn!(action_type = %other, "Unknown intake action type, treating as text");
                IntakeAction::TextOnly
            }
        };

        Ok(Self {
            message,
            action,
            raw: Value::Object(object),
        })
    }

    pub fn action_type(&self) -> &'static str {
        match self.action {
            IntakeAction::TextOnly => "TEXT_ONLY",
            IntakeAction::SendForm { .. } => "SEND_FORM",
            IntakeAction::OfferSlots { .. } => "OFFER_SLOTS",
        }
    }

    /// The structured payload a client needs to render the reply.
    pub fn payload(&self) -> Value {
        let mut payload = match &self.raw {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        payload.insert("message".into(), json!(self.message));
        payload.insert("action_type".into(), json!(self.action_type()));
        match &self.action {
            IntakeAction::TextOnly => {}
            IntakeAction::SendForm { form } => {
                payload.insert("form".into(), form.clone());
            }
            IntakeAction::OfferSlots { slots } => {
                payload.remove("available_slots");
                payload.insert("slots".into(), json!(slots));
            }
        }
        Value::Object(payload)
    }
}

fn parse_slots(value: Option<&Value>) -> Vec<Slot> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| serde_json::from_value::<Slot>(item.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Removes a surrounding markdown code fence, if any.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub sender: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation: Vec<ConversationEntry>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self {
            conversation: vec![ConversationEntry {
                sender: "admin".into(),
                message: DEFAULT_GREETING.into(),
            }],
        }
    }
}

/// Source of open appointment slots.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn available_slots(&self, limit: usize) -> Result<Vec<Slot>>;
}

/// Reads the clinic schedule from a JSON list in the object store. A slot
/// is open when no patient is assigned and it is not blocked.
pub struct ObjectScheduleStore {
    store: Arc<dyn ObjectStore>,
    path: String,
}

impl ObjectScheduleStore {
    pub const DEFAULT_PATH: &'static str = "clinic_data/doctor_schedule.json";

    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            path: Self::DEFAULT_PATH.to_string(),
        }
    }
}

fn is_open(entry: &Value) -> bool {
    let unassigned = match entry.get("patient") {
        None | Some(Value::Null) => true,
        Some(Value::String(p)) => p.trim().is_empty(),
        Some(_) => false,
    };
    let blocked = entry
        .get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| matches!(s.to_ascii_lowercase().as_str(), "break" | "cancelled" | "done"));
    unassigned && !blocked
}

#[async_trait]
impl ScheduleStore for ObjectScheduleStore {
    async fn available_slots(&self, limit: usize) -> Result<Vec<Slot>> {
        let text = match self.store.read_string(&self.path).await {
            Ok(text) => text,
            Err(StoreError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let entries: Vec<Value> = serde_json::from_str(&text)?;
        Ok(entries
            .iter()
            .filter(|entry| is_open(entry))
            .filter_map(|entry| serde_json::from_value::<Slot>(entry.clone()).ok())
            .take(limit)
            .collect())
    }
}

#[async_trait]
pub trait IntakeAgent: Send + Sync {
    async fn respond(&self, patient_id: &str, request: IntakeRequest) -> Result<IntakeReply>;

    /// Restores the conversation to the opening greeting.
    async fn reset(&self, patient_id: &str) -> Result<()>;
}

/// Intake desk backed by a language model, with the conversation persisted
/// per patient.
pub struct ModelIntakeAgent {
    llm: Arc<dyn LLMClient>,
    records: PatientRecords,
    schedule: Arc<dyn ScheduleStore>,
    system_prompt: String,
}

impl ModelIntakeAgent {
    pub fn new(
        llm: Arc<dyn LLMClient>,
        records: PatientRecords,
        schedule: Arc<dyn ScheduleStore>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            llm,
            records,
            schedule,
            system_prompt: system_prompt.into(),
        }
    }

    pub async fn conversation(&self, patient_id: &str) -> Result<Conversation> {
        match self.records.read_json(patient_id, CONVERSATION_FILE).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(Conversation::default()),
        }
    }

    async fn save_conversation(&self, patient_id: &str, conversation: &Conversation) -> Result<()> {
        self.records
            .write_json(patient_id, CONVERSATION_FILE, &serde_json::to_value(conversation)?)
            .await
    }

    fn build_messages(&self, conversation: &Conversation, request: &IntakeRequest) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::System(self.system_prompt.clone())];
        messages.extend(conversation.conversation.iter().map(|entry| {
            if entry.sender == "admin" {
                ChatMessage::assistant_text(entry.message.clone())
            } else {
                ChatMessage::User(entry.message.clone())
            }
        }));
        let mut turn = json!({ "patient_message": request.patient_message });
        if !request.attachments.is_empty() {
            turn["patient_attachment"] = json!(request.attachments);
        }
        if let Some(form) = &request.form {
            turn["patient_form"] = form.clone();
        }
        messages.push(ChatMessage::User(turn.to_string()));
        messages
    }
}

fn has_content(form: &Option<Value>) -> bool {
    match form {
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::Null) | None => false,
        Some(_) => true,
    }
}

#[async_trait]
impl IntakeAgent for ModelIntakeAgent {
    async fn respond(&self, patient_id: &str, request: IntakeRequest) -> Result<IntakeReply> {
        if let Some(form) = request.form.as_ref().filter(|_| has_content(&request.form)) {
            self.records.write_json(patient_id, FORM_FILE, form).await?;
            info!(%patient_id, "Stored submitted intake form");
        }

        let mut conversation = self.conversation(patient_id).await?;
        let messages = self.build_messages(&conversation, &request);

        let text = match self.llm.decide_action(messages, Vec::new()).await? {
            LLMAction::TextResponse(text) => text,
            LLMAction::ToolCall(calls) => {
                bail!("Intake model requested {} tool call(s) but has no tools", calls.len())
            }
        };
        let body = strip_code_fence(&text);
        let value = serde_json::from_str::<Value>(body).unwrap_or_else(|_| Value::String(body.to_string()));
        let mut reply = IntakeReply::from_value(value)?;

        if let IntakeAction::OfferSlots { slots } = &mut reply.action {
            if slots.is_empty() {
                *slots = self.schedule.available_slots(OFFERED_SLOTS).await?;
            }
        }

        let mut patient_entry = request.patient_message.clone();
        if !request.attachments.is_empty() {
            patient_entry.push_str(&format!(" [attachments: {}]", request.attachments.join(", ")));
        }
        conversation.conversation.push(ConversationEntry {
            sender: "patient".into(),
            message: patient_entry,
        });
        conversation.conversation.push(ConversationEntry {
            sender: "admin".into(),
            message: reply.message.clone(),
        });
        self.save_conversation(patient_id, &conversation).await?;

        info!(%patient_id, action_type = reply.action_type(), "Intake reply ready");
        Ok(reply)
    }

    async fn reset(&self, patient_id: &str) -> Result<()> {
        info!(%patient_id, "Resetting intake conversation");
        self.save_conversation(patient_id, &Conversation::default())
            .await
    }
}
