//! Defines the WebSocket message protocol between the client and the API server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Which conversational behaviour a connection runs.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentMode {
    /// Administrative intake desk (forms, appointment slots).
    Intake,
    /// General clinical Q&A with tools.
    Chat,
    /// Full-duplex voice.
    Voice,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentMode::Intake => "intake",
            AgentMode::Chat => "chat",
            AgentMode::Voice => "voice",
        }
    }
}

impl fmt::Display for AgentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_true() -> bool {
    true
}

/// A JSON message sent from the client to the server.
///
/// Every field is optional on the wire; control frames only carry `type`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ClientMessage {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub form_data: Option<Value>,
    #[serde(default = "default_true")]
    pub stream: bool,
    #[serde(default)]
    pub voice_response: bool,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl ClientMessage {
    pub fn is_stop(&self) -> bool {
        self.kind.as_deref() == Some("stop")
    }
}

/// Machine-readable error codes carried by `error` frames.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidMessage,
    ProcessingFailed,
    VoiceUnavailable,
    UpstreamFailed,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptSource {
    User,
    Agent,
}

/// Messages sent from the server to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A complete text reply, or a care-team notification when `broadcast` is set.
    Text {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        action_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        broadcast: bool,
    },
    /// Asks the client to render a form.
    Form {
        content: String,
        action_type: String,
        data: Value,
    },
    /// Offers appointment slots.
    Slots {
        content: String,
        action_type: String,
        data: Value,
    },
    /// Acknowledges attachments received with a message.
    Attachment { files: Vec<String> },
    Error {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
    },
    Status {
        status: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        agent_type: Option<AgentMode>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cleared: Option<usize>,
    },
    Typing { is_typing: bool },
    /// A tool started or finished on behalf of the model.
    ToolCall { name: String, status: String },
    StreamStart,
    StreamChunk { content: String },
    StreamEnd,
    AudioStart,
    AudioEnd { interrupted: bool },
    /// A synthesised reply appended after a text stream.
    AudioResponse { data: String, mime_type: String },
    Transcription {
        text: String,
        source: TranscriptSource,
        is_final: bool,
    },
}

impl ServerMessage {
    pub fn error(error: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            error: error.into(),
            error_code: Some(code),
        }
    }

    pub fn notification(content: impl Into<String>) -> Self {
        ServerMessage::Text {
            content: content.into(),
            action_type: None,
            data: None,
            broadcast: true,
        }
    }

    /// The wire `type` of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Text { .. } => "text",
            ServerMessage::Form { .. } => "form",
            ServerMessage::Slots { .. } => "slots",
            ServerMessage::Attachment { .. } => "attachment",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Status { .. } => "status",
            ServerMessage::Typing { .. } => "typing",
            ServerMessage::ToolCall { .. } => "tool_call",
            ServerMessage::StreamStart => "stream_start",
            ServerMessage::StreamChunk { .. } => "stream_chunk",
            ServerMessage::StreamEnd => "stream_end",
            ServerMessage::AudioStart => "audio_start",
            ServerMessage::AudioEnd { .. } => "audio_end",
            ServerMessage::AudioResponse { .. } => "audio_response",
            ServerMessage::Transcription { .. } => "transcription",
        }
    }
}

/// A server message as it goes on the wire, stamped with time and origin.
#[derive(Serialize, Debug)]
pub struct OutboundFrame<'a> {
    #[serde(flatten)]
    pub message: &'a ServerMessage,
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
}
