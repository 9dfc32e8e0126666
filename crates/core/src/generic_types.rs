use crate::{llm_client::ToolCall, tools::ToolDeclaration};
use bytes::Bytes;

/// Generic configuration for initializing a real-time session with any provider.
#[derive(Debug, Clone, Default)]
pub struct GenericSessionConfig {
    pub instructions: String,
    pub tools: Vec<ToolDeclaration>,
    /// Prebuilt voice name, e.g. `Charon`.
    pub voice_name: Option<String>,
    pub language_code: Option<String>,
}

/// Generic events that any real-time provider can emit back to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum GenericServerEvent {
    /// A transcription of the user's speech.
    InputTranscription { text: String, is_final: bool },
    /// A transcription of the model's own speech.
    OutputTranscription { text: String, is_final: bool },
    /// Raw PCM16 audio from the model.
    AudioChunk(Bytes),
    /// The model wants tools run before it continues.
    ToolCall(Vec<ToolCall>),
    /// The model finished its turn.
    TurnComplete,
    /// The user barged in; any audio not yet played belongs to a dead turn.
    Interrupted,
    /// An error from the provider.
    Error(String),
    /// The connection was closed.
    Closed,
}
