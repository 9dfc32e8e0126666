use anyhow::Result;
use async_openai::{
    Client,
    config::OpenAIConfig,
    types::{CreateSpeechRequestArgs, SpeechModel, Voice},
};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

/// Synthesised speech ready to ship to a client.
#[derive(Debug, Clone, PartialEq)]
pub struct Audio {
    pub bytes: Bytes,
    pub mime_type: String,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Audio>;
}

/// Text-to-speech through an OpenAI-compatible `audio/speech` endpoint.
pub struct OpenAISpeechSynthesizer {
    client: Client<OpenAIConfig>,
    voice: Voice,
}

impl OpenAISpeechSynthesizer {
    pub fn new(config: OpenAIConfig) -> Self {
        Self {
            client: Client::with_config(config),
            voice: Voice::Alloy,
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAISpeechSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Audio> {
        let request = CreateSpeechRequestArgs::default()
            .input(text)
            .voice(self.voice.clone())
            .model(SpeechModel::Tts1)
            .build()?;
        let response = self.client.audio().speech(request).await?;
        debug!(bytes = response.bytes.len(), "Synthesised speech");
        Ok(Audio {
            bytes: response.bytes,
            mime_type: "audio/mpeg".to_string(),
        })
    }
}
