use crate::{
    generic_types::{GenericServerEvent, GenericSessionConfig},
    tools::ToolResponse,
};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// The sending half of a realtime voice session.
#[async_trait]
pub trait RealtimeSender: Send {
    /// Forwards PCM16 16 kHz mono audio to the model.
    async fn send_audio(&mut self, pcm: Bytes) -> Result<()>;

    async fn send_tool_responses(&mut self, responses: Vec<ToolResponse>) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// The receiving half of a realtime voice session.
#[async_trait]
pub trait RealtimeReceiver: Send {
    /// Returns `Ok(None)` once the provider has closed the session.
    async fn next_event(&mut self) -> Result<Option<GenericServerEvent>>;
}

pub struct RealtimeConnection {
    pub sender: Box<dyn RealtimeSender>,
    pub receiver: Box<dyn RealtimeReceiver>,
}

/// A provider of bidirectional audio sessions.
#[async_trait]
pub trait RealtimeProvider: Send + Sync {
    async fn connect(&self, config: GenericSessionConfig) -> Result<RealtimeConnection>;
}
