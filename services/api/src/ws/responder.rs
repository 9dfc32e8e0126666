//! Turns a model call into outbound protocol frames.
//!
//! The model is asked for an action; tool calls are dispatched and fed back
//! until it produces text, bounded by `max_tool_rounds`. The final text is
//! then delivered either as one `text` frame or as a
//! `stream_start, stream_chunk*, stream_end` sequence.

use super::{
    protocol::{ErrorCode, ServerMessage},
    session::Session,
};
use anyhow::{Result, anyhow};
use base64::{Engine as _, engine::general_purpose};
use medforce_core::{
    llm_client::{ChatMessage, LLMAction, LLMClient},
    speech::SpeechSynthesizer,
    tools::{ToolContext, ToolDispatcher},
};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};

pub const EMPTY_REPLY_APOLOGY: &str =
    "I'm sorry, I couldn't generate a response. Please try rephrasing your question.";

#[derive(Debug, Clone)]
pub struct ResponderSettings {
    pub max_tool_rounds: usize,
    pub words_per_chunk: usize,
    pub chunk_delay: Duration,
}

impl Default for ResponderSettings {
    fn default() -> Self {
        Self {
            max_tool_rounds: 8,
            words_per_chunk: 5,
            chunk_delay: Duration::from_millis(50),
        }
    }
}

pub struct StreamingResponder {
    llm: Arc<dyn LLMClient>,
    tools: Arc<ToolDispatcher>,
    speech: Option<Arc<dyn SpeechSynthesizer>>,
    settings: ResponderSettings,
}

impl StreamingResponder {
    pub fn new(
        llm: Arc<dyn LLMClient>,
        tools: Arc<ToolDispatcher>,
        speech: Option<Arc<dyn SpeechSynthesizer>>,
        settings: ResponderSettings,
    ) -> Self {
        Self {
            llm,
            tools,
            speech,
            settings,
        }
    }

    /// Runs the model to a text answer, executing requested tools in between.
    ///
    /// Once `max_tool_rounds` continuations are used up the model is called
    /// one last time with no tools so it has to answer in text.
    pub async fn complete(&self, ctx: &ToolContext, mut messages: Vec<ChatMessage>) -> Result<String> {
        let declarations = self.tools.declarations();
        for round in 0..=self.settings.max_tool_rounds {
            let tools = if round < self.settings.max_tool_rounds {
                declarations.clone()
            } else {
                warn!(patient_id = %ctx.patient_id, "Tool round limit reached, forcing a text answer");
                Vec::new()
            };
            match self.llm.decide_action(messages.clone(), tools).await? {
                LLMAction::TextResponse(text) => return Ok(text),
                LLMAction::ToolCall(calls) => {
                    info!(round, count = calls.len(), "Model requested tools");
                    messages.push(ChatMessage::Assistant {
                        content: None,
                        tool_calls: calls.clone(),
                    });
                    for call in &calls {
                        let response = self.tools.respond(ctx, call).await;
                        messages.push(ChatMessage::Tool {
                            call_id: response.call_id,
                            content: response.result.to_value().to_string(),
                        });
                    }
                }
            }
        }
        Err(anyhow!(
            "Model kept requesting tools after {} rounds",
            self.settings.max_tool_rounds
        ))
    }

    /// Streams the answer as word chunks. `stream_end` is sent even when
    /// the model call fails; the error is then returned to the caller.
    pub async fn stream_reply(
        &self,
        session: &Session,
        ctx: &ToolContext,
        messages: Vec<ChatMessage>,
    ) -> Result<String> {
        session.send(ServerMessage::StreamStart).await?;
        session.send_typing(true).await?;
        let outcome = self.complete(ctx, messages).await;
        session.send_typing(false).await?;

        let text = match outcome {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                warn!(session_id = %session.id(), "Model returned an empty reply");
                EMPTY_REPLY_APOLOGY.to_string()
            }
            Err(e) => {
                session.send(ServerMessage::StreamEnd).await?;
                return Err(e);
            }
        };

        let chunks = chunk_words(&text, self.settings.words_per_chunk);
        let last = chunks.len().saturating_sub(1);
        for (i, content) in chunks.into_iter().enumerate() {
            session.send(ServerMessage::StreamChunk { content }).await?;
            if i < last && !self.settings.chunk_delay.is_zero() {
                tokio::time::sleep(self.settings.chunk_delay).await;
            }
        }
        session.send(ServerMessage::StreamEnd).await?;
        Ok(text)
    }

    /// Sends the whole answer as one `text` frame.
    pub async fn single_reply(
        &self,
        session: &Session,
        ctx: &ToolContext,
        messages: Vec<ChatMessage>,
    ) -> Result<String> {
        session.send_typing(true).await?;
        let outcome = self.complete(ctx, messages).await;
        session.send_typing(false).await?;
        let text = outcome?;
        let content = if text.trim().is_empty() {
            EMPTY_REPLY_APOLOGY.to_string()
        } else {
            text
        };
        session
            .send(ServerMessage::Text {
                content: content.clone(),
                action_type: None,
                data: None,
                broadcast: false,
            })
            .await?;
        Ok(content)
    }

    /// Appends a synthesised audio rendition of `text`. Synthesis failures
    /// are reported to the client and do not fail the turn.
    pub async fn send_speech(&self, session: &Session, text: &str) -> Result<()> {
        let Some(speech) = &self.speech else {
            session
                .send_error("Voice responses are not available", Some(ErrorCode::VoiceUnavailable))
                .await?;
            return Ok(());
        };
        match speech.synthesize(text).await {
            Ok(audio) => {
                session
                    .send(ServerMessage::AudioResponse {
                        data: general_purpose::STANDARD.encode(&audio.bytes),
                        mime_type: audio.mime_type,
                    })
                    .await?;
            }
            Err(e) => {
                warn!(session_id = %session.id(), error = ?e, "Speech synthesis failed");
                session
                    .send_error("Could not synthesise the audio reply", Some(ErrorCode::UpstreamFailed))
                    .await?;
            }
        }
        Ok(())
    }
}

/// Splits `text` into chunks of `words_per_chunk` words. Whitespace is kept
/// with the preceding word, so the chunks concatenate back to `text`.
pub fn chunk_words(text: &str, words_per_chunk: usize) -> Vec<String> {
    let per_chunk = words_per_chunk.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut words = 0;
    let mut in_word = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if in_word {
                in_word = false;
                words += 1;
            }
        } else if !in_word {
            if words == per_chunk {
                chunks.push(std::mem::take(&mut current));
                words = 0;
            }
            in_word = true;
        }
        current.push(c);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
