//! Gemini Live client implementing the realtime voice traits.
//!
//! The client opens the `BidiGenerateContent` socket, sends the setup
//! message and waits for `setupComplete` before handing out the split
//! sender/receiver halves.

pub mod types;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use medforce_core::{
    generic_types::{GenericServerEvent, GenericSessionConfig},
    llm_client::ToolCall,
    realtime_api::{RealtimeConnection, RealtimeProvider, RealtimeReceiver, RealtimeSender},
    tools::ToolResponse,
};
use serde_json::{Map, Value};
use std::{collections::VecDeque, time::Duration};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message as WsMessage,
};
use tracing::{debug, error, info, warn};
use types::*;

const GEMINI_LIVE_URL: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Sample rate Gemini Live expects for realtime audio input.
pub const INPUT_SAMPLE_RATE: u32 = 16000;
/// Sample rate of the PCM16 audio Gemini Live produces.
pub const OUTPUT_SAMPLE_RATE: u32 = 24000;

const SETUP_TIMEOUT: Duration = Duration::from_secs(15);

type GeminiStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct GeminiLiveProvider {
    api_key: String,
    model: String,
    url: String,
}

impl GeminiLiveProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            url: GEMINI_LIVE_URL.to_string(),
        }
    }

    /// Points the client at a different endpoint.
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

pub fn setup_message(model: &str, config: &GenericSessionConfig) -> ClientMessage {
    let speech_config = config.voice_name.as_ref().map(|voice_name| SpeechConfig {
        voice_config: VoiceConfig {
            prebuilt_voice_config: PrebuiltVoiceConfig {
                voice_name: voice_name.clone(),
            },
        },
        language_code: config.language_code.clone(),
    });
    let tools = if config.tools.is_empty() {
        Vec::new()
    } else {
        vec![Tool {
            function_declarations: config
                .tools
                .iter()
                .map(|d| FunctionDeclaration {
                    name: d.name.clone(),
                    description: d.description.clone(),
                    parameters: d.parameters.clone(),
                })
                .collect(),
        }]
    };
    let system_instruction = (!config.instructions.is_empty()).then(|| Content {
        parts: vec![Part {
            text: config.instructions.clone(),
        }],
    });

    ClientMessage::Setup(BidiGenerateContentSetup {
        model: model.to_string(),
        generation_config: GenerationConfig {
            response_modalities: vec![ResponseModality::Audio],
            speech_config,
        },
        system_instruction,
        tools,
        realtime_input_config: RealtimeInputConfig {
            automatic_activity_detection: AutomaticActivityDetection { disabled: false },
        },
        input_audio_transcription: AudioTranscriptionConfig::default(),
        output_audio_transcription: AudioTranscriptionConfig::default(),
    })
}

/// Maps one server message onto zero or more generic events, in the order
/// a client should observe them.
pub fn events_from(message: ServerMessage) -> Vec<GenericServerEvent> {
    let mut events = Vec::new();
    if let Some(content) = message.server_content {
        if content.interrupted == Some(true) {
            events.push(GenericServerEvent::Interrupted);
        }
        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            events.push(GenericServerEvent::InputTranscription {
                text: t.text,
                is_final: true,
            });
        }
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(blob) = part.inline_data {
                    match general_purpose::STANDARD.decode(&blob.data) {
                        Ok(pcm) => events.push(GenericServerEvent::AudioChunk(Bytes::from(pcm))),
                        Err(e) => warn!(error = %e, "Dropping undecodable audio from Gemini"),
                    }
                }
            }
        }
        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            events.push(GenericServerEvent::OutputTranscription {
                text: t.text,
                is_final: false,
            });
        }
        if content.turn_complete == Some(true) {
            events.push(GenericServerEvent::TurnComplete);
        }
    }
    if let Some(tool_call) = message.tool_call {
        let calls: Vec<ToolCall> = tool_call
            .function_calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.name,
                arguments: match call.args {
                    Value::Object(map) => Value::Object(map),
                    _ => Value::Object(Map::new()),
                },
            })
            .collect();
        if !calls.is_empty() {
            events.push(GenericServerEvent::ToolCall(calls));
        }
    }
    if message.go_away.is_some() {
        warn!("Gemini announced it will close the session soon");
    }
    events
}

fn parse_server_message(message: &WsMessage) -> Option<Result<ServerMessage>> {
    let raw: &[u8] = match message {
        WsMessage::Text(text) => text.as_bytes(),
        WsMessage::Binary(data) => &data[..],
        _ => return None,
    };
    Some(serde_json::from_slice(raw).map_err(Into::into))
}

#[async_trait]
impl RealtimeProvider for GeminiLiveProvider {
    async fn connect(&self, config: GenericSessionConfig) -> Result<RealtimeConnection> {
        let url = format!("{}?key={}", self.url, self.api_key);
        let (ws_stream, _) = connect_async(url)
            .await
            .context("Failed to connect to Gemini Live")?;
        info!(model = %self.model, "Connected to Gemini Live WebSocket.");
        let (mut sink, mut stream) = ws_stream.split();

        let setup = setup_message(&self.model, &config);
        sink.send(WsMessage::Text(serde_json::to_string(&setup)?.into()))
            .await?;

        tokio::time::timeout(SETUP_TIMEOUT, async {
            while let Some(message) = stream.next().await {
                let message = message?;
                if let WsMessage::Close(frame) = &message {
                    return Err(anyhow!("Gemini closed the session during setup: {:?}", frame));
                }
                match parse_server_message(&message) {
                    Some(Ok(parsed)) if parsed.setup_complete.is_some() => return Ok(()),
                    Some(Ok(parsed)) => {
                        warn!(?parsed, "Unexpected message during Gemini setup");
                    }
                    Some(Err(e)) => warn!(error = %e, "Unparseable message during Gemini setup"),
                    None => {}
                }
            }
            Err(anyhow!("Gemini stream ended before setup completed"))
        })
        .await
        .context("Timed out waiting for Gemini setup")??;
        info!("Gemini session setup is complete. Ready for bidirectional streaming.");

        Ok(RealtimeConnection {
            sender: Box::new(GeminiSender { sink }),
            receiver: Box::new(GeminiReceiver {
                stream,
                pending: VecDeque::new(),
                closed: false,
            }),
        })
    }
}

pub struct GeminiSender {
    sink: SplitSink<GeminiStream, WsMessage>,
}

impl GeminiSender {
    async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        self.sink.send(WsMessage::Text(payload.into())).await?;
        Ok(())
    }
}

#[async_trait]
impl RealtimeSender for GeminiSender {
    async fn send_audio(&mut self, pcm: Bytes) -> Result<()> {
        let message = ClientMessage::RealtimeInput(BidiGenerateContentRealtimeInput {
            audio: Blob {
                mime_type: format!("audio/pcm;rate={}", INPUT_SAMPLE_RATE),
                data: general_purpose::STANDARD.encode(&pcm),
            },
        });
        self.send(&message).await
    }

    async fn send_tool_responses(&mut self, responses: Vec<ToolResponse>) -> Result<()> {
        debug!(count = responses.len(), "Sending tool responses to Gemini");
        let message = ClientMessage::ToolResponse(BidiGenerateContentToolResponse {
            function_responses: responses
                .into_iter()
                .map(|r| FunctionResponse {
                    id: r.call_id,
                    name: r.name,
                    response: r.result.to_value(),
                })
                .collect(),
        });
        self.send(&message).await
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.send(WsMessage::Close(None)).await.ok();
        self.sink.close().await.ok();
        Ok(())
    }
}

pub struct GeminiReceiver {
    stream: SplitStream<GeminiStream>,
    pending: VecDeque<GenericServerEvent>,
    closed: bool,
}

#[async_trait]
impl RealtimeReceiver for GeminiReceiver {
    async fn next_event(&mut self) -> Result<Option<GenericServerEvent>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.closed {
                return Ok(None);
            }
            match self.stream.next().await {
                Some(Ok(WsMessage::Close(frame))) => {
                    info!(?frame, "Gemini closed the session");
                    self.closed = true;
                    return Ok(Some(GenericServerEvent::Closed));
                }
                Some(Ok(message)) => match parse_server_message(&message) {
                    Some(Ok(parsed)) => self.pending.extend(events_from(parsed)),
                    Some(Err(e)) => warn!(error = %e, "Ignoring unparseable Gemini message"),
                    None => {}
                },
                Some(Err(e)) => {
                    error!("Error reading from Gemini WebSocket: {}", e);
                    self.closed = true;
                    return Ok(Some(GenericServerEvent::Error(e.to_string())));
                }
                None => {
                    self.closed = true;
                    return Ok(Some(GenericServerEvent::Closed));
                }
            }
        }
    }
}
