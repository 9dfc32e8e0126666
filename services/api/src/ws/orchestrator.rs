//! Per-connection entry point: registers the session, dispatches each inbound
//! message to the behaviour of the channel's mode, and tears down on exit.

use super::{
    agent_cache::AgentCache,
    manager::{BroadcastReport, ConnectionManager},
    protocol::{AgentMode, ClientMessage, ErrorCode, ServerMessage},
    responder::StreamingResponder,
    session::{FrameSink, Session, SessionError},
    voice::{VoiceSettings, run_voice_session},
};
use crate::state::AppState;
use anyhow::{Result, anyhow};
use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures_util::{Stream, StreamExt};
use medforce_core::{
    generic_types::GenericSessionConfig,
    intake::{IntakeAction, IntakeAgent, IntakeRequest},
    realtime_api::RealtimeProvider,
    records::PatientRecords,
    tools::{ToolContext, ToolDispatcher},
};
use std::sync::Arc;
use tracing::{Instrument, error, info, info_span, warn};

/// Close code sent when the server cannot serve the requested channel.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_NORMAL: u16 = 1000;

/// Shown to the client when a turn fails; the cause stays in the logs.
pub const PROCESSING_FAILED_MESSAGE: &str =
    "Sorry, something went wrong while processing your message. Please try again.";

/// Per-source cap on record text placed in the voice system instruction.
const VOICE_CONTEXT_CHARS: usize = 1500;

/// Realtime voice backend and how sessions are configured on it.
pub struct VoiceBackend {
    pub provider: Arc<dyn RealtimeProvider>,
    pub voice_name: Option<String>,
    pub client_sample_rate: u32,
}

pub struct LiveAgentOrchestrator {
    connections: ConnectionManager,
    agents: AgentCache,
    intake: Arc<dyn IntakeAgent>,
    responder: StreamingResponder,
    tools: Arc<ToolDispatcher>,
    records: PatientRecords,
    voice: Option<VoiceBackend>,
    voice_prompt: String,
}

impl LiveAgentOrchestrator {
    pub fn new(
        agents: AgentCache,
        intake: Arc<dyn IntakeAgent>,
        responder: StreamingResponder,
        tools: Arc<ToolDispatcher>,
        records: PatientRecords,
    ) -> Self {
        Self {
            connections: ConnectionManager::new(),
            agents,
            intake,
            responder,
            tools,
            records,
            voice: None,
            voice_prompt: String::new(),
        }
    }

    /// Enables the voice channel. `prompt` is sent as the system instruction
    /// ahead of the patient context.
    pub fn with_voice(mut self, backend: VoiceBackend, prompt: impl Into<String>) -> Self {
        self.voice = Some(backend);
        self.voice_prompt = prompt.into();
        self
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn voice_available(&self) -> bool {
        self.voice.is_some()
    }

    /// Sends a care-team notification to every open session of the patient.
    pub async fn notify_patient(&self, patient_id: &str, message: &str) -> BroadcastReport {
        self.connections
            .broadcast_to_patient(patient_id, ServerMessage::notification(message))
            .await
    }

    /// Restarts the intake conversation and drops the cached chat history.
    pub async fn reset_patient(&self, patient_id: &str) -> Result<()> {
        self.intake.reset(patient_id).await?;
        let evicted = self.agents.evict(patient_id);
        info!(%patient_id, evicted, "Patient conversation reset");
        Ok(())
    }

    pub async fn handle_connection(&self, socket: WebSocket, patient_id: String, mode: AgentMode) {
        let (sink, stream) = socket.split();
        self.run_connection(Box::new(sink), stream, patient_id, mode)
            .await;
    }

    /// Serves one connection until the client leaves. The session is
    /// deregistered however this returns.
    pub async fn run_connection<S>(
        &self,
        sink: Box<dyn FrameSink>,
        inbound: S,
        patient_id: String,
        mode: AgentMode,
    ) where
        S: Stream<Item = Result<Message, axum::Error>> + Send + Unpin + 'static,
    {
        let session = self.connections.connect(sink, &patient_id, mode);
        let _guard = self.connections.guard(&session);
        let span = info_span!("ws_session", session_id = %session.id(), %patient_id, %mode);

        async {
            let outcome = match mode {
                AgentMode::Voice => self.serve_voice(session.clone(), inbound).await,
                AgentMode::Intake | AgentMode::Chat => self.serve_text(&session, inbound).await,
            };
            match outcome {
                Ok(()) => info!("Session finished"),
                Err(e) => error!(error = ?e, "Session ended with error"),
            }
        }
        .instrument(span)
        .await;
    }

    async fn send_welcome(&self, session: &Session) -> Result<(), SessionError> {
        let message = match session.mode() {
            AgentMode::Intake => "Connected to the clinic admin desk",
            AgentMode::Chat => "Connected to the clinical assistant",
            AgentMode::Voice => "Voice session ready",
        };
        session
            .send(ServerMessage::Status {
                status: "connected".into(),
                message: message.into(),
                agent_type: Some(session.mode()),
                cleared: None,
            })
            .await
    }

    async fn serve_text<S>(&self, session: &Session, mut inbound: S) -> Result<()>
    where
        S: Stream<Item = Result<Message, axum::Error>> + Send + Unpin,
    {
        self.send_welcome(session).await?;

        while let Some(frame) = inbound.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(error = %e, "Client transport failed");
                    break;
                }
            };
            match frame {
                Message::Text(text) => {
                    session.begin_processing();
                    let outcome = self.handle_text(session, text.as_str()).await;
                    session.finish_processing();
                    if let Err(e) = outcome {
                        if e.downcast_ref::<SessionError>().is_some() {
                            return Err(e);
                        }
                        warn!(error = ?e, "Message handling failed");
                        session
                            .send(ServerMessage::error(
                                PROCESSING_FAILED_MESSAGE,
                                ErrorCode::ProcessingFailed,
                            ))
                            .await?;
                    }
                }
                Message::Binary(_) => {
                    session
                        .send_error(
                            "Binary frames are only accepted on the voice channel",
                            Some(ErrorCode::InvalidMessage),
                        )
                        .await?;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        Ok(())
    }

    async fn handle_text(&self, session: &Session, text: &str) -> Result<()> {
        let msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "Rejected malformed client message");
                session
                    .send_error(format!("Invalid message: {e}"), Some(ErrorCode::InvalidMessage))
                    .await?;
                return Ok(());
            }
        };
        info!(message_count = session.message_count(), "Handling client message");

        match session.mode() {
            AgentMode::Intake => self.handle_intake(session, msg).await,
            AgentMode::Chat => self.handle_chat(session, msg).await,
            AgentMode::Voice => Err(anyhow!("voice sessions do not take text turns")),
        }
    }

    async fn handle_intake(&self, session: &Session, msg: ClientMessage) -> Result<()> {
        if msg.message.trim().is_empty() && msg.form_data.is_none() && msg.attachments.is_empty() {
            session
                .send_error("Message must not be empty", Some(ErrorCode::InvalidMessage))
                .await?;
            return Ok(());
        }
        if !msg.attachments.is_empty() {
            session
                .send(ServerMessage::Attachment {
                    files: msg.attachments.clone(),
                })
                .await?;
        }

        session.send_typing(true).await?;
        let request = IntakeRequest {
            patient_message: msg.message,
            attachments: msg.attachments,
            form: msg.form_data,
        };
        let reply = self.intake.respond(session.patient_id(), request).await;
        session.send_typing(false).await?;
        let reply = reply?;

        let data = reply.payload();
        let action_type = reply.action_type().to_string();
        let content = reply.message;
        let message = match reply.action {
            IntakeAction::TextOnly => ServerMessage::Text {
                content,
                action_type: Some(action_type),
                data: Some(data),
                broadcast: false,
            },
            IntakeAction::SendForm { .. } => ServerMessage::Form {
                content,
                action_type,
                data,
            },
            IntakeAction::OfferSlots { .. } => ServerMessage::Slots {
                content,
                action_type,
                data,
            },
        };
        session.send(message).await?;
        Ok(())
    }

    async fn handle_chat(&self, session: &Session, msg: ClientMessage) -> Result<()> {
        if msg.message.trim().is_empty() {
            session
                .send_error("Message must not be empty", Some(ErrorCode::InvalidMessage))
                .await?;
            return Ok(());
        }

        let agent = self.agents.get_or_load(session.patient_id(), &self.records).await;
        let ctx = ToolContext::new(session.patient_id()).with_session(session.id());

        let reply = {
            let mut turn = agent.begin_turn().await;
            let messages = turn.messages_for(&msg.message);
            let reply = if msg.stream {
                self.responder.stream_reply(session, &ctx, messages).await?
            } else {
                self.responder.single_reply(session, &ctx, messages).await?
            };
            turn.record(&msg.message, &reply);
            reply
        };

        if msg.voice_response {
            self.responder.send_speech(session, &reply).await?;
        }
        Ok(())
    }

    async fn serve_voice<S>(&self, session: Arc<Session>, inbound: S) -> Result<()>
    where
        S: Stream<Item = Result<Message, axum::Error>> + Send + Unpin + 'static,
    {
        let Some(backend) = &self.voice else {
            warn!("Voice requested but no realtime provider is configured");
            session
                .send_error("Voice mode is not available", Some(ErrorCode::VoiceUnavailable))
                .await?;
            session
                .close(CLOSE_INTERNAL_ERROR, "voice unavailable")
                .await?;
            return Ok(());
        };

        let context = self.records.load_context(session.patient_id()).await;
        let config = GenericSessionConfig {
            instructions: format!(
                "{}\n\nCurrent patient: {}\n{}",
                self.voice_prompt,
                session.patient_id(),
                context.summary(VOICE_CONTEXT_CHARS)
            ),
            tools: self.tools.declarations(),
            voice_name: backend.voice_name.clone(),
            language_code: None,
        };
        let connection = match backend.provider.connect(config).await {
            Ok(connection) => connection,
            Err(e) => {
                error!(error = ?e, "Could not open the realtime model session");
                session
                    .send_error("Voice model connection failed", Some(ErrorCode::UpstreamFailed))
                    .await?;
                session
                    .close(CLOSE_INTERNAL_ERROR, "voice model unavailable")
                    .await?;
                return Ok(());
            }
        };
        self.send_welcome(&session).await?;

        run_voice_session(
            session.clone(),
            inbound,
            connection,
            self.tools.clone(),
            VoiceSettings {
                client_sample_rate: backend.client_sample_rate,
            },
        )
        .await?;

        if let Err(e) = session.close(CLOSE_NORMAL, "voice session ended").await {
            info!(error = %e, "Client already gone");
        }
        Ok(())
    }
}

fn upgrade(
    ws: WebSocketUpgrade,
    state: Arc<AppState>,
    patient_id: String,
    mode: AgentMode,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        state
            .orchestrator
            .handle_connection(socket, patient_id, mode)
            .await
    })
}

/// Administrative intake channel.
pub async fn intake_ws_handler(
    ws: WebSocketUpgrade,
    Path(patient_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    upgrade(ws, state, patient_id, AgentMode::Intake)
}

/// General clinical Q&A channel.
pub async fn chat_ws_handler(
    ws: WebSocketUpgrade,
    Path(patient_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    upgrade(ws, state, patient_id, AgentMode::Chat)
}

/// Full-duplex voice channel.
pub async fn voice_ws_handler(
    ws: WebSocketUpgrade,
    Path(patient_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    upgrade(ws, state, patient_id, AgentMode::Voice)
}
