//! Full-duplex voice session.
//!
//! Four tasks share one session and stop together:
//! - inbound: client frames, audio into the model queue, `stop` control frames
//! - outbound: queued client audio, resampled, to the model
//! - model: transcripts, tool calls and audio from the model
//! - playback: queued model audio to the client

use super::{
    playback::{PlaybackFrame, PlaybackQueue},
    protocol::{ClientMessage, ErrorCode, ServerMessage, TranscriptSource},
    session::Session,
};
use crate::audio_utils::PcmResampler;
use anyhow::Result;
use axum::extract::ws::Message;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use gemini_realtime::INPUT_SAMPLE_RATE;
use medforce_core::{
    generic_types::GenericServerEvent,
    llm_client::ToolCall,
    realtime_api::{RealtimeConnection, RealtimeReceiver, RealtimeSender},
    tools::{ToolContext, ToolDispatcher},
};
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

/// Client audio frames buffered ahead of the model connection.
const OUTBOUND_QUEUE_CAPACITY: usize = 10;

type SharedSender = Arc<Mutex<Box<dyn RealtimeSender>>>;

/// Held while the playback task takes and writes a frame, and while a client
/// stop runs, so no audio taken before a stop is written after its status.
type PlaybackLock = Arc<Mutex<()>>;

pub struct VoiceSettings {
    pub client_sample_rate: u32,
}

/// Runs a voice session until the client or the model goes away.
pub async fn run_voice_session<S>(
    session: Arc<Session>,
    inbound: S,
    connection: RealtimeConnection,
    tools: Arc<ToolDispatcher>,
    settings: VoiceSettings,
) -> Result<()>
where
    S: Stream<Item = Result<Message, axum::Error>> + Send + Unpin + 'static,
{
    let resampler = PcmResampler::new(settings.client_sample_rate, INPUT_SAMPLE_RATE)?;
    let sender: SharedSender = Arc::new(Mutex::new(connection.sender));
    let queue = Arc::new(PlaybackQueue::new());
    let playback_lock: PlaybackLock = Arc::new(Mutex::new(()));
    let (audio_tx, audio_rx) = mpsc::channel::<Bytes>(OUTBOUND_QUEUE_CAPACITY);
    let ctx = ToolContext::new(session.patient_id()).with_session(session.id());

    let mut tasks = JoinSet::new();
    tasks.spawn(receive_client(
        session.clone(),
        inbound,
        audio_tx,
        queue.clone(),
        playback_lock.clone(),
    ));
    tasks.spawn(forward_audio(audio_rx, sender.clone(), resampler));
    tasks.spawn(receive_model(
        session.clone(),
        connection.receiver,
        sender.clone(),
        queue.clone(),
        tools,
        ctx,
    ));
    tasks.spawn(play_audio(session.clone(), queue, playback_lock));

    if let Some(first) = tasks.join_next().await {
        match first {
            Ok(Ok(())) => info!(session_id = %session.id(), "Voice task finished, tearing down"),
            Ok(Err(e)) => warn!(session_id = %session.id(), error = ?e, "Voice task failed, tearing down"),
            Err(e) => error!(session_id = %session.id(), error = %e, "Voice task panicked"),
        }
    }
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}

    if let Err(e) = sender.lock().await.close().await {
        debug!(error = ?e, "Model connection already closed");
    }
    Ok(())
}

async fn receive_client<S>(
    session: Arc<Session>,
    mut inbound: S,
    audio_tx: mpsc::Sender<Bytes>,
    queue: Arc<PlaybackQueue>,
    playback_lock: PlaybackLock,
) -> Result<()>
where
    S: Stream<Item = Result<Message, axum::Error>> + Send + Unpin,
{
    while let Some(frame) = inbound.next().await {
        match frame? {
            Message::Binary(pcm) => {
                session.begin_processing();
                if audio_tx.send(pcm).await.is_err() {
                    break;
                }
            }
            Message::Text(text) => {
                session.begin_processing();
                match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(msg) if msg.is_stop() => {
                        let _playback = playback_lock.lock().await;
                        let cleared = queue.stop();
                        info!(session_id = %session.id(), cleared, "Playback stopped by client");
                        session
                            .send(ServerMessage::Status {
                                status: "stopped".into(),
                                message: "Playback stopped".into(),
                                agent_type: None,
                                cleared: Some(cleared),
                            })
                            .await?;
                    }
                    Ok(msg) => debug!(kind = ?msg.kind, "Ignoring control frame on voice channel"),
                    Err(e) => {
                        session
                            .send_error(
                                format!("Invalid message: {e}"),
                                Some(ErrorCode::InvalidMessage),
                            )
                            .await?;
                    }
                }
                session.finish_processing();
            }
            Message::Close(_) => break,
            _ => {}
        }
    }
    Ok(())
}

async fn forward_audio(
    mut audio_rx: mpsc::Receiver<Bytes>,
    sender: SharedSender,
    mut resampler: PcmResampler,
) -> Result<()> {
    while let Some(pcm) = audio_rx.recv().await {
        let pcm = resampler.process(pcm)?;
        if pcm.is_empty() {
            continue;
        }
        sender.lock().await.send_audio(pcm).await?;
    }
    Ok(())
}

async fn receive_model(
    session: Arc<Session>,
    mut receiver: Box<dyn RealtimeReceiver>,
    sender: SharedSender,
    queue: Arc<PlaybackQueue>,
    tools: Arc<ToolDispatcher>,
    ctx: ToolContext,
) -> Result<()> {
    loop {
        let event = match receiver.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(e) => {
                error!(session_id = %session.id(), error = ?e, "Model stream failed");
                session
                    .send_error("Voice model connection failed", Some(ErrorCode::UpstreamFailed))
                    .await?;
                break;
            }
        };
        match event {
            GenericServerEvent::InputTranscription { text, is_final } => {
                session
                    .send(ServerMessage::Transcription {
                        text,
                        source: TranscriptSource::User,
                        is_final,
                    })
                    .await?;
            }
            GenericServerEvent::OutputTranscription { text, is_final } => {
                session
                    .send(ServerMessage::Transcription {
                        text,
                        source: TranscriptSource::Agent,
                        is_final,
                    })
                    .await?;
            }
            GenericServerEvent::AudioChunk(pcm) => queue.push_audio(pcm),
            GenericServerEvent::ToolCall(calls) => {
                run_tools(&session, &sender, &tools, &ctx, calls).await?;
            }
            GenericServerEvent::TurnComplete => {
                queue.finish_turn();
                session.finish_processing();
            }
            GenericServerEvent::Interrupted => {
                let cleared = queue.interrupt();
                debug!(cleared, "Model reported barge-in");
            }
            GenericServerEvent::Error(message) => {
                error!(session_id = %session.id(), %message, "Model reported an error");
                session
                    .send_error("Voice model connection failed", Some(ErrorCode::UpstreamFailed))
                    .await?;
                break;
            }
            GenericServerEvent::Closed => break,
        }
    }
    Ok(())
}

/// Runs every requested tool in order and returns all results to the model
/// in one message.
async fn run_tools(
    session: &Session,
    sender: &SharedSender,
    tools: &ToolDispatcher,
    ctx: &ToolContext,
    calls: Vec<ToolCall>,
) -> Result<()> {
    let mut responses = Vec::with_capacity(calls.len());
    for call in &calls {
        session
            .send(ServerMessage::ToolCall {
                name: call.name.clone(),
                status: "started".into(),
            })
            .await?;
        let response = tools.respond(ctx, call).await;
        let status = if response.result.is_error {
            "failed"
        } else {
            "completed"
        };
        session
            .send(ServerMessage::ToolCall {
                name: call.name.clone(),
                status: status.into(),
            })
            .await?;
        responses.push(response);
    }
    sender.lock().await.send_tool_responses(responses).await
}

async fn play_audio(
    session: Arc<Session>,
    queue: Arc<PlaybackQueue>,
    playback_lock: PlaybackLock,
) -> Result<()> {
    let mut playing = false;
    loop {
        queue.ready().await;
        let _playback = playback_lock.lock().await;
        let Some(frame) = queue.try_next() else {
            continue;
        };
        match frame {
            PlaybackFrame::Audio(pcm) => {
                if !playing {
                    session.send(ServerMessage::AudioStart).await?;
                    playing = true;
                }
                session.send_audio(pcm).await?;
            }
            PlaybackFrame::TurnComplete | PlaybackFrame::Interrupted if !playing => {}
            PlaybackFrame::TurnComplete => {
                session
                    .send(ServerMessage::AudioEnd { interrupted: false })
                    .await?;
                playing = false;
            }
            PlaybackFrame::Interrupted => {
                session
                    .send(ServerMessage::AudioEnd { interrupted: true })
                    .await?;
                playing = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::session::{
        Frame, SessionState,
        testing::{channel_session, json as frame_json},
    };
    use async_trait::async_trait;
    use medforce_core::tools::{ToolDeclaration, ToolHandler, ToolResponse};
    use serde_json::{Value, json};
    use std::{sync::Mutex as StdMutex, time::Duration};
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
    use futures_util::stream;

    #[derive(Default)]
    struct ModelLog {
        audio: Vec<Bytes>,
        tool_responses: Vec<ToolResponse>,
        closed: bool,
    }

    struct FakeSender(Arc<StdMutex<ModelLog>>);

    #[async_trait]
    impl RealtimeSender for FakeSender {
        async fn send_audio(&mut self, pcm: Bytes) -> Result<()> {
            self.0.lock().unwrap().audio.push(pcm);
            Ok(())
        }

        async fn send_tool_responses(&mut self, responses: Vec<ToolResponse>) -> Result<()> {
            self.0.lock().unwrap().tool_responses.extend(responses);
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.0.lock().unwrap().closed = true;
            Ok(())
        }
    }

    struct FakeReceiver(UnboundedReceiver<GenericServerEvent>);

    #[async_trait]
    impl RealtimeReceiver for FakeReceiver {
        async fn next_event(&mut self) -> Result<Option<GenericServerEvent>> {
            Ok(self.0.recv().await)
        }
    }

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn declaration(&self) -> ToolDeclaration {
            ToolDeclaration {
                name: "get_patient_labs".into(),
                description: "labs".into(),
                parameters: json!({"type": "object", "properties": {}}),
            }
        }

        async fn call(&self, ctx: &ToolContext, _arguments: Value) -> Result<Value> {
            Ok(json!({"patient": ctx.patient_id}))
        }
    }

    struct Harness {
        client_tx: UnboundedSender<Result<Message, axum::Error>>,
        model_tx: UnboundedSender<GenericServerEvent>,
        frames: UnboundedReceiver<Frame>,
        log: Arc<StdMutex<ModelLog>>,
        handle: tokio::task::JoinHandle<Result<()>>,
    }

    fn start(client_sample_rate: u32) -> Harness {
        let (session, frames) = channel_session("P0001");
        session.set_state(SessionState::Connected);
        let (client_tx, client_rx) = unbounded_channel();
        let (model_tx, model_rx) = unbounded_channel();
        let log = Arc::new(StdMutex::new(ModelLog::default()));
        let connection = RealtimeConnection {
            sender: Box::new(FakeSender(log.clone())),
            receiver: Box::new(FakeReceiver(model_rx)),
        };
        let mut tools = ToolDispatcher::empty();
        tools.register(Arc::new(EchoTool)).unwrap();
        let handle = tokio::spawn(run_voice_session(
            Arc::new(session),
            Box::pin(stream::unfold(client_rx, |mut rx| async move {
                rx.recv().await.map(|frame| (frame, rx))
            })),
            connection,
            Arc::new(tools),
            VoiceSettings { client_sample_rate },
        ));
        Harness {
            client_tx,
            model_tx,
            frames,
            log,
            handle,
        }
    }

    async fn next_frame(frames: &mut UnboundedReceiver<Frame>) -> Frame {
        tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("session sink closed")
    }

    async fn next_json(frames: &mut UnboundedReceiver<Frame>) -> Value {
        frame_json(next_frame(frames).await)
    }

    #[tokio::test]
    async fn test_client_audio_reaches_model() {
        let h = start(INPUT_SAMPLE_RATE);
        h.client_tx
            .send(Ok(Message::Binary(Bytes::from_static(&[1, 0, 2, 0]))))
            .unwrap();
        for _ in 0..100 {
            if !h.log.lock().unwrap().audio.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        drop(h.client_tx);

        tokio::time::timeout(Duration::from_secs(2), h.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let log = h.log.lock().unwrap();
        assert_eq!(log.audio, vec![Bytes::from_static(&[1, 0, 2, 0])]);
        assert!(log.closed);
    }

    #[tokio::test]
    async fn test_model_turn_is_bracketed() {
        let mut h = start(INPUT_SAMPLE_RATE);
        h.model_tx
            .send(GenericServerEvent::OutputTranscription {
                text: "Your ALT".into(),
                is_final: false,
            })
            .unwrap();
        h.model_tx
            .send(GenericServerEvent::AudioChunk(Bytes::from_static(&[9, 9])))
            .unwrap();
        h.model_tx.send(GenericServerEvent::TurnComplete).unwrap();

        let transcript = next_json(&mut h.frames).await;
        assert_eq!(transcript["type"], "transcription");
        assert_eq!(transcript["source"], "agent");
        assert_eq!(next_json(&mut h.frames).await["type"], "audio_start");
        assert_eq!(
            next_frame(&mut h.frames).await,
            Frame::Binary(Bytes::from_static(&[9, 9]))
        );
        let end = next_json(&mut h.frames).await;
        assert_eq!(end["type"], "audio_end");
        assert_eq!(end["interrupted"], false);
    }

    #[tokio::test]
    async fn test_stop_discards_rest_of_model_turn() {
        let mut h = start(INPUT_SAMPLE_RATE);
        h.model_tx
            .send(GenericServerEvent::AudioChunk(Bytes::from_static(&[1, 1])))
            .unwrap();
        assert_eq!(next_json(&mut h.frames).await["type"], "audio_start");
        assert_eq!(
            next_frame(&mut h.frames).await,
            Frame::Binary(Bytes::from_static(&[1, 1]))
        );

        h.client_tx
            .send(Ok(Message::Text(json!({"type": "stop"}).to_string().into())))
            .unwrap();
        let stopped = next_json(&mut h.frames).await;
        assert_eq!(stopped["status"], "stopped");
        assert_eq!(stopped["cleared"], 0);
        let end = next_json(&mut h.frames).await;
        assert_eq!(end["type"], "audio_end");
        assert_eq!(end["interrupted"], true);

        // rest of the stopped turn, then a fresh one
        for event in [
            GenericServerEvent::AudioChunk(Bytes::from_static(&[2, 2])),
            GenericServerEvent::TurnComplete,
            GenericServerEvent::AudioChunk(Bytes::from_static(&[3, 3])),
            GenericServerEvent::TurnComplete,
        ] {
            h.model_tx.send(event).unwrap();
        }
        assert_eq!(next_json(&mut h.frames).await["type"], "audio_start");
        assert_eq!(
            next_frame(&mut h.frames).await,
            Frame::Binary(Bytes::from_static(&[3, 3]))
        );
        assert_eq!(next_json(&mut h.frames).await["interrupted"], false);
    }

    #[tokio::test]
    async fn test_tool_calls_are_answered() {
        let mut h = start(INPUT_SAMPLE_RATE);
        h.model_tx
            .send(GenericServerEvent::ToolCall(vec![ToolCall {
                id: "call-1".into(),
                name: "get_patient_labs".into(),
                arguments: json!({"patient_id": "someone-else"}),
            }]))
            .unwrap();

        let started = next_json(&mut h.frames).await;
        assert_eq!(started["type"], "tool_call");
        assert_eq!(started["status"], "started");
        assert_eq!(next_json(&mut h.frames).await["status"], "completed");

        tokio::time::sleep(Duration::from_millis(20)).await;
        let log = h.log.lock().unwrap();
        assert_eq!(log.tool_responses.len(), 1);
        assert_eq!(log.tool_responses[0].call_id, "call-1");
        assert_eq!(log.tool_responses[0].result.to_value()["patient"], "P0001");
    }

    #[tokio::test]
    async fn test_invalid_json_keeps_session_open() {
        let mut h = start(INPUT_SAMPLE_RATE);
        h.client_tx
            .send(Ok(Message::Text("not json".into())))
            .unwrap();
        let error = next_json(&mut h.frames).await;
        assert_eq!(error["error_code"], "invalid_message");
        assert!(!h.handle.is_finished());
    }

    #[tokio::test]
    async fn test_model_close_ends_session() {
        let h = start(INPUT_SAMPLE_RATE);
        h.model_tx.send(GenericServerEvent::Closed).unwrap();
        tokio::time::timeout(Duration::from_secs(2), h.handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(h.log.lock().unwrap().closed);
    }
}
