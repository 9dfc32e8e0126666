//! One live client connection and its bookkeeping.

use super::protocol::{AgentMode, ErrorCode, OutboundFrame, ServerMessage};
use crate::models::SessionInfo;
use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, stream::SplitSink};
use serde::{Deserialize, Serialize};
use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session {0} is closed")]
    Closed(Uuid),
    #[error("Transport write failed: {0}")]
    Transport(String),
    #[error("Failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Lifecycle of a session. `Disconnected` is terminal and only follows
/// `Disconnecting`.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Connected,
    Processing,
    Idle,
    Disconnecting,
    Disconnected,
}

/// A unit written to the client transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

/// The write half of a client transport.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), SessionError>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), SessionError>;
}

#[async_trait]
impl FrameSink for SplitSink<WebSocket, Message> {
    async fn send_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data),
        };
        self.send(message)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), SessionError> {
        let frame = CloseFrame {
            code,
            reason: reason.to_string().into(),
        };
        self.send(Message::Close(Some(frame)))
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))
    }
}

struct Activity {
    state: SessionState,
    last_activity: DateTime<Utc>,
}

pub struct Session {
    id: Uuid,
    patient_id: String,
    mode: AgentMode,
    connected_at: DateTime<Utc>,
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    activity: Mutex<Activity>,
    message_count: AtomicU64,
}

impl Session {
    pub fn new(patient_id: impl Into<String>, mode: AgentMode, sink: Box<dyn FrameSink>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            patient_id: patient_id.into(),
            mode,
            connected_at: now,
            sink: tokio::sync::Mutex::new(sink),
            activity: Mutex::new(Activity {
                state: SessionState::Connecting,
                last_activity: now,
            }),
            message_count: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn mode(&self) -> AgentMode {
        self.mode
    }

    fn activity(&self) -> std::sync::MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SessionState {
        self.activity().state
    }

    /// Moves to `state`. Refused once disconnected, and `Disconnected` is
    /// only reachable from `Disconnecting`.
    pub fn set_state(&self, state: SessionState) -> bool {
        let mut activity = self.activity();
        match (activity.state, state) {
            (SessionState::Disconnected, _) => return false,
            (from, SessionState::Disconnected) if from != SessionState::Disconnecting => {
                return false;
            }
            _ => {}
        }
        activity.state = state;
        true
    }

    /// Records an inbound message and enters `Processing`.
    pub fn begin_processing(&self) {
        self.message_count.fetch_add(1, Ordering::Relaxed);
        let mut activity = self.activity();
        activity.last_activity = Utc::now();
        if matches!(activity.state, SessionState::Connected | SessionState::Idle) {
            activity.state = SessionState::Processing;
        }
    }

    pub fn finish_processing(&self) {
        let mut activity = self.activity();
        if activity.state == SessionState::Processing {
            activity.state = SessionState::Idle;
        }
    }

    fn touch(&self) {
        self.activity().last_activity = Utc::now();
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    async fn write(&self, frame: Frame) -> Result<(), SessionError> {
        if self.state() == SessionState::Disconnected {
            return Err(SessionError::Closed(self.id));
        }
        self.sink.lock().await.send_frame(frame).await?;
        self.touch();
        Ok(())
    }

    /// Serialises and writes one protocol message.
    pub async fn send(&self, message: ServerMessage) -> Result<(), SessionError> {
        let frame = OutboundFrame {
            message: &message,
            timestamp: Utc::now(),
            session_id: self.id,
        };
        let text = serde_json::to_string(&frame)?;
        debug!(session_id = %self.id, kind = message.kind(), "Sending frame");
        self.write(Frame::Text(text)).await
    }

    pub async fn send_typing(&self, is_typing: bool) -> Result<(), SessionError> {
        self.send(ServerMessage::Typing { is_typing }).await
    }

    pub async fn send_error(
        &self,
        error: impl Into<String>,
        code: Option<ErrorCode>,
    ) -> Result<(), SessionError> {
        self.send(ServerMessage::Error {
            error: error.into(),
            error_code: code,
        })
        .await
    }

    /// Writes raw audio as a binary frame.
    pub async fn send_audio(&self, pcm: Bytes) -> Result<(), SessionError> {
        self.write(Frame::Binary(pcm)).await
    }

    pub async fn close(&self, code: u16, reason: &str) -> Result<(), SessionError> {
        self.set_state(SessionState::Disconnecting);
        self.sink.lock().await.close(code, reason).await
    }

    pub fn info(&self) -> SessionInfo {
        let activity = self.activity();
        let duration = Utc::now() - self.connected_at;
        SessionInfo {
            session_id: self.id,
            patient_id: self.patient_id.clone(),
            mode: self.mode,
            state: activity.state,
            connected_at: self.connected_at,
            last_activity: activity.last_activity,
            message_count: self.message_count(),
            duration_seconds: duration.num_milliseconds() as f64 / 1000.0,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use tokio::sync::mpsc;

    /// Forwards every frame into a channel.
    pub struct ChannelSink(pub mpsc::UnboundedSender<Frame>);

    #[async_trait]
    impl FrameSink for ChannelSink {
        async fn send_frame(&mut self, frame: Frame) -> Result<(), SessionError> {
            self.0
                .send(frame)
                .map_err(|e| SessionError::Transport(e.to_string()))
        }

        async fn close(&mut self, _code: u16, _reason: &str) -> Result<(), SessionError> {
            Ok(())
        }
    }

    /// A transport whose every write fails.
    pub struct FailingSink;

    #[async_trait]
    impl FrameSink for FailingSink {
        async fn send_frame(&mut self, _frame: Frame) -> Result<(), SessionError> {
            Err(SessionError::Transport("connection reset".into()))
        }

        async fn close(&mut self, _code: u16, _reason: &str) -> Result<(), SessionError> {
            Err(SessionError::Transport("connection reset".into()))
        }
    }

    pub fn channel_session(patient_id: &str) -> (Session, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Session::new(patient_id, AgentMode::Chat, Box::new(ChannelSink(tx))),
            rx,
        )
    }

    /// Parses a text frame back into JSON.
    pub fn json(frame: Frame) -> serde_json::Value {
        match frame {
            Frame::Text(text) => serde_json::from_str(&text).unwrap(),
            Frame::Binary(_) => panic!("expected a text frame"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_send_stamps_frame_and_updates_activity() {
        let (session, mut rx) = channel_session("P0001");
        session.set_state(SessionState::Connected);
        let before = session.info().last_activity;

        session.send_typing(true).await.unwrap();

        let frame = json(rx.recv().await.unwrap());
        assert_eq!(frame["type"], "typing");
        assert_eq!(frame["is_typing"], true);
        assert_eq!(frame["session_id"], session.id().to_string());
        assert!(session.info().last_activity >= before);
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (session, _rx) = channel_session("P0001");
        assert_eq!(session.state(), SessionState::Connecting);
        session.set_state(SessionState::Connected);

        session.begin_processing();
        assert_eq!(session.state(), SessionState::Processing);
        assert_eq!(session.message_count(), 1);
        session.finish_processing();
        assert_eq!(session.state(), SessionState::Idle);

        assert!(!session.set_state(SessionState::Disconnected));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.set_state(SessionState::Disconnecting));
        assert!(session.set_state(SessionState::Disconnected));
        assert!(!session.set_state(SessionState::Connected));
        session.begin_processing();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnected_session_rejects_sends() {
        let (session, _rx) = channel_session("P0001");
        session.set_state(SessionState::Disconnecting);
        session.set_state(SessionState::Disconnected);
        assert!(matches!(
            session.send_typing(false).await,
            Err(SessionError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_propagates() {
        let session = Session::new("P0001", AgentMode::Chat, Box::new(FailingSink));
        session.set_state(SessionState::Connected);
        assert!(matches!(
            session.send_error("x", Some(ErrorCode::ProcessingFailed)).await,
            Err(SessionError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_audio_goes_out_as_binary() {
        let (session, mut rx) = channel_session("P0001");
        session.set_state(SessionState::Connected);
        session
            .send_audio(Bytes::from_static(&[1, 2, 3, 4]))
            .await
            .unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            Frame::Binary(Bytes::from_static(&[1, 2, 3, 4]))
        );
    }
}
