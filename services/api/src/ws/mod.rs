//! WebSocket Session Management
//!
//! Real-time patient channels over WebSockets:
//!
//! - `protocol`: JSON message format between client and server.
//! - `session`: one live connection, its state and its outbound writes.
//! - `manager`: registry of live sessions by id and by patient.
//! - `responder`: model turns rendered as text or streamed chunks.
//! - `voice` / `playback`: the full-duplex audio channel.
//! - `orchestrator`: per-connection dispatch for each channel mode.

pub mod agent_cache;
pub mod manager;
pub mod orchestrator;
pub mod playback;
pub mod protocol;
pub mod responder;
pub mod session;
pub mod voice;

pub use orchestrator::{chat_ws_handler, intake_ws_handler, voice_ws_handler};
