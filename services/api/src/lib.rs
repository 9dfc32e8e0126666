//! MedForce API Library Crate
//!
//! Everything the web service is made of: configuration, shared state, the
//! REST handlers, the WebSocket channels and routing. The `api` binary is a
//! thin wrapper that wires concrete collaborators into this library.

pub mod audio_utils;
pub mod config;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
