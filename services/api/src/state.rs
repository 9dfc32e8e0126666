//! Shared Application State

use crate::{config::Config, ws::orchestrator::LiveAgentOrchestrator};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<LiveAgentOrchestrator>,
    pub config: Arc<Config>,
}
