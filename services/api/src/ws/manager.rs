//! Registry of live sessions, indexed by session id and by patient.

use super::{
    protocol::{AgentMode, ServerMessage},
    session::{FrameSink, Session, SessionState},
};
use crate::models::SessionInfo;
use futures_util::future::join_all;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};
use tracing::{info, warn};
use uuid::Uuid;

/// Both indexes live under one lock so every mutation updates them together.
#[derive(Default)]
struct Registry {
    sessions: HashMap<Uuid, Arc<Session>>,
    by_patient: HashMap<String, HashSet<Uuid>>,
}

/// Outcome of a fan-out to a patient's sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone, Default)]
pub struct ConnectionManager {
    registry: Arc<RwLock<Registry>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a new session for `patient_id` and marks it connected.
    pub fn connect(
        &self,
        sink: Box<dyn FrameSink>,
        patient_id: &str,
        mode: AgentMode,
    ) -> Arc<Session> {
        let session = Arc::new(Session::new(patient_id, mode, sink));
        session.set_state(SessionState::Connected);
        {
            let mut registry = self.write();
            registry.sessions.insert(session.id(), session.clone());
            registry
                .by_patient
                .entry(patient_id.to_string())
                .or_default()
                .insert(session.id());
        }
        info!(session_id = %session.id(), %patient_id, %mode, "Session registered");
        session
    }

    /// Deregisters a session. Returns `false` if it was already gone.
    pub fn disconnect(&self, session_id: Uuid) -> bool {
        let removed = {
            let mut registry = self.write();
            let removed = registry.sessions.remove(&session_id);
            if let Some(session) = &removed {
                let patient_id = session.patient_id();
                if let Some(ids) = registry.by_patient.get_mut(patient_id) {
                    ids.remove(&session_id);
                    if ids.is_empty() {
                        registry.by_patient.remove(patient_id);
                    }
                }
            }
            removed
        };
        match removed {
            Some(session) => {
                session.set_state(SessionState::Disconnecting);
                session.set_state(SessionState::Disconnected);
                info!(%session_id, patient_id = session.patient_id(), "Session deregistered");
                true
            }
            None => false,
        }
    }

    /// Returns a guard that deregisters the session when dropped.
    pub fn guard(&self, session: &Session) -> SessionGuard {
        SessionGuard {
            manager: self.clone(),
            session_id: session.id(),
        }
    }

    pub fn session(&self, session_id: Uuid) -> Option<Arc<Session>> {
        self.read().sessions.get(&session_id).cloned()
    }

    pub fn get_patient_sessions(&self, patient_id: &str) -> Vec<Arc<Session>> {
        let registry = self.read();
        registry
            .by_patient
            .get(patient_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| registry.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Sends `message` to every session of `patient_id`. A failed send is
    /// logged and counted but does not stop delivery to the others.
    pub async fn broadcast_to_patient(
        &self,
        patient_id: &str,
        message: ServerMessage,
    ) -> BroadcastReport {
        let sessions = self.get_patient_sessions(patient_id);
        let results = join_all(sessions.iter().map(|session| {
            let message = message.clone();
            async move { (session.id(), session.send(message).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (session_id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(%session_id, %patient_id, error = %e, "Broadcast delivery failed");
                    report.failed += 1;
                }
            }
        }
        info!(%patient_id, delivered = report.delivered, failed = report.failed, "Broadcast finished");
        report
    }

    pub fn sessions_info(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.read().sessions.values().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.connected_at);
        infos
    }

    pub fn len(&self) -> usize {
        self.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let registry = self.read();
        let indexed: usize = registry.by_patient.values().map(HashSet::len).sum();
        indexed == registry.sessions.len()
            && registry.by_patient.iter().all(|(patient, ids)| {
                !ids.is_empty()
                    && ids.iter().all(|id| {
                        registry
                            .sessions
                            .get(id)
                            .is_some_and(|s| s.patient_id() == patient)
                    })
            })
    }
}

/// Deregisters its session on drop, whichever way the owning task ends.
pub struct SessionGuard {
    manager: ConnectionManager,
    session_id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.manager.disconnect(self.session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::session::{
        Frame,
        testing::{ChannelSink, FailingSink, json},
    };
    use tokio::sync::mpsc;

    fn channel() -> (Box<dyn FrameSink>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Box::new(ChannelSink(tx)), rx)
    }

    #[test]
    fn test_connect_disconnect_keeps_indexes_consistent() {
        let manager = ConnectionManager::new();
        let mut ids = Vec::new();
        for (i, patient) in ["P1", "P2", "P1", "P3", "P1"].iter().enumerate() {
            let (sink, _rx) = channel();
            ids.push(manager.connect(sink, patient, AgentMode::Chat).id());
            assert!(manager.is_consistent(), "after connect {i}");
        }
        assert_eq!(manager.get_patient_sessions("P1").len(), 3);

        for id in [ids[0], ids[3], ids[0], ids[4]] {
            manager.disconnect(id);
            assert!(manager.is_consistent());
        }
        assert_eq!(manager.get_patient_sessions("P1").len(), 1);
        assert!(manager.get_patient_sessions("P3").is_empty());
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let manager = ConnectionManager::new();
        let (sink, _rx) = channel();
        let session = manager.connect(sink, "P1", AgentMode::Chat);
        assert_eq!(session.state(), SessionState::Connected);

        assert!(manager.disconnect(session.id()));
        assert!(!manager.disconnect(session.id()));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_guard_deregisters_on_drop() {
        let manager = ConnectionManager::new();
        let (sink, _rx) = channel();
        let session = manager.connect(sink, "P1", AgentMode::Voice);
        {
            let _guard = manager.guard(&session);
            assert!(manager.session(session.id()).is_some());
        }
        assert!(manager.session(session.id()).is_none());
        assert!(manager.is_consistent());
    }

    #[test]
    fn test_idle_session_closes_through_disconnecting() {
        let manager = ConnectionManager::new();
        let (sink, _rx) = channel();
        let session = manager.connect(sink, "P1", AgentMode::Chat);
        session.begin_processing();
        session.finish_processing();
        assert_eq!(session.state(), SessionState::Idle);

        // Idle -> Disconnected is refused; the manager must step through Disconnecting
        assert!(!session.set_state(SessionState::Disconnected));
        drop(manager.guard(&session));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[tokio::test]
    async fn test_broadcast_isolates_failures() {
        let manager = ConnectionManager::new();
        let (sink_a, mut rx_a) = channel();
        let (sink_b, mut rx_b) = channel();
        manager.connect(sink_a, "P0001", AgentMode::Chat);
        manager.connect(Box::new(FailingSink), "P0001", AgentMode::Chat);
        manager.connect(sink_b, "P0001", AgentMode::Intake);
        let (sink_other, mut rx_other) = channel();
        manager.connect(sink_other, "P0002", AgentMode::Chat);

        let report = manager
            .broadcast_to_patient("P0001", ServerMessage::notification("Results are in"))
            .await;
        assert_eq!(report, BroadcastReport { delivered: 2, failed: 1 });

        for rx in [&mut rx_a, &mut rx_b] {
            let frame = json(rx.recv().await.unwrap());
            assert_eq!(frame["content"], "Results are in");
            assert_eq!(frame["broadcast"], true);
            assert!(rx.try_recv().is_err());
        }
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_patient_is_empty() {
        let manager = ConnectionManager::new();
        let report = manager
            .broadcast_to_patient("nobody", ServerMessage::notification("x"))
            .await;
        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_concurrent_connects_and_disconnects() {
        let manager = ConnectionManager::new();
        let mut handles = Vec::new();
        for i in 0..32 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                let (tx, _rx) = mpsc::unbounded_channel();
                let patient = format!("P{}", i % 4);
                let session = manager.connect(Box::new(ChannelSink(tx)), &patient, AgentMode::Chat);
                tokio::task::yield_now().await;
                if i % 2 == 0 {
                    manager.disconnect(session.id());
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(manager.len(), 16);
        assert!(manager.is_consistent());
    }
}
