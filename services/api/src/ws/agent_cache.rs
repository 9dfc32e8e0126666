//! Per-patient chat agents, kept in a bounded least-recently-used cache.

use medforce_core::{agent::PatientAgent, records::PatientRecords};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, info};

struct Entry {
    agent: Arc<PatientAgent>,
    last_used: u64,
}

#[derive(Default)]
struct Slots {
    entries: HashMap<String, Entry>,
    clock: u64,
}

pub struct AgentCache {
    capacity: usize,
    system_prompt: String,
    slots: Mutex<Slots>,
}

impl AgentCache {
    pub fn new(capacity: usize, system_prompt: impl Into<String>) -> Self {
        Self {
            capacity: capacity.max(1),
            system_prompt: system_prompt.into(),
            slots: Mutex::new(Slots::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, patient_id: &str) -> Option<Arc<PatientAgent>> {
        let mut slots = self.lock();
        slots.clock += 1;
        let now = slots.clock;
        slots.entries.get_mut(patient_id).map(|entry| {
            entry.last_used = now;
            entry.agent.clone()
        })
    }

    /// Returns the patient's agent, loading its context on first use.
    ///
    /// Every session of a patient gets the same agent, so they share one
    /// conversation history.
    pub async fn get_or_load(&self, patient_id: &str, records: &PatientRecords) -> Arc<PatientAgent> {
        if let Some(agent) = self.lookup(patient_id) {
            return agent;
        }

        let loaded = Arc::new(PatientAgent::load(patient_id, &self.system_prompt, records).await);

        let mut slots = self.lock();
        slots.clock += 1;
        let now = slots.clock;
        // another session may have loaded the same patient meanwhile
        if let Some(entry) = slots.entries.get_mut(patient_id) {
            entry.last_used = now;
            return entry.agent.clone();
        }
        if slots.entries.len() >= self.capacity {
            let oldest = slots
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                slots.entries.remove(&oldest);
                debug!(patient_id = %oldest, "Evicted least recently used agent");
            }
        }
        slots.entries.insert(
            patient_id.to_string(),
            Entry {
                agent: loaded.clone(),
                last_used: now,
            },
        );
        info!(%patient_id, cached = slots.entries.len(), "Created patient agent");
        loaded
    }

    /// Drops the cached agent so the next request starts a fresh history.
    pub fn evict(&self, patient_id: &str) -> bool {
        self.lock().entries.remove(patient_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medforce_core::records::InMemoryObjectStore;

    fn records() -> PatientRecords {
        let store = InMemoryObjectStore::new();
        store.insert("patient_data/P0001/patient_profile.txt", "Jane Doe, 54");
        PatientRecords::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_same_patient_shares_agent() {
        let cache = AgentCache::new(4, "prompt");
        let records = records();
        let a = cache.get_or_load("P0001", &records).await;
        let b = cache.get_or_load("P0001", &records).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert!(!a.context().is_empty());
    }

    #[tokio::test]
    async fn test_least_recently_used_is_evicted() {
        let cache = AgentCache::new(2, "prompt");
        let records = records();
        let first = cache.get_or_load("P1", &records).await;
        cache.get_or_load("P2", &records).await;
        cache.get_or_load("P1", &records).await;
        cache.get_or_load("P3", &records).await;

        assert_eq!(cache.len(), 2);
        let again = cache.get_or_load("P1", &records).await;
        assert!(Arc::ptr_eq(&first, &again));
        // P2 was the oldest and had to be reloaded
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_evict_forgets_history() {
        let cache = AgentCache::new(2, "prompt");
        let records = records();
        let agent = cache.get_or_load("P0001", &records).await;
        agent.begin_turn().await.record("hi", "hello");

        assert!(cache.evict("P0001"));
        assert!(!cache.evict("P0001"));
        let fresh = cache.get_or_load("P0001", &records).await;
        assert!(fresh.history().await.is_empty());
    }
}
