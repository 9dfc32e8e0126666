//! Patient record storage.
//!
//! Records live in an object store keyed by slash-separated paths. This
//! module defines the store abstraction, a filesystem and an in-memory
//! implementation, and [`PatientRecords`], which knows where each patient
//! artefact lives and how to assemble the model's context from them.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    path::{Component, Path, PathBuf},
    sync::{Arc, RwLock},
};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Invalid object path: {0}")]
    InvalidPath(String),
    #[error("Object {0} is not valid UTF-8")]
    NotUtf8(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn read_bytes(&self, path: &str) -> Result<Bytes, StoreError>;

    async fn write_bytes(&self, path: &str, data: Bytes) -> Result<(), StoreError>;

    async fn read_string(&self, path: &str) -> Result<String, StoreError> {
        let bytes = self.read_bytes(path).await?;
        String::from_utf8(bytes.to_vec()).map_err(|_| StoreError::NotUtf8(path.to_string()))
    }

    async fn write_string(&self, path: &str, content: &str) -> Result<(), StoreError> {
        self.write_bytes(path, Bytes::copy_from_slice(content.as_bytes()))
            .await
    }

    async fn exists(&self, path: &str) -> bool {
        self.read_bytes(path).await.is_ok()
    }
}

/// An object store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if path.trim().is_empty() || escapes {
            return Err(StoreError::InvalidPath(path.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn read_bytes(&self, path: &str) -> Result<Bytes, StoreError> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(path.to_string()))
            }
            Err(source) => Err(StoreError::Io {
                path: path.to_string(),
                source,
            }),
        }
    }

    async fn write_bytes(&self, path: &str, data: Bytes) -> Result<(), StoreError> {
        let full = self.resolve(path)?;
        let io_err = |source| StoreError::Io {
            path: path.to_string(),
            source,
        };
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        tokio::fs::write(&full, &data).await.map_err(io_err)
    }
}

/// A process-local object store, used in tests and local development.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an object, replacing any previous value.
    pub fn insert(&self, path: &str, content: impl Into<Bytes>) {
        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.to_string(), content.into());
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn read_bytes(&self, path: &str) -> Result<Bytes, StoreError> {
        self.objects
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(path.to_string()))
    }

    async fn write_bytes(&self, path: &str, data: Bytes) -> Result<(), StoreError> {
        self.insert(path, data);
        Ok(())
    }
}

/// Named record sources loaded into a patient's context, with their
/// location relative to the patient's directory.
const CONTEXT_SOURCES: &[(&str, &str)] = &[
    ("patient_profile", "patient_profile.txt"),
    ("basic_info", "basic_info.json"),
    ("encounters", "board_items/encounters.json"),
    ("patient_context", "board_items/patient_context.json"),
    ("lab_track", "board_items/dashboard_lab_track.json"),
    ("medication_track", "board_items/dashboard_medication_track.json"),
    ("risk_events", "board_items/dashboard_risk_event_track.json"),
    ("referral", "board_items/referral.json"),
];

/// The record snapshot a conversational agent works from.
#[derive(Debug, Clone, PartialEq)]
pub struct PatientContext {
    pub patient_id: String,
    pub retrieved_at: DateTime<Utc>,
    /// Source name to content; `None` when the source is missing.
    pub data: BTreeMap<String, Option<Value>>,
}

impl PatientContext {
    pub fn empty(patient_id: &str) -> Self {
        Self {
            patient_id: patient_id.to_string(),
            retrieved_at: Utc::now(),
            data: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key).and_then(Option::as_ref)
    }

    pub fn is_empty(&self) -> bool {
        self.data.values().all(Option::is_none)
    }

    /// Renders the context block prepended to each user question.
    pub fn to_prompt(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        let mut out = String::from("=== PATIENT CONTEXT ===\n");
        if let Some(profile) = self.get("patient_profile") {
            out.push_str(&format!("## Patient Profile\n{}\n", display_value(profile)));
        }
        if let Some(summary) = self.get("patient_context") {
            let pretty = serde_json::to_string_pretty(summary).unwrap_or_default();
            out.push_str(&format!("## Clinical Summary\n{}\n", pretty));
        }
        let medications = self
            .get("medication_track")
            .and_then(|m| m.get("medications"))
            .and_then(Value::as_array)
            .filter(|meds| !meds.is_empty());
        if let Some(meds) = medications {
            out.push_str(&format!("## Current Medications ({} total)\n", meds.len()));
            for med in meds.iter().take(5) {
                out.push_str(&format!(
                    "- {}: {}\n",
                    med.get("name").map(display_value).unwrap_or_default(),
                    med.get("dose").map(display_value).unwrap_or_default()
                ));
            }
        }
        out.push_str("\n=== END CONTEXT ===\n");
        out
    }

    /// A short digest used in the voice system instruction.
    pub fn summary(&self, max_chars: usize) -> String {
        let mut out = String::new();
        for key in ["patient_profile", "basic_info", "patient_context"] {
            if let Some(value) = self.get(key) {
                let text: String = display_value(value).chars().take(max_chars).collect();
                out.push_str(&format!("{}: {}\n", key, text));
            }
        }
        out
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Knows the storage layout of patient artefacts.
#[derive(Clone)]
pub struct PatientRecords {
    store: Arc<dyn ObjectStore>,
}

impl PatientRecords {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn path(patient_id: &str, relative: &str) -> String {
        format!("patient_data/{}/{}", patient_id, relative)
    }

    pub async fn read_text(&self, patient_id: &str, relative: &str) -> Result<String, StoreError> {
        self.store
            .read_string(&Self::path(patient_id, relative))
            .await
    }

    /// Reads a JSON record; `Ok(None)` when the record does not exist.
    pub async fn read_json(
        &self,
        patient_id: &str,
        relative: &str,
    ) -> anyhow::Result<Option<Value>> {
        match self.read_text(patient_id, relative).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_json(
        &self,
        patient_id: &str,
        relative: &str,
        value: &Value,
    ) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        self.store
            .write_string(&Self::path(patient_id, relative), &content)
            .await?;
        Ok(())
    }

    /// Loads every context source; missing or unreadable sources are `None`.
    pub async fn load_context(&self, patient_id: &str) -> PatientContext {
        let mut context = PatientContext::empty(patient_id);
        for (key, relative) in CONTEXT_SOURCES {
            let value = match self.read_text(patient_id, relative).await {
                Ok(text) => Some(
                    serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text)),
                ),
                Err(StoreError::NotFound(_)) => None,
                Err(e) => {
                    warn!(%patient_id, source = key, error = %e, "Could not read context source");
                    None
                }
            };
            context.data.insert(key.to_string(), value);
        }
        info!(
            %patient_id,
            loaded = context.data.values().filter(|v| v.is_some()).count(),
            "Loaded patient context"
        );
        context
    }
}
