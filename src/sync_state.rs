use crate::error::SyncError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// What the last pass knew about one linked task, keyed by its Todoist id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SyncedTaskRecord {
    pub remote_id: String,
    pub file_path: String,
    pub line_index: usize,
    /// Empty until a full pass has compared the task.
    #[serde(default)]
    pub fingerprint: String,
    pub last_synced_at: DateTime<Utc>,
    pub local_completed: bool,
    pub remote_completed: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(default)]
    pub records: BTreeMap<String, SyncedTaskRecord>,
    #[serde(default)]
    pub last_full_sync_at: Option<DateTime<Utc>>,
}

impl SyncState {
    pub fn record(&self, remote_id: &str) -> Option<&SyncedTaskRecord> {
        self.records.get(remote_id)
    }

    pub fn upsert(&mut self, record: SyncedTaskRecord) {
        self.records.insert(record.remote_id.clone(), record);
    }

    pub fn remove(&mut self, remote_id: &str) -> Option<SyncedTaskRecord> {
        self.records.remove(remote_id)
    }
}

/// JSON file holding the [`SyncState`] between runs.
#[derive(Clone, Debug)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> Result<SyncState, SyncError> {
        if !self.path.exists() {
            return Ok(SyncState::default());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(SyncState::default());
        }
        let state: SyncState = serde_json::from_str(&content).map_err(|e| {
            SyncError::Io(format!("Corrupt sync state {}: {e}", self.path.display()))
        })?;
        Ok(state)
    }

    pub fn save(&self, state: &SyncState) -> Result<(), SyncError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, content)?;
        Ok(())
    }
}
