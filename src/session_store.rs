//! Atomic persistence of `WorkflowState`.
//!
//! Grounded directly on `original_source/aiwf/domain/persistence/session_store.py::save`
//! (temp-file write + `Path.replace`) and on the pack's clearest Rust analog,
//! `metjm-planning-agent/src/state.rs::save_atomic` (write to `<path>.tmp`, then
//! `fs::rename`).

use std::path::PathBuf;

use anyhow::Context;

use crate::errors::EngineError;
use crate::layout::session_json_file;
use crate::model::WorkflowState;

pub struct SessionStore {
    sessions_root: PathBuf,
}

impl SessionStore {
    pub fn new(sessions_root: PathBuf) -> Self {
        SessionStore { sessions_root }
    }

    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_root.join(session_id)
    }

    /// Stamps `updated_at` and atomically writes the snapshot to
    /// `<session_dir>/session.json`, returning the final path.
    pub fn save(&self, state: &mut WorkflowState) -> Result<PathBuf, EngineError> {
        state.updated_at = chrono::Utc::now();

        let session_dir = self.session_dir(&state.session_id);
        std::fs::create_dir_all(&session_dir)
            .with_context(|| format!("failed to create session directory {}", session_dir.display()))?;

        let session_file = session_json_file(&session_dir);
        let temp_file = session_file.with_extension("json.tmp");

        let json = serde_json::to_string_pretty(state).context("failed to serialize workflow state")?;
        std::fs::write(&temp_file, json)
            .with_context(|| format!("failed to write {}", temp_file.display()))?;
        std::fs::rename(&temp_file, &session_file)
            .with_context(|| format!("failed to rename {} to {}", temp_file.display(), session_file.display()))?;

        Ok(session_file)
    }

    pub fn load(&self, session_id: &str) -> Result<WorkflowState, EngineError> {
        let session_file = session_json_file(&self.session_dir(session_id));
        if !session_file.exists() {
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        }

        let content = std::fs::read_to_string(&session_file)
            .with_context(|| format!("failed to read {}", session_file.display()))?;
        serde_json::from_str(&content)
            .map_err(|e| EngineError::InvalidSessionData(format!("{session_id}: {e}")))
    }

    pub fn exists(&self, session_id: &str) -> bool {
        session_json_file(&self.session_dir(session_id)).exists()
    }

    /// Sorted session ids with a readable `session.json`.
    pub fn list(&self) -> Result<Vec<String>, EngineError> {
        if !self.sessions_root.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let entries = std::fs::read_dir(&self.sessions_root)
            .with_context(|| format!("failed to read {}", self.sessions_root.display()))?;
        for entry in entries {
            let entry = entry.context("failed to read directory entry")?;
            if !entry.path().is_dir() {
                continue;
            }
            if session_json_file(&entry.path()).exists() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    pub fn delete(&self, session_id: &str) -> Result<(), EngineError> {
        let session_dir = self.session_dir(session_id);
        if !session_dir.exists() {
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        }
        std::fs::remove_dir_all(&session_dir)
            .with_context(|| format!("failed to remove {}", session_dir.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn sample_state(id: &str) -> WorkflowState {
        WorkflowState::new(id.to_string(), "echo".to_string(), HashMap::new())
    }

    #[test]
    fn save_then_load_round_trips_every_field() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let mut state = sample_state("abc");
        store.save(&mut state).unwrap();

        let loaded = store.load("abc").unwrap();
        assert_eq!(loaded.session_id, state.session_id);
        assert_eq!(loaded.phase, state.phase);
        assert_eq!(loaded.current_iteration, state.current_iteration);
        assert_eq!(loaded.phase_history.len(), state.phase_history.len());
    }

    #[test]
    fn save_writes_no_leftover_temp_file() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let mut state = sample_state("abc");
        store.save(&mut state).unwrap();

        let temp = store.session_dir("abc").join("session.json.tmp");
        assert!(!temp.exists());
        assert!(store.exists("abc"));
    }

    #[test]
    fn load_missing_session_is_session_not_found() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let err = store.load("nope").unwrap_err();
        assert!(matches!(err, EngineError::SessionNotFound(_)));
    }

    #[test]
    fn load_corrupt_json_is_invalid_session_data() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let session_dir = store.session_dir("bad");
        std::fs::create_dir_all(&session_dir).unwrap();
        std::fs::write(session_json_file(&session_dir), "{ not json").unwrap();

        let err = store.load("bad").unwrap_err();
        assert!(matches!(err, EngineError::InvalidSessionData(_)));
    }

    #[test]
    fn list_returns_sorted_session_ids() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        for id in ["zeta", "alpha", "mike"] {
            let mut state = sample_state(id);
            store.save(&mut state).unwrap();
        }
        assert_eq!(store.list().unwrap(), vec!["alpha", "mike", "zeta"]);
    }

    #[test]
    fn list_on_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("does-not-exist"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn delete_removes_session_directory() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        let mut state = sample_state("abc");
        store.save(&mut state).unwrap();
        store.delete("abc").unwrap();
        assert!(!store.exists("abc"));
    }

    #[test]
    fn delete_missing_session_errors() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().to_path_buf());
        assert!(store.delete("nope").is_err());
    }
}
