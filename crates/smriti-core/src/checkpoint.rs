//! Session checkpoints
//!
//! Arbitrary JSON state saved per session under `checkpoints/<session-id>/`.
//! Loads walk newest-first and skip unreadable files, so a corrupted newest
//! checkpoint falls back to the next valid one. Saves prune beyond the
//! retention limit.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::config::{HomeLayout, DEFAULT_MAX_CHECKPOINTS};
use crate::error::{MemoryError, Result};

// ============================================================================
// CHECKPOINT STORE
// ============================================================================

/// Store for per-session JSON checkpoints
pub struct CheckpointStore {
    layout: HomeLayout,
    max_checkpoints: usize,
    /// Saves for one session are serialised; loads never take these locks
    save_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CheckpointStore {
    pub fn new(layout: HomeLayout) -> Self {
        Self::with_retention(layout, DEFAULT_MAX_CHECKPOINTS)
    }

    pub fn with_retention(layout: HomeLayout, max_checkpoints: usize) -> Self {
        Self {
            layout,
            max_checkpoints: max_checkpoints.max(1),
            save_locks: Mutex::new(HashMap::new()),
        }
    }

    fn save_lock(&self, session_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .save_locks
            .lock()
            .map_err(|_| MemoryError::lock("checkpoint registry"))?;
        Ok(locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Checkpoint files for a session, newest first
    fn files_newest_first(&self, session_id: &str) -> Result<Vec<PathBuf>> {
        let dir = self.layout.checkpoints_dir(session_id);
        let mut files = Vec::new();
        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().is_some_and(|e| e == "json") {
                        files.push(path);
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        // File names sort chronologically: zero-padded millis plus sequence
        files.sort();
        files.reverse();
        Ok(files)
    }

    /// Save a checkpoint; prunes past the retention limit
    pub fn save(&self, session_id: &str, data: &serde_json::Value) -> Result<PathBuf> {
        let lock = self.save_lock(session_id)?;
        let _guard = lock.lock().map_err(|_| MemoryError::lock("checkpoint save"))?;

        let dir = self.layout.checkpoints_dir(session_id);
        std::fs::create_dir_all(&dir)?;

        let millis = Utc::now().timestamp_millis().max(0);
        let existing = self.files_newest_first(session_id)?;
        // Sequence suffix keeps same-millisecond saves distinct and ordered
        let path = (0..1000)
            .map(|seq| dir.join(format!("{millis:016}-{seq:03}.json")))
            .find(|p| !p.exists())
            .ok_or_else(|| {
                MemoryError::Invariant("checkpoint sequence exhausted".to_string())
            })?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(data)?)?;
        std::fs::rename(&tmp, &path)?;

        // Prune oldest beyond the retention limit (the new file counts)
        let keep = self.max_checkpoints.saturating_sub(1);
        for old in existing.iter().skip(keep) {
            if let Err(e) = std::fs::remove_file(old) {
                tracing::warn!(path = %old.display(), error = %e, "failed to prune checkpoint");
            }
        }

        Ok(path)
    }

    /// Load the most recent valid checkpoint
    ///
    /// Unreadable files are skipped with a warning; `NotFound` only when no
    /// valid checkpoint exists at all.
    pub fn load(&self, session_id: &str) -> Result<serde_json::Value> {
        for path in self.files_newest_first(session_id)? {
            match std::fs::read_to_string(&path) {
                Ok(text) => match serde_json::from_str(&text) {
                    Ok(value) => return Ok(value),
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "skipping corrupt checkpoint"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint");
                }
            }
        }
        Err(MemoryError::NotFound(format!(
            "no valid checkpoint for session {session_id}"
        )))
    }

    /// Number of checkpoints currently retained
    pub fn count(&self, session_id: &str) -> Result<usize> {
        Ok(self.files_newest_first(session_id)?.len())
    }
}

// ============================================================================
// TESTS
// ============================================================================
