//! Home layout and shared limits
//!
//! Everything the core persists lives under a single root directory ("home").
//! Component-specific tunables live next to their component; this module only
//! holds the filesystem layout and system-wide ceilings.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::error::{MemoryError, Result};

// ============================================================================
// SYSTEM CEILINGS
// ============================================================================

/// Maximum size of a scope memory file before oldest entries are truncated
pub const MAX_MEMORY_SIZE: usize = 500 * 1024;

/// Maximum checkpoints retained per session
pub const DEFAULT_MAX_CHECKPOINTS: usize = 10;

/// Ceiling on configurable half-lives (ten years, in seconds)
pub const MAX_HALF_LIFE_SECS: f64 = 10.0 * 365.25 * 86_400.0;

/// Floor on configurable half-lives (one second)
pub const MIN_HALF_LIFE_SECS: f64 = 1.0;

// ============================================================================
// HOME LAYOUT
// ============================================================================

/// Filesystem layout under the home root
///
/// ```text
/// home/
///   sessions/YYYY/MM/session-YYYY-MM-DD-<suffix>.md
///   days/YYYY/MM/DD.md
///   months/YYYY/MM.md            years/YYYY.md
///   memory/global.md             memory/projects/<hash>/project.md
///   memory/agents/<id>.md        checkpoints/<session-id>/
///   agent.db  graph.db  vectors.db
/// ```
#[derive(Debug, Clone)]
pub struct HomeLayout {
    root: PathBuf,
}

impl HomeLayout {
    /// Use an explicit root directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the platform default home (`~/.local/share/smriti` on Linux)
    pub fn default_home() -> Result<Self> {
        let proj_dirs = directories::ProjectDirs::from("ai", "smriti", "smriti").ok_or_else(
            || MemoryError::Invariant("could not determine a home directory".to_string()),
        )?;
        Ok(Self::new(proj_dirs.data_dir()))
    }

    /// The home root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Relational index for sessions, turns, and consolidation state
    pub fn agent_db(&self) -> PathBuf {
        self.root.join("agent.db")
    }

    /// Bi-temporal knowledge graph database
    pub fn graph_db(&self) -> PathBuf {
        self.root.join("graph.db")
    }

    /// Embedding vector database
    pub fn vectors_db(&self) -> PathBuf {
        self.root.join("vectors.db")
    }

    /// Directory holding a session file created on `date`
    pub fn sessions_dir(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join("sessions")
            .join(format!("{}", date.format("%Y")))
            .join(format!("{}", date.format("%m")))
    }

    /// Full path for a session file
    pub fn session_file(&self, session_id: &str, date: NaiveDate) -> PathBuf {
        self.sessions_dir(date).join(format!("{session_id}.md"))
    }

    /// Daily consolidation file
    pub fn day_file(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join("days")
            .join(format!("{}", date.format("%Y")))
            .join(format!("{}", date.format("%m")))
            .join(format!("{}.md", date.format("%d")))
    }

    /// Monthly consolidation file; `project_hash` selects the per-project
    /// variant
    pub fn month_file(&self, year: i32, month: u32, project_hash: Option<&str>) -> PathBuf {
        let base = self.root.join("months").join(format!("{year:04}"));
        match project_hash {
            Some(hash) => base.join(hash).join(format!("{month:02}.md")),
            None => base.join(format!("{month:02}.md")),
        }
    }

    /// Yearly consolidation file
    pub fn year_file(&self, year: i32, project_hash: Option<&str>) -> PathBuf {
        let base = self.root.join("years");
        match project_hash {
            Some(hash) => base.join(hash).join(format!("{year:04}.md")),
            None => base.join(format!("{year:04}.md")),
        }
    }

    /// Global scope memory file
    pub fn global_memory(&self) -> PathBuf {
        self.root.join("memory").join("global.md")
    }

    /// Project scope memory file, keyed by a stable hash of the project path
    pub fn project_memory(&self, project_hash: &str) -> PathBuf {
        self.root
            .join("memory")
            .join("projects")
            .join(project_hash)
            .join("project.md")
    }

    /// Agent scope memory file
    pub fn agent_memory(&self, agent_id: &str) -> PathBuf {
        self.root
            .join("memory")
            .join("agents")
            .join(format!("{agent_id}.md"))
    }

    /// Checkpoint directory for a session
    pub fn checkpoints_dir(&self, session_id: &str) -> PathBuf {
        self.root.join("checkpoints").join(session_id)
    }

    /// Create the directory skeleton
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.root.join("sessions"),
            self.root.join("days"),
            self.root.join("months"),
            self.root.join("years"),
            self.root.join("memory").join("projects"),
            self.root.join("memory").join("agents"),
            self.root.join("checkpoints"),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

/// Short stable hash used for project directories and keyed upserts
pub fn project_hash(project: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(project.as_bytes());
    // 8 bytes of hex is plenty for directory names
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = HomeLayout::new("/tmp/smriti-home");
        let date = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();

        assert_eq!(
            layout.day_file(date),
            PathBuf::from("/tmp/smriti-home/days/2025/06/15.md")
        );
        assert_eq!(
            layout.session_file("session-2025-06-15-ab12cd34", date),
            PathBuf::from("/tmp/smriti-home/sessions/2025/06/session-2025-06-15-ab12cd34.md")
        );
        assert_eq!(
            layout.month_file(2025, 6, None),
            PathBuf::from("/tmp/smriti-home/months/2025/06.md")
        );
        assert!(layout
            .month_file(2025, 6, Some("deadbeef"))
            .ends_with("2025/deadbeef/06.md"));
    }

    #[test]
    fn test_project_hash_stable() {
        let a = project_hash("/home/u/projects/api");
        let b = project_hash("/home/u/projects/api");
        let c = project_hash("/home/u/projects/web");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
