//! Scoped memory files
//!
//! Long-lived notes outside any single conversation: one markdown file per
//! scope (global, project, agent, session), written through a per-scope
//! mailbox so concurrent writers serialise without blocking readers.

mod files;
mod smaran;

pub use files::{MemoryFileStore, MEMORY_FILE_HEADER_MARKER};
pub use smaran::{SmaranCategory, SmaranEntry, SmaranStore};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::{project_hash, HomeLayout};

// ============================================================================
// SCOPES
// ============================================================================

/// Where a memory belongs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "value")]
pub enum MemoryScope {
    /// Shared across every project and agent
    Global,
    /// Scoped to one project path
    Project(String),
    /// Scoped to one agent id
    Agent(String),
    /// Scoped to one session id; lives next to the session file
    Session(String),
}

impl MemoryScope {
    /// Filesystem path of this scope's memory file
    ///
    /// Session scope keeps its memory alongside the session's own markdown
    /// rather than under `memory/`.
    pub fn path(&self, layout: &HomeLayout) -> PathBuf {
        match self {
            MemoryScope::Global => layout.global_memory(),
            MemoryScope::Project(project) => layout.project_memory(&project_hash(project)),
            MemoryScope::Agent(agent_id) => layout.agent_memory(agent_id),
            MemoryScope::Session(session_id) => {
                match crate::session::session_id_date(session_id) {
                    Ok(date) => layout
                        .sessions_dir(date)
                        .join(format!("{session_id}.memory.md")),
                    Err(_) => layout
                        .root()
                        .join("memory")
                        .join(format!("{session_id}.memory.md")),
                }
            }
        }
    }

    /// Human-readable label used in file headers
    pub fn label(&self) -> String {
        match self {
            MemoryScope::Global => "global".to_string(),
            MemoryScope::Project(project) => format!("project {project}"),
            MemoryScope::Agent(agent_id) => format!("agent {agent_id}"),
            MemoryScope::Session(session_id) => format!("session {session_id}"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_paths() {
        let layout = HomeLayout::new("/tmp/home");
        assert_eq!(
            MemoryScope::Global.path(&layout),
            PathBuf::from("/tmp/home/memory/global.md")
        );
        assert!(MemoryScope::Agent("helper".into())
            .path(&layout)
            .ends_with("memory/agents/helper.md"));

        let project = MemoryScope::Project("/home/u/api".into()).path(&layout);
        assert!(project.starts_with("/tmp/home/memory/projects"));
        assert!(project.ends_with("project.md"));

        let session = MemoryScope::Session("session-2025-06-15-abcd1234".into()).path(&layout);
        assert!(session.ends_with("sessions/2025/06/session-2025-06-15-abcd1234.memory.md"));
    }

    #[test]
    fn test_same_project_same_path() {
        let layout = HomeLayout::new("/tmp/home");
        let a = MemoryScope::Project("/p".into()).path(&layout);
        let b = MemoryScope::Project("/p".into()).path(&layout);
        let c = MemoryScope::Project("/q".into()).path(&layout);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
