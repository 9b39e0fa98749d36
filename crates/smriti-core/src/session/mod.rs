//! Session model
//!
//! A session is an append-ordered record of conversation turns with a
//! markdown file as the source of truth and a relational index for listing
//! and full-text search. Sessions are branchable: a branch deep-copies a
//! prefix of its parent's turns and keeps a back-reference.

mod markdown;
mod store;

pub use markdown::{parse_session, write_session};
pub use store::{
    CreateSessionOptions, NewTurn, SessionStore, SessionSummary, SessionTree, SessionTreeNode,
};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MemoryError, Result};

// ============================================================================
// ROLES
// ============================================================================

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }

    pub fn parse_name(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "user" => Ok(TurnRole::User),
            "assistant" => Ok(TurnRole::Assistant),
            other => Err(MemoryError::Invariant(format!("unknown role: {other}"))),
        }
    }
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// TOOL CALLS
// ============================================================================

/// A tool invocation recorded inside an assistant turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    /// Tool name
    pub name: String,
    /// Input as a JSON string
    pub input: String,
    /// Tool output text
    pub result: String,
    /// Whether the call failed
    #[serde(default)]
    pub is_error: bool,
}

// ============================================================================
// TURNS
// ============================================================================

/// One conversation turn
///
/// Ordinals are contiguous and start at 1; `created_at` is non-decreasing
/// with the ordinal. Turns are immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub ordinal: u32,
    pub role: TurnRole,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Per-turn agent override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Per-turn model override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// SESSION META
// ============================================================================

/// Session header fields, exactly what the markdown front-matter carries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub id: String,
    pub project: String,
    pub title: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub agent: String,
    pub model: String,
    /// Parent session for branches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Branch name when this session is a branch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// A full session: header plus turns
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub meta: SessionMeta,
    pub turns: Vec<Turn>,
}

impl Session {
    /// Number of turns
    pub fn turn_count(&self) -> u32 {
        self.turns.len() as u32
    }

    /// Validate internal invariants: contiguous ordinals from 1, timestamps
    /// non-decreasing
    pub fn check_invariants(&self) -> Result<()> {
        for (i, turn) in self.turns.iter().enumerate() {
            if turn.ordinal != (i as u32) + 1 {
                return Err(MemoryError::Invariant(format!(
                    "turn at position {i} has ordinal {} (expected {})",
                    turn.ordinal,
                    i + 1
                )));
            }
            if i > 0 && turn.created_at < self.turns[i - 1].created_at {
                return Err(MemoryError::Invariant(format!(
                    "turn {} created before its predecessor",
                    turn.ordinal
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// SESSION IDS
// ============================================================================

/// Allocate a session id for a given date: `session-YYYY-MM-DD-<suffix>`
pub fn new_session_id(date: NaiveDate) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("session-{}-{}", date.format("%Y-%m-%d"), &suffix[..8])
}

/// Extract the date encoded in a session id
pub fn session_id_date(session_id: &str) -> Result<NaiveDate> {
    let rest = session_id
        .strip_prefix("session-")
        .ok_or_else(|| MemoryError::Invariant(format!("malformed session id: {session_id}")))?;
    if rest.len() < 10 {
        return Err(MemoryError::Invariant(format!(
            "malformed session id: {session_id}"
        )));
    }
    NaiveDate::parse_from_str(&rest[..10], "%Y-%m-%d")
        .map_err(|_| MemoryError::Invariant(format!("malformed session id: {session_id}")))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_shape() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 15).unwrap();
        let id = new_session_id(date);
        assert!(id.starts_with("session-2025-06-15-"));
        assert_eq!(session_id_date(&id).unwrap(), date);
    }

    #[test]
    fn test_session_id_date_rejects_garbage() {
        assert!(session_id_date("not-a-session").is_err());
        assert!(session_id_date("session-xx").is_err());
        assert!(session_id_date("session-2025-13-99-abcd").is_err());
    }

    #[test]
    fn test_invariant_check_catches_ordinal_gap() {
        let now = Utc::now();
        let meta = SessionMeta {
            id: "session-2025-06-15-abcd1234".into(),
            project: "/p".into(),
            title: "t".into(),
            created: now,
            updated: now,
            agent: "a".into(),
            model: "m".into(),
            parent: None,
            branch: None,
            tags: vec![],
            total_cost: 0.0,
            total_tokens: 0,
        };
        let turn = |ordinal| Turn {
            ordinal,
            role: TurnRole::User,
            content: "x".into(),
            tool_calls: vec![],
            agent: None,
            model: None,
            created_at: now,
        };
        let good = Session {
            meta: meta.clone(),
            turns: vec![turn(1), turn(2)],
        };
        assert!(good.check_invariants().is_ok());

        let bad = Session {
            meta,
            turns: vec![turn(1), turn(3)],
        };
        assert!(bad.check_invariants().is_err());
    }
}
