//! Lexical signal (FTS5)
//!
//! Full-text search over the `turns_fts` mirror. Queries are sanitised
//! before hitting MATCH so stray quotes and FTS5 operators from
//! conversational text cannot break the statement.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::db::Database;
use crate::error::Result;

// ============================================================================
// QUERY SANITISATION
// ============================================================================

/// Reduce free text to a safe FTS5 MATCH expression
///
/// Tokens are stripped to alphanumerics, quoted, and OR-joined; an empty
/// result means the query has nothing searchable.
pub fn sanitize_fts_query(query: &str) -> String {
    let tokens: Vec<String> = query
        .split_whitespace()
        .map(|token| {
            token
                .chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{token}\""))
        .collect();
    tokens.join(" OR ")
}

// ============================================================================
// LEXICAL SEARCHER
// ============================================================================

/// A turn matched by full-text search
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub session_id: String,
    pub ordinal: u32,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Positive, higher is better (negated bm25)
    pub score: f32,
}

/// Lexical searcher over the relational index
pub struct LexicalSearcher {
    db: Arc<Database>,
}

impl LexicalSearcher {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Top turns for a query by bm25
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<LexicalHit>> {
        let sanitized = sanitize_fts_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }

        let reader = self.db.reader()?;
        let mut stmt = reader.prepare(
            "SELECT t.session_id, t.turn_number, t.content, t.created_at, bm25(turns_fts)
             FROM turns_fts
             JOIN turns t ON t.id = turns_fts.rowid
             WHERE turns_fts MATCH ?1
             ORDER BY bm25(turns_fts)
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![sanitized, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, f64>(4)?,
            ))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (session_id, ordinal, content, created, bm25) = row?;
            let created_at = DateTime::parse_from_rfc3339(&created)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            hits.push(LexicalHit {
                session_id,
                ordinal: ordinal.max(0) as u32,
                content,
                created_at,
                // bm25 is more negative for better matches
                score: (-bm25) as f32,
            });
        }
        Ok(hits)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HomeLayout;
    use crate::db::{AGENT_MIGRATIONS, AGENT_SCHEMA};
    use crate::session::{CreateSessionOptions, NewTurn, SessionStore};
    use tempfile::TempDir;

    fn searcher_with_turns(turns: &[&str]) -> (TempDir, LexicalSearcher) {
        let dir = TempDir::new().unwrap();
        let layout = HomeLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        let db = Arc::new(
            Database::open(layout.agent_db(), AGENT_SCHEMA, AGENT_MIGRATIONS).unwrap(),
        );
        let store = SessionStore::new(db.clone(), layout);
        let session = store
            .create(CreateSessionOptions {
                project: "/p".into(),
                title: "t".into(),
                agent: "a".into(),
                model: "m".into(),
                tags: vec![],
            })
            .unwrap();
        for turn in turns {
            store.append(&session.meta.id, NewTurn::user(*turn)).unwrap();
        }
        (dir, LexicalSearcher::new(db))
    }

    #[test]
    fn test_sanitize_strips_operators() {
        assert_eq!(sanitize_fts_query("auth AND \"layer\""), "\"auth\" OR \"AND\" OR \"layer\"");
        assert_eq!(sanitize_fts_query("(){}*^"), "");
        assert_eq!(sanitize_fts_query("  "), "");
    }

    #[test]
    fn test_search_finds_matching_turn() {
        let (_dir, searcher) = searcher_with_turns(&[
            "we chose argon2 for password hashing",
            "the weather was nice today",
        ]);
        let hits = searcher.search("password hashing", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].content.contains("argon2"));
        assert_eq!(hits[0].ordinal, 1);
    }

    #[test]
    fn test_hostile_query_does_not_error() {
        let (_dir, searcher) = searcher_with_turns(&["hello world"]);
        // Unbalanced quotes and operators must not break MATCH
        let hits = searcher.search("\"NEAR( OR *", 10).unwrap();
        assert!(hits.len() <= 1);
        assert!(searcher.search("!!!", 10).unwrap().is_empty());
    }
}
