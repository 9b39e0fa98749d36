//! Consolidation indexer
//!
//! Every written summary is reduced to a high-signal excerpt, embedded, and
//! upserted into the vector store keyed by level, period, and project hash,
//! so recall can reach consolidated knowledge alongside raw turns.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::config::project_hash;
use crate::embeddings::EmbeddingClient;
use crate::error::{Result, RetryPolicy};
use crate::events::{EventBus, MemoryEvent};
use crate::vector::{VectorStore, VectorUpsert};

/// Excerpt size ceiling, in characters
pub const EXCERPT_CAP: usize = 2000;

// ============================================================================
// LEVELS
// ============================================================================

/// Which cadence produced a summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryLevel {
    Day,
    Month,
    Year,
}

impl SummaryLevel {
    /// Vector-store source type for this level
    pub fn source_type(&self) -> &'static str {
        match self {
            SummaryLevel::Day => "daily_summary",
            SummaryLevel::Month => "monthly_summary",
            SummaryLevel::Year => "yearly_summary",
        }
    }
}

// ============================================================================
// EXCERPT EXTRACTION
// ============================================================================

/// Reduce a summary to its highest-signal text
///
/// Keeps the header line, the facts and decisions sections, and leading
/// lines of everything else until the cap. Markdown scaffolding (comments,
/// rules) is dropped.
pub fn extract_excerpt(markdown: &str, cap: usize) -> String {
    let mut prioritized: Vec<&str> = Vec::new();
    let mut rest: Vec<&str> = Vec::new();
    let mut in_priority_section = false;

    for line in markdown.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("<!--") || trimmed == "---" || trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with("# ") {
            prioritized.push(trimmed);
            continue;
        }
        if trimmed.starts_with("## ") {
            let heading = trimmed.trim_start_matches("## ").to_lowercase();
            in_priority_section =
                heading.contains("fact") || heading.contains("decision") || heading.contains("vasana");
            continue;
        }
        if in_priority_section {
            prioritized.push(trimmed);
        } else {
            rest.push(trimmed);
        }
    }

    let mut out = String::new();
    for line in prioritized.into_iter().chain(rest) {
        if out.len() + line.len() + 1 > cap {
            break;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_string()
}

// ============================================================================
// INDEXER
// ============================================================================

/// Embeds and upserts summary excerpts
pub struct ConsolidationIndexer {
    vectors: Arc<VectorStore>,
    embeddings: Arc<EmbeddingClient>,
    bus: EventBus,
}

impl ConsolidationIndexer {
    pub fn new(vectors: Arc<VectorStore>, embeddings: Arc<EmbeddingClient>, bus: EventBus) -> Self {
        Self {
            vectors,
            embeddings,
            bus,
        }
    }

    /// Index one summary; upserts are keyed by (level, period, project hash)
    pub async fn index_summary(
        &self,
        level: SummaryLevel,
        period_key: &str,
        project: Option<&str>,
        markdown: &str,
    ) -> Result<()> {
        let excerpt = extract_excerpt(markdown, EXCERPT_CAP);
        if excerpt.is_empty() {
            tracing::debug!(period_key, "summary excerpt empty, nothing to index");
            return Ok(());
        }

        let source_id = match project {
            Some(project) => format!("{period_key}:{}", project_hash(project)),
            None => period_key.to_string(),
        };
        let vector = self.embeddings.embed_one(&excerpt).await;
        let request = VectorUpsert {
            source_type: level.source_type().to_string(),
            source_id: source_id.clone(),
            text: excerpt,
            vector,
        };
        // Database contention is the one transient failure worth retrying
        RetryPolicy::default().run(|| self.vectors.upsert(&request))?;

        self.bus.emit(MemoryEvent::MemoryIndexed {
            source_type: level.source_type().to_string(),
            source_id,
            at: Utc::now(),
        });
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Database, VECTOR_MIGRATIONS, VECTOR_SCHEMA};
    use tempfile::TempDir;

    #[test]
    fn test_excerpt_prioritizes_facts() {
        let markdown = "# Day 2025-06-15\n\n<!-- projects: 1 sessions: 2 facts: 1 -->\n\n\
                        ## Facts Learned\n\n- ships on fridays\n\n\
                        ## Project: /p\n\n- 10:00 claude [Coding]: fixed the parser\n\n---\n";
        let excerpt = extract_excerpt(markdown, EXCERPT_CAP);
        assert!(excerpt.starts_with("# Day 2025-06-15"));
        // Facts come before project lines
        let facts_pos = excerpt.find("ships on fridays").unwrap();
        let project_pos = excerpt.find("fixed the parser").unwrap();
        assert!(facts_pos < project_pos);
        assert!(!excerpt.contains("<!--"));
    }

    #[test]
    fn test_excerpt_respects_cap() {
        let mut markdown = String::from("# Big\n\n## Facts Learned\n\n");
        for i in 0..500 {
            markdown.push_str(&format!("- fact number {i} with some padding text\n"));
        }
        let excerpt = extract_excerpt(&markdown, EXCERPT_CAP);
        assert!(excerpt.len() <= EXCERPT_CAP);
        assert!(excerpt.contains("fact number 0"));
    }

    #[tokio::test]
    async fn test_index_summary_upserts_keyed() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::open(dir.path().join("vectors.db"), VECTOR_SCHEMA, VECTOR_MIGRATIONS)
                .unwrap(),
        );
        let vectors = Arc::new(VectorStore::new(db));
        let indexer = ConsolidationIndexer::new(
            vectors.clone(),
            Arc::new(EmbeddingClient::fallback_only()),
            EventBus::default(),
        );

        let markdown = "# Day 2025-06-15\n\n## Facts Learned\n\n- likes rust\n";
        indexer
            .index_summary(SummaryLevel::Day, "2025-06-15", None, markdown)
            .await
            .unwrap();
        // Re-indexing the same period replaces, not duplicates
        indexer
            .index_summary(SummaryLevel::Day, "2025-06-15", None, markdown)
            .await
            .unwrap();
        assert_eq!(vectors.count().unwrap(), 1);

        // Project variant gets its own key
        indexer
            .index_summary(SummaryLevel::Day, "2025-06-15", Some("/p"), markdown)
            .await
            .unwrap();
        assert_eq!(vectors.count().unwrap(), 2);
    }
}
