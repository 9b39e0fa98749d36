//! Vector store
//!
//! Embeddings live in `vectors.db` as little-endian f32 blobs, keyed by
//! `(source_type, source_id)` so re-indexing a summary or turn upserts in
//! place. Search is an exact cosine scan; the store is small enough (tens of
//! thousands of rows) that an ANN index would buy nothing here.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::db::Database;
use crate::embeddings::{cosine_similarity, Embedding};
use crate::error::Result;

// ============================================================================
// RECORD TYPES
// ============================================================================

/// One stored embedding row
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub text: String,
    pub source_type: String,
    pub source_id: String,
    pub dimensions: usize,
    pub created_at: DateTime<Utc>,
}

/// A scored match from a vector search
#[derive(Debug, Clone)]
pub struct VectorMatch {
    pub record: VectorRecord,
    pub similarity: f32,
}

/// An upsert request; batch writes go through [`VectorStore::upsert_batch`]
#[derive(Debug, Clone)]
pub struct VectorUpsert {
    pub source_type: String,
    pub source_id: String,
    pub text: String,
    pub vector: Vec<f32>,
}

// ============================================================================
// VECTOR STORE
// ============================================================================

/// Store for embedding vectors over `vectors.db`
pub struct VectorStore {
    db: Arc<Database>,
}

impl VectorStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace the embedding for `(source_type, source_id)`
    pub fn upsert(&self, request: &VectorUpsert) -> Result<()> {
        let embedding = Embedding::new(request.vector.clone());
        let writer = self.db.writer()?;
        writer.execute(
            "INSERT INTO embeddings (id, vector, text, source_type, source_id, dimensions, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(source_type, source_id) DO UPDATE SET
                 vector = excluded.vector,
                 text = excluded.text,
                 dimensions = excluded.dimensions,
                 created_at = excluded.created_at",
            params![
                Uuid::new_v4().to_string(),
                embedding.to_bytes(),
                request.text,
                request.source_type,
                request.source_id,
                embedding.dimensions as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Upsert a batch inside one transaction
    pub fn upsert_batch(&self, requests: &[VectorUpsert]) -> Result<usize> {
        if requests.is_empty() {
            return Ok(0);
        }
        let mut writer = self.db.writer()?;
        let tx = writer.transaction()?;
        let now = Utc::now().to_rfc3339();
        for request in requests {
            let embedding = Embedding::new(request.vector.clone());
            tx.execute(
                "INSERT INTO embeddings (id, vector, text, source_type, source_id, dimensions, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(source_type, source_id) DO UPDATE SET
                     vector = excluded.vector,
                     text = excluded.text,
                     dimensions = excluded.dimensions,
                     created_at = excluded.created_at",
                params![
                    Uuid::new_v4().to_string(),
                    embedding.to_bytes(),
                    request.text,
                    request.source_type,
                    request.source_id,
                    embedding.dimensions as i64,
                    now,
                ],
            )?;
        }
        tx.commit()?;
        Ok(requests.len())
    }

    /// Delete the embedding for one source
    pub fn delete(&self, source_type: &str, source_id: &str) -> Result<bool> {
        let writer = self.db.writer()?;
        let deleted = writer.execute(
            "DELETE FROM embeddings WHERE source_type = ?1 AND source_id = ?2",
            params![source_type, source_id],
        )?;
        Ok(deleted > 0)
    }

    /// Cosine search against the query vector
    ///
    /// `source_types` restricts the scan when non-empty. Rows whose blob does
    /// not decode (corrupt or wrong dimensionality) are skipped with a
    /// warning, never surfaced as errors.
    pub fn search(
        &self,
        query: &[f32],
        source_types: &[&str],
        limit: usize,
        min_similarity: f32,
    ) -> Result<Vec<VectorMatch>> {
        let reader = self.db.reader()?;
        let mut sql = String::from(
            "SELECT id, vector, text, source_type, source_id, dimensions, created_at FROM embeddings",
        );
        if !source_types.is_empty() {
            let placeholders: Vec<String> =
                (1..=source_types.len()).map(|i| format!("?{i}")).collect();
            sql.push_str(&format!(" WHERE source_type IN ({})", placeholders.join(", ")));
        }

        let mut stmt = reader.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(source_types.iter().map(|s| s.to_string())),
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Vec<u8>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                ))
            },
        )?;

        let mut matches = Vec::new();
        for row in rows {
            let (id, blob, text, source_type, source_id, dimensions, created) = row?;
            let Some(embedding) = Embedding::from_bytes(&blob) else {
                tracing::warn!(id, "skipping corrupt embedding blob");
                continue;
            };
            if embedding.dimensions != query.len() {
                continue;
            }
            let similarity = cosine_similarity(query, &embedding.vector);
            if similarity < min_similarity {
                continue;
            }
            let created_at = DateTime::parse_from_rfc3339(&created)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            matches.push(VectorMatch {
                record: VectorRecord {
                    id,
                    text,
                    source_type,
                    source_id,
                    dimensions: dimensions as usize,
                    created_at,
                },
                similarity,
            });
        }

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(limit);
        Ok(matches)
    }

    /// Number of stored embeddings
    pub fn count(&self) -> Result<i64> {
        let reader = self.db.reader()?;
        let count = reader.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))?;
        Ok(count)
    }
}

// ============================================================================
// TESTS
// ============================================================================
