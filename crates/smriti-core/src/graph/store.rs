//! Graph store over `graph.db`
//!
//! Single-writer edge lifecycle: create, supersede, expire, query-at,
//! history, compact. Each transition is one transaction, so `query_at`
//! always sees a consistent snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::community::{CommunityConfig, CommunityDetector};
use super::pagerank::PersonalizedPageRank;
use super::{GraphEdge, GraphNode, Pramana, Viveka};
use crate::db::Database;
use crate::error::{MemoryError, Result};

// ============================================================================
// CONFIG
// ============================================================================

/// Tunables for edge ranking
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Default half-life for edge-weight decay, in days
    pub default_half_life_days: f64,
    /// Per-relationship overrides
    pub relationship_half_lives: HashMap<String, f64>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            default_half_life_days: 90.0,
            relationship_half_lives: HashMap::new(),
        }
    }
}

impl GraphConfig {
    /// Half-life for one relationship, in days
    pub fn half_life_days(&self, relationship: &str) -> f64 {
        self.relationship_half_lives
            .get(relationship)
            .copied()
            .unwrap_or(self.default_half_life_days)
            .clamp(1.0 / 86_400.0, 3_650.0)
    }
}

/// Fields for a new edge; `recorded_at` is stamped by the store
#[derive(Debug, Clone)]
pub struct NewEdge {
    pub source: String,
    pub target: String,
    pub relationship: String,
    pub weight: f64,
    pub pramana: Pramana,
    pub viveka: Viveka,
    pub valid_from: DateTime<Utc>,
    pub valid_to: Option<DateTime<Utc>>,
}

// ============================================================================
// GRAPH STORE
// ============================================================================

/// Store for nodes and bi-temporal edges
pub struct GraphStore {
    db: Arc<Database>,
    config: GraphConfig,
}

impl GraphStore {
    pub fn new(db: Arc<Database>, config: GraphConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// The database backing this store
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn edge_from_row(row: &Row<'_>) -> rusqlite::Result<GraphEdge> {
        let parse_dt = |s: String| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
        };
        Ok(GraphEdge {
            id: row.get(0)?,
            source: row.get(1)?,
            target: row.get(2)?,
            relationship: row.get(3)?,
            weight: row.get(4)?,
            pramana: Pramana::parse_name(&row.get::<_, String>(5)?)
                .unwrap_or(Pramana::Pratyaksha),
            viveka: Viveka::parse_name(&row.get::<_, String>(6)?).unwrap_or(Viveka::Probable),
            valid_from: parse_dt(row.get(7)?)?,
            valid_to: row
                .get::<_, Option<String>>(8)?
                .map(|s| parse_dt(s))
                .transpose()?,
            superseded_at: row
                .get::<_, Option<String>>(9)?
                .map(|s| parse_dt(s))
                .transpose()?,
            recorded_at: parse_dt(row.get(10)?)?,
        })
    }

    const EDGE_COLUMNS: &'static str =
        "id, source, target, relationship, weight, pramana, viveka, valid_from, valid_to, superseded_at, recorded_at";

    // ------------------------------------------------------------------
    // NODES
    // ------------------------------------------------------------------

    /// Create a node or refresh its label and `updated_at`
    pub fn upsert_node(&self, id: &str, node_type: &str, label: &str) -> Result<GraphNode> {
        let now = Utc::now();
        let writer = self.db.writer()?;
        writer.execute(
            "INSERT INTO nodes (id, type, label, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 label = excluded.label,
                 type = excluded.type,
                 updated_at = excluded.updated_at",
            params![id, node_type, label, now.to_rfc3339()],
        )?;
        drop(writer);
        self.get_node(id)?
            .ok_or_else(|| MemoryError::NotFound(format!("node {id}")))
    }

    /// Fetch a node by id
    pub fn get_node(&self, id: &str) -> Result<Option<GraphNode>> {
        let reader = self.db.reader()?;
        let node = reader
            .query_row(
                "SELECT id, type, label, created_at, updated_at FROM nodes WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        match node {
            Some((id, node_type, label, created, updated)) => {
                let parse = |s: &str| {
                    DateTime::parse_from_rfc3339(s)
                        .map(|dt| dt.with_timezone(&Utc))
                        .map_err(|_| MemoryError::Corruption(format!("bad node timestamp: {s}")))
                };
                Ok(Some(GraphNode {
                    id,
                    node_type,
                    label,
                    created_at: parse(&created)?,
                    updated_at: parse(&updated)?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Nodes whose label contains any of the given tokens, case-insensitive
    ///
    /// Used to seed the personalised-PageRank teleport set from a query.
    pub fn nodes_matching(&self, tokens: &[String]) -> Result<Vec<GraphNode>> {
        let mut found = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let reader = self.db.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, label FROM nodes WHERE LOWER(label) LIKE ?1 LIMIT 50",
        )?;
        for token in tokens {
            let token = token.trim().to_lowercase();
            if token.len() < 3 {
                continue;
            }
            let pattern = format!("%{}%", token.replace(['%', '_'], " "));
            let ids: Vec<String> = stmt
                .query_map(params![pattern], |row| row.get::<_, String>(0))?
                .filter_map(|r| r.ok())
                .collect();
            for id in ids {
                if seen.insert(id.clone()) {
                    found.push(id);
                }
            }
        }
        drop(stmt);
        drop(reader);

        let mut nodes = Vec::with_capacity(found.len());
        for id in found {
            if let Some(node) = self.get_node(&id)? {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// All node ids
    pub fn node_ids(&self) -> Result<Vec<String>> {
        let reader = self.db.reader()?;
        let mut stmt = reader.prepare("SELECT id FROM nodes")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    // ------------------------------------------------------------------
    // EDGE LIFECYCLE
    // ------------------------------------------------------------------

    /// Insert a new edge with `recorded_at = now`
    ///
    /// If a current (non-superseded) row already exists for the triple it is
    /// superseded first, so at most one current row per
    /// (source, target, relationship) holds under any call sequence.
    pub fn create_edge(&self, edge: NewEdge) -> Result<GraphEdge> {
        let now = Utc::now();
        let id = {
            let mut writer = self.db.writer()?;
            let tx = writer.transaction()?;
            tx.execute(
                "UPDATE edges SET superseded_at = ?1
                 WHERE source = ?2 AND target = ?3 AND relationship = ?4 AND superseded_at IS NULL",
                params![now.to_rfc3339(), edge.source, edge.target, edge.relationship],
            )?;
            tx.execute(
                "INSERT INTO edges (source, target, relationship, weight, pramana, viveka,
                                    valid_from, valid_to, superseded_at, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9)",
                params![
                    edge.source,
                    edge.target,
                    edge.relationship,
                    edge.weight,
                    edge.pramana.as_str(),
                    edge.viveka.as_str(),
                    edge.valid_from.to_rfc3339(),
                    edge.valid_to.map(|t| t.to_rfc3339()),
                    now.to_rfc3339(),
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            id
        };
        self.get_edge(id)?
            .ok_or_else(|| MemoryError::NotFound(format!("edge {id}")))
    }

    /// Stamp `superseded_at` on an existing row and insert its replacement
    ///
    /// The historical row is never mutated beyond the supersession stamp.
    pub fn supersede(&self, edge_id: i64, replacement: NewEdge) -> Result<GraphEdge> {
        let old = self
            .get_edge(edge_id)?
            .ok_or_else(|| MemoryError::NotFound(format!("edge {edge_id}")))?;
        if !old.is_current() {
            return Err(MemoryError::Invariant(format!(
                "edge {edge_id} is already superseded"
            )));
        }

        let now = Utc::now();
        let new_id = {
            let mut writer = self.db.writer()?;
            let tx = writer.transaction()?;
            tx.execute(
                "UPDATE edges SET superseded_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), edge_id],
            )?;
            tx.execute(
                "INSERT INTO edges (source, target, relationship, weight, pramana, viveka,
                                    valid_from, valid_to, superseded_at, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9)",
                params![
                    replacement.source,
                    replacement.target,
                    replacement.relationship,
                    replacement.weight,
                    replacement.pramana.as_str(),
                    replacement.viveka.as_str(),
                    replacement.valid_from.to_rfc3339(),
                    replacement.valid_to.map(|t| t.to_rfc3339()),
                    now.to_rfc3339(),
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.commit()?;
            id
        };
        self.get_edge(new_id)?
            .ok_or_else(|| MemoryError::NotFound(format!("edge {new_id}")))
    }

    /// Close an edge's valid time
    pub fn expire(&self, edge_id: i64, at: DateTime<Utc>) -> Result<GraphEdge> {
        let edge = self
            .get_edge(edge_id)?
            .ok_or_else(|| MemoryError::NotFound(format!("edge {edge_id}")))?;
        if at < edge.valid_from {
            return Err(MemoryError::Invariant(format!(
                "valid_to {at} precedes valid_from {}",
                edge.valid_from
            )));
        }
        let writer = self.db.writer()?;
        writer.execute(
            "UPDATE edges SET valid_to = ?1 WHERE id = ?2",
            params![at.to_rfc3339(), edge_id],
        )?;
        drop(writer);
        self.get_edge(edge_id)?
            .ok_or_else(|| MemoryError::NotFound(format!("edge {edge_id}")))
    }

    /// Fetch a single edge row by id
    pub fn get_edge(&self, edge_id: i64) -> Result<Option<GraphEdge>> {
        let reader = self.db.reader()?;
        let edge = reader
            .query_row(
                &format!("SELECT {} FROM edges WHERE id = ?1", Self::EDGE_COLUMNS),
                params![edge_id],
                Self::edge_from_row,
            )
            .optional()?;
        Ok(edge)
    }

    /// Edges visible at `time`: valid then, and not yet superseded then
    pub fn query_at(&self, time: DateTime<Utc>) -> Result<Vec<GraphEdge>> {
        let reader = self.db.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM edges
             WHERE valid_from <= ?1
               AND (valid_to IS NULL OR valid_to >= ?1)
               AND (superseded_at IS NULL OR superseded_at > ?1)",
            Self::EDGE_COLUMNS
        ))?;
        let edges = stmt
            .query_map(params![time.to_rfc3339()], Self::edge_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    /// All rows ever recorded for a triple, in transaction order
    pub fn history(&self, source: &str, target: &str, relationship: &str) -> Result<Vec<GraphEdge>> {
        let reader = self.db.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM edges
             WHERE source = ?1 AND target = ?2 AND relationship = ?3
             ORDER BY recorded_at, id",
            Self::EDGE_COLUMNS
        ))?;
        let edges = stmt
            .query_map(params![source, target, relationship], Self::edge_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(edges)
    }

    /// Collapse long superseded chains older than `max_age_days`
    ///
    /// Superseded rows past the cutoff move to `edges_archive`; the current
    /// row of each triple always stays in place. Returns the number of rows
    /// archived.
    pub fn compact(&self, max_age_days: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(max_age_days as i64);
        let cutoff_str = cutoff.to_rfc3339();
        let mut writer = self.db.writer()?;
        let tx = writer.transaction()?;
        let archived = tx.execute(
            "INSERT INTO edges_archive (id, source, target, relationship, weight, pramana, viveka,
                                        valid_from, valid_to, superseded_at, recorded_at, archived_at)
             SELECT id, source, target, relationship, weight, pramana, viveka,
                    valid_from, valid_to, superseded_at, recorded_at, ?1
             FROM edges
             WHERE superseded_at IS NOT NULL AND superseded_at < ?2",
            params![Utc::now().to_rfc3339(), cutoff_str],
        )?;
        tx.execute(
            "DELETE FROM edges WHERE superseded_at IS NOT NULL AND superseded_at < ?1",
            params![cutoff_str],
        )?;
        tx.commit()?;
        if archived > 0 {
            tracing::info!(archived, "compacted superseded edge chains");
        }
        Ok(archived)
    }

    // ------------------------------------------------------------------
    // RANKING SUPPORT
    // ------------------------------------------------------------------

    /// Weighted adjacency of the graph as of `time`, with per-relationship
    /// temporal decay applied
    pub fn adjacency_at(
        &self,
        time: DateTime<Utc>,
    ) -> Result<HashMap<String, Vec<(String, f64)>>> {
        let mut adjacency: HashMap<String, Vec<(String, f64)>> = HashMap::new();
        for edge in self.query_at(time)? {
            let half_life = self.config.half_life_days(&edge.relationship);
            let weight = edge.effective_weight(time, half_life);
            adjacency
                .entry(edge.source.clone())
                .or_default()
                .push((edge.target.clone(), weight));
            // Make sure sink nodes appear in the map
            adjacency.entry(edge.target).or_default();
        }
        Ok(adjacency)
    }

    /// Persist PageRank scores
    pub fn save_pagerank(&self, scores: &HashMap<String, f64>) -> Result<()> {
        let mut writer = self.db.writer()?;
        let tx = writer.transaction()?;
        tx.execute("DELETE FROM pagerank", [])?;
        for (node_id, score) in scores {
            tx.execute(
                "INSERT INTO pagerank (node_id, score) VALUES (?1, ?2)",
                params![node_id, score],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Recompute global PageRank over the current graph and persist it
    pub fn refresh_pagerank(&self) -> Result<HashMap<String, f64>> {
        let adjacency = self.adjacency_at(Utc::now())?;
        let scores = PersonalizedPageRank::default().rank(&adjacency, &[]);
        self.save_pagerank(&scores)?;
        Ok(scores)
    }

    /// Cluster the current graph into communities
    pub fn communities(&self, config: CommunityConfig) -> Result<HashMap<String, usize>> {
        let adjacency = self.adjacency_at(Utc::now())?;
        Ok(CommunityDetector::new(config).detect(&adjacency))
    }

    /// Load persisted PageRank scores
    pub fn load_pagerank(&self) -> Result<HashMap<String, f64>> {
        let reader = self.db.reader()?;
        let mut stmt = reader.prepare("SELECT node_id, score FROM pagerank")?;
        let scores = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?)))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(scores)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{GRAPH_MIGRATIONS, GRAPH_SCHEMA};
    use chrono::Duration;
    use tempfile::TempDir;

    fn store() -> (TempDir, GraphStore) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(dir.path().join("graph.db"), GRAPH_SCHEMA, GRAPH_MIGRATIONS)
            .unwrap();
        (dir, GraphStore::new(Arc::new(db), GraphConfig::default()))
    }

    fn edge(source: &str, target: &str, weight: f64, valid_from: DateTime<Utc>) -> NewEdge {
        NewEdge {
            source: source.into(),
            target: target.into(),
            relationship: "uses".into(),
            weight,
            pramana: Pramana::Pratyaksha,
            viveka: Viveka::Grounded,
            valid_from,
            valid_to: None,
        }
    }

    #[test]
    fn test_bitemporal_supersede() {
        let (_dir, store) = store();
        let t0 = Utc::now() - Duration::hours(2);

        let first = store.create_edge(edge("a", "b", 0.8, t0)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store
            .supersede(first.id, edge("a", "b", 0.9, Utc::now()))
            .unwrap();
        let t1 = Utc::now() + Duration::seconds(1);

        // As of t0, the original row is the visible one
        let at_t0 = store.query_at(t0).unwrap();
        assert_eq!(at_t0.len(), 1);
        assert!((at_t0[0].weight - 0.8).abs() < 1e-9);

        // As of t1, only the replacement is visible
        let at_t1 = store.query_at(t1).unwrap();
        assert_eq!(at_t1.len(), 1);
        assert!((at_t1[0].weight - 0.9).abs() < 1e-9);
        assert_eq!(at_t1[0].id, second.id);

        // History keeps both rows in transaction order
        let history = store.history("a", "b", "uses").unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].superseded_at.is_some());
        assert!(history[1].is_current());
    }

    #[test]
    fn test_create_on_existing_triple_supersedes() {
        let (_dir, store) = store();
        let t0 = Utc::now() - Duration::hours(1);
        store.create_edge(edge("a", "b", 0.5, t0)).unwrap();
        store.create_edge(edge("a", "b", 0.7, Utc::now())).unwrap();

        // Never two current rows for one triple
        let current: Vec<_> = store
            .history("a", "b", "uses")
            .unwrap()
            .into_iter()
            .filter(|e| e.is_current())
            .collect();
        assert_eq!(current.len(), 1);
        assert!((current[0].weight - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_supersede_superseded_row_fails() {
        let (_dir, store) = store();
        let t0 = Utc::now() - Duration::hours(1);
        let first = store.create_edge(edge("a", "b", 0.5, t0)).unwrap();
        store.supersede(first.id, edge("a", "b", 0.6, Utc::now())).unwrap();
        let err = store
            .supersede(first.id, edge("a", "b", 0.7, Utc::now()))
            .unwrap_err();
        assert!(matches!(err, MemoryError::Invariant(_)));
    }

    #[test]
    fn test_expire_closes_validity() {
        let (_dir, store) = store();
        let t0 = Utc::now() - Duration::days(2);
        let created = store.create_edge(edge("a", "b", 0.5, t0)).unwrap();
        let expired = store.expire(created.id, t0 + Duration::days(1)).unwrap();
        assert!(expired.valid_to.is_some());

        // Not visible after its validity window
        assert!(store.query_at(Utc::now()).unwrap().is_empty());
        // Still visible within it
        assert_eq!(store.query_at(t0 + Duration::hours(1)).unwrap().len(), 1);

        // valid_to before valid_from is rejected
        let other = store.create_edge(edge("x", "y", 0.5, Utc::now())).unwrap();
        assert!(store
            .expire(other.id, Utc::now() - Duration::days(5))
            .is_err());
    }

    #[test]
    fn test_compact_archives_old_chains() {
        let (_dir, store) = store();
        let t0 = Utc::now() - Duration::days(400);
        let first = store.create_edge(edge("a", "b", 0.5, t0)).unwrap();
        store.create_edge(edge("a", "b", 0.7, Utc::now())).unwrap();

        // Backdate the supersession so it falls past the cutoff
        store
            .db
            .writer()
            .unwrap()
            .execute(
                "UPDATE edges SET superseded_at = ?1 WHERE id = ?2",
                params![(Utc::now() - Duration::days(200)).to_rfc3339(), first.id],
            )
            .unwrap();

        let archived = store.compact(90).unwrap();
        assert_eq!(archived, 1);
        assert_eq!(store.history("a", "b", "uses").unwrap().len(), 1);
    }

    #[test]
    fn test_refresh_pagerank_and_communities() {
        let (_dir, store) = store();
        let now = Utc::now();
        for (source, target) in [("a", "b"), ("b", "c"), ("c", "a"), ("x", "y")] {
            store.upsert_node(source, "entity", source).unwrap();
            store.upsert_node(target, "entity", target).unwrap();
            let mut new_edge = edge(source, target, 1.0, now);
            new_edge.relationship = format!("{source}-{target}");
            store.create_edge(new_edge).unwrap();
        }

        let scores = store.refresh_pagerank().unwrap();
        assert!(!scores.is_empty());
        // Persisted and reloadable
        let loaded = store.load_pagerank().unwrap();
        assert_eq!(scores.len(), loaded.len());

        let communities = store.communities(CommunityConfig::default()).unwrap();
        // The triangle clusters apart from the detached pair
        assert_eq!(communities["a"], communities["b"]);
        assert_ne!(communities["a"], communities["x"]);
    }

    #[test]
    fn test_adjacency_applies_decay() {
        let (_dir, store) = store();
        let now = Utc::now();
        store.upsert_node("a", "entity", "A").unwrap();
        store.upsert_node("b", "entity", "B").unwrap();
        store
            .create_edge(edge("a", "b", 1.0, now - Duration::days(90)))
            .unwrap();

        let adjacency = store.adjacency_at(now).unwrap();
        let (_, weight) = adjacency["a"][0];
        // Default half-life is 90 days, so the weight has halved
        assert!((weight - 0.5).abs() < 0.01);
        assert!(adjacency.contains_key("b"));
    }
}
