//! Schema migrations
//!
//! Each database carries its own migration list, keyed by a schema name in
//! the `_schema_versions` table. Applying migrations is idempotent: versions
//! at or below the stored version are skipped.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

/// Schema name for the relational index (`agent.db`)
pub const AGENT_SCHEMA: &str = "agent";
/// Schema name for the knowledge graph (`graph.db`)
pub const GRAPH_SCHEMA: &str = "graph";
/// Schema name for the vector store (`vectors.db`)
pub const VECTOR_SCHEMA: &str = "vectors";

/// A database migration
#[derive(Debug, Clone)]
pub struct Migration {
    /// Version number
    pub version: u32,
    /// Description
    pub description: &'static str,
    /// SQL to apply
    pub up: &'static str,
}

/// Apply all pending migrations for `schema_name`
pub fn apply_migrations(
    conn: &Connection,
    schema_name: &str,
    migrations: &[Migration],
) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _schema_versions (
            name TEXT PRIMARY KEY,
            version INTEGER NOT NULL
        );",
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT version FROM _schema_versions WHERE name = ?1",
            params![schema_name],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);

    for migration in migrations {
        if migration.version <= current {
            continue;
        }
        tracing::info!(
            schema = schema_name,
            version = migration.version,
            description = migration.description,
            "applying migration"
        );
        conn.execute_batch(migration.up)?;
        conn.execute(
            "INSERT INTO _schema_versions (name, version) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET version = excluded.version",
            params![schema_name, migration.version],
        )?;
    }

    Ok(())
}

// ============================================================================
// AGENT DATABASE (sessions, turns, consolidation state)
// ============================================================================

/// Migrations for `agent.db`
pub const AGENT_MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "sessions, turns, and the turns_fts mirror",
        up: AGENT_V1_UP,
    },
    Migration {
        version: 2,
        description: "consolidation state: vasanas, samskaras, rules, nidra, pratyabhijna",
        up: AGENT_V2_UP,
    },
];

const AGENT_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    project TEXT NOT NULL DEFAULT '',
    title TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    turn_count INTEGER NOT NULL DEFAULT 0,
    file_path TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project);
CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at);

CREATE TABLE IF NOT EXISTS turns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    turn_number INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(session_id, turn_number)
);

CREATE INDEX IF NOT EXISTS idx_turns_session ON turns(session_id);
CREATE INDEX IF NOT EXISTS idx_turns_created ON turns(created_at);

-- Full-text mirror of turn content. rowid tracks turns.id; the session
-- store maintains both sides on append and delete.
CREATE VIRTUAL TABLE IF NOT EXISTS turns_fts USING fts5(content);
"#;

const AGENT_V2_UP: &str = r#"
CREATE TABLE IF NOT EXISTS vasanas (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    valence TEXT NOT NULL DEFAULT 'neutral',
    strength REAL NOT NULL DEFAULT 0.5,
    stability REAL NOT NULL DEFAULT 0.5,
    project TEXT NOT NULL DEFAULT '__global__',
    created_at TEXT NOT NULL,
    last_activated TEXT NOT NULL,
    activation_count INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_vasanas_project ON vasanas(project);

CREATE TABLE IF NOT EXISTS samskaras (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL DEFAULT '',
    pattern_type TEXT NOT NULL,
    pattern_content TEXT NOT NULL,
    observation_count INTEGER NOT NULL DEFAULT 1,
    confidence REAL NOT NULL DEFAULT 0.3,
    project TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_samskaras_project ON samskaras(project);

CREATE TABLE IF NOT EXISTS kartavyas (
    id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    project TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'open',
    created_at TEXT NOT NULL,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS consolidation_rules (
    id TEXT PRIMARY KEY,
    category TEXT NOT NULL,
    content TEXT NOT NULL,
    observation_count INTEGER NOT NULL DEFAULT 1,
    confidence REAL NOT NULL DEFAULT 0.3,
    tags TEXT NOT NULL DEFAULT '[]',
    project TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    last_reinforced_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rules_category ON consolidation_rules(category);

CREATE TABLE IF NOT EXISTS nidra_state (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    state TEXT NOT NULL,
    entered_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Analytic log of self-recognition contexts; rows are never deleted by
-- cache eviction.
CREATE TABLE IF NOT EXISTS pratyabhijna_context (
    session_id TEXT PRIMARY KEY,
    project TEXT NOT NULL DEFAULT '',
    context TEXT NOT NULL,
    warmup_ms INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);
"#;

// ============================================================================
// GRAPH DATABASE (bi-temporal knowledge graph)
// ============================================================================

/// Migrations for `graph.db`
pub const GRAPH_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "nodes, bi-temporal edges, pagerank scores, edge archive",
    up: GRAPH_V1_UP,
}];

const GRAPH_V1_UP: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,
    type TEXT NOT NULL DEFAULT 'entity',
    label TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_nodes_label ON nodes(label);

-- Historical rows are never mutated: supersession stamps superseded_at and
-- inserts a fresh row.
CREATE TABLE IF NOT EXISTS edges (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    target TEXT NOT NULL,
    relationship TEXT NOT NULL,
    weight REAL NOT NULL DEFAULT 1.0,
    pramana TEXT NOT NULL DEFAULT 'pratyaksha',
    viveka TEXT NOT NULL DEFAULT 'grounded',
    valid_from TEXT NOT NULL,
    valid_to TEXT,
    superseded_at TEXT,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_edges_triple ON edges(source, target, relationship);
CREATE INDEX IF NOT EXISTS idx_edges_source ON edges(source);
CREATE INDEX IF NOT EXISTS idx_edges_target ON edges(target);

CREATE TABLE IF NOT EXISTS pagerank (
    node_id TEXT PRIMARY KEY,
    score REAL NOT NULL DEFAULT 0.0
);

CREATE TABLE IF NOT EXISTS edges_archive (
    id INTEGER PRIMARY KEY,
    source TEXT NOT NULL,
    target TEXT NOT NULL,
    relationship TEXT NOT NULL,
    weight REAL NOT NULL,
    pramana TEXT NOT NULL,
    viveka TEXT NOT NULL,
    valid_from TEXT NOT NULL,
    valid_to TEXT,
    superseded_at TEXT,
    recorded_at TEXT NOT NULL,
    archived_at TEXT NOT NULL
);
"#;

// ============================================================================
// VECTOR DATABASE (embeddings)
// ============================================================================

/// Migrations for `vectors.db`
pub const VECTOR_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    description: "embedding blobs keyed by source",
    up: VECTOR_V1_UP,
}];

const VECTOR_V1_UP: &str = r#"
-- vector is a little-endian f32 blob of `dimensions` entries
CREATE TABLE IF NOT EXISTS embeddings (
    id TEXT PRIMARY KEY,
    vector BLOB NOT NULL,
    text TEXT NOT NULL,
    source_type TEXT NOT NULL,
    source_id TEXT NOT NULL,
    dimensions INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(source_type, source_id)
);

CREATE INDEX IF NOT EXISTS idx_embeddings_source_type ON embeddings(source_type);
"#;

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_ordered() {
        for list in [AGENT_MIGRATIONS, GRAPH_MIGRATIONS, VECTOR_MIGRATIONS] {
            for pair in list.windows(2) {
                assert!(pair[0].version < pair[1].version);
            }
        }
    }

    #[test]
    fn test_apply_skips_when_version_matches() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn, AGENT_SCHEMA, AGENT_MIGRATIONS).unwrap();
        let v1: u32 = conn
            .query_row(
                "SELECT version FROM _schema_versions WHERE name = 'agent'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(v1, AGENT_MIGRATIONS.last().unwrap().version);

        // Re-applying is a no-op
        apply_migrations(&conn, AGENT_SCHEMA, AGENT_MIGRATIONS).unwrap();
        let v2: u32 = conn
            .query_row(
                "SELECT version FROM _schema_versions WHERE name = 'agent'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(v1, v2);
    }

    #[test]
    fn test_two_schemas_share_version_table() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn, GRAPH_SCHEMA, GRAPH_MIGRATIONS).unwrap();
        apply_migrations(&conn, VECTOR_SCHEMA, VECTOR_MIGRATIONS).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM _schema_versions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }
}
