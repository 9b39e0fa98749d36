//! Session store
//!
//! Durable, branchable record of conversations. The markdown file is the
//! source of truth; `agent.db` carries a listing/ordering index and the
//! `turns_fts` full-text mirror. On disagreement the file wins and the index
//! is rebuilt from it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::markdown::{parse_session, write_session};
use super::{new_session_id, session_id_date, Session, SessionMeta, ToolCall, Turn, TurnRole};
use crate::config::HomeLayout;
use crate::db::Database;
use crate::error::{MemoryError, Result};

// ============================================================================
// INPUT / OUTPUT TYPES
// ============================================================================

/// Options for creating a session
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    pub project: String,
    pub title: String,
    pub agent: String,
    pub model: String,
    pub tags: Vec<String>,
}

/// A turn to append; the store assigns the ordinal and timestamp
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub role: TurnRole,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub agent: Option<String>,
    pub model: Option<String>,
    /// Cost contribution added to the session totals
    pub cost: f64,
    /// Token contribution added to the session totals
    pub tokens: u64,
}

impl NewTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            tool_calls: Vec::new(),
            agent: None,
            model: None,
            cost: 0.0,
            tokens: 0,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            ..Self::user(content)
        }
    }
}

/// Index-backed session listing entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub project: String,
    pub title: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub turn_count: u32,
    pub file_path: PathBuf,
    pub tags: Vec<String>,
}

/// Parent/child session tree
#[derive(Debug, Clone)]
pub struct SessionTree {
    pub root: SessionTreeNode,
}

/// One node of the tree; `meta` is `None` only for a synthetic root that
/// wraps multiple real roots
#[derive(Debug, Clone)]
pub struct SessionTreeNode {
    pub meta: Option<SessionMeta>,
    pub children: Vec<SessionTreeNode>,
}

// ============================================================================
// SESSION STORE
// ============================================================================

/// Store for sessions and turns
pub struct SessionStore {
    db: Arc<Database>,
    layout: HomeLayout,
    /// Per-session append serialisation; reads never take these locks
    append_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionStore {
    pub fn new(db: Arc<Database>, layout: HomeLayout) -> Self {
        Self {
            db,
            layout,
            append_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The relational index backing this store
    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn append_lock(&self, session_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .append_locks
            .lock()
            .map_err(|_| MemoryError::lock("append registry"))?;
        Ok(locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    fn write_atomic(path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("md.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn file_path(&self, session_id: &str) -> Result<PathBuf> {
        let reader = self.db.reader()?;
        let indexed: Option<String> = reader
            .query_row(
                "SELECT file_path FROM sessions WHERE id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        drop(reader);
        match indexed {
            Some(path) => Ok(PathBuf::from(path)),
            None => {
                // The id encodes its date, so the path is derivable even when
                // the index has no row yet.
                let date = session_id_date(session_id)?;
                Ok(self.layout.session_file(session_id, date))
            }
        }
    }

    // ------------------------------------------------------------------
    // CREATE
    // ------------------------------------------------------------------

    /// Allocate an id and persist an empty session
    pub fn create(&self, opts: CreateSessionOptions) -> Result<Session> {
        let now = Utc::now();
        let id = new_session_id(now.date_naive());
        let path = self.layout.session_file(&id, now.date_naive());

        if path.exists() {
            return Err(MemoryError::Invariant(format!("session id collides: {id}")));
        }
        {
            let reader = self.db.reader()?;
            let exists: Option<String> = reader
                .query_row(
                    "SELECT id FROM sessions WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_some() {
                return Err(MemoryError::Invariant(format!("session id collides: {id}")));
            }
        }

        let session = Session {
            meta: SessionMeta {
                id: id.clone(),
                project: opts.project,
                title: opts.title,
                created: now,
                updated: now,
                agent: opts.agent,
                model: opts.model,
                parent: None,
                branch: None,
                tags: opts.tags,
                total_cost: 0.0,
                total_tokens: 0,
            },
            turns: Vec::new(),
        };

        Self::write_atomic(&path, &write_session(&session))?;
        self.index_session(&session, &path)?;
        tracing::debug!(session = %id, "created session");
        Ok(session)
    }

    fn index_session(&self, session: &Session, path: &Path) -> Result<()> {
        let tags_json = serde_json::to_string(&session.meta.tags)?;
        let writer = self.db.writer()?;
        writer.execute(
            "INSERT INTO sessions (id, project, title, created_at, updated_at, turn_count, file_path, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 project = excluded.project,
                 title = excluded.title,
                 updated_at = excluded.updated_at,
                 turn_count = excluded.turn_count,
                 file_path = excluded.file_path,
                 tags = excluded.tags",
            params![
                session.meta.id,
                session.meta.project,
                session.meta.title,
                session.meta.created.to_rfc3339(),
                session.meta.updated.to_rfc3339(),
                session.turn_count() as i64,
                path.to_string_lossy(),
                tags_json,
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // APPEND
    // ------------------------------------------------------------------

    /// Append a turn: serialise to markdown, mirror into the index, bump the
    /// session's `updated` timestamp. Durable before returning.
    pub fn append(&self, session_id: &str, new_turn: NewTurn) -> Result<Turn> {
        let lock = self.append_lock(session_id)?;
        let _guard = lock.lock().map_err(|_| MemoryError::lock("append"))?;

        let path = self.file_path(session_id)?;
        if !path.exists() {
            return Err(MemoryError::NotFound(format!("session missing: {session_id}")));
        }
        let mut session = self.load_file(&path)?;

        let now = Utc::now();
        // Monotonic with the previous turn even under clock adjustment
        let created_at = session
            .turns
            .last()
            .map(|t| t.created_at.max(now))
            .unwrap_or(now);

        let turn = Turn {
            ordinal: session.turn_count() + 1,
            role: new_turn.role,
            content: new_turn.content,
            tool_calls: new_turn.tool_calls,
            agent: new_turn.agent,
            model: new_turn.model,
            created_at,
        };

        session.turns.push(turn.clone());
        session.meta.updated = created_at;
        session.meta.total_cost += new_turn.cost;
        session.meta.total_tokens += new_turn.tokens;

        Self::write_atomic(&path, &write_session(&session))?;

        {
            let mut writer = self.db.writer()?;
            let tx = writer.transaction()?;
            tx.execute(
                "INSERT INTO turns (session_id, turn_number, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    session_id,
                    turn.ordinal as i64,
                    turn.role.as_str(),
                    turn.content,
                    turn.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(err, _)
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    MemoryError::Invariant(format!(
                        "ordinal conflict on {session_id} turn {}",
                        turn.ordinal
                    ))
                }
                other => MemoryError::Database(other),
            })?;
            let turn_rowid = tx.last_insert_rowid();
            tx.execute(
                "INSERT INTO turns_fts (rowid, content) VALUES (?1, ?2)",
                params![turn_rowid, turn.content],
            )?;
            tx.execute(
                "UPDATE sessions SET updated_at = ?1, turn_count = ?2 WHERE id = ?3",
                params![
                    session.meta.updated.to_rfc3339(),
                    session.turn_count() as i64,
                    session_id,
                ],
            )?;
            tx.commit()?;
        }

        Ok(turn)
    }

    // ------------------------------------------------------------------
    // LOAD / LIST / DELETE
    // ------------------------------------------------------------------

    fn load_file(&self, path: &Path) -> Result<Session> {
        let text = std::fs::read_to_string(path)?;
        parse_session(&text)
    }

    /// Load a session from its markdown file
    ///
    /// Turn timestamps are stitched back from the index when available; the
    /// file stays authoritative for everything else.
    pub fn load(&self, session_id: &str, project: &str) -> Result<Session> {
        let path = self.file_path(session_id)?;
        if !path.exists() {
            return Err(MemoryError::NotFound(format!("session missing: {session_id}")));
        }
        let mut session = self.load_file(&path)?;
        if !project.is_empty() && session.meta.project != project {
            return Err(MemoryError::NotFound(format!(
                "session {session_id} not in project {project}"
            )));
        }

        // Stitch per-turn timestamps from the index
        {
            let reader = self.db.reader()?;
            let mut stmt = reader.prepare(
                "SELECT turn_number, created_at FROM turns WHERE session_id = ?1 ORDER BY turn_number",
            )?;
            let stamps: Vec<(i64, String)> = stmt
                .query_map(params![session_id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .filter_map(|r| r.ok())
                .collect();
            for (ordinal, created) in stamps {
                if let Some(turn) = session.turns.get_mut((ordinal - 1) as usize) {
                    if let Ok(dt) = DateTime::parse_from_rfc3339(&created) {
                        turn.created_at = dt.with_timezone(&Utc);
                    }
                }
            }
        }

        // Index is a cache; rebuild it when it disagrees with the file
        let indexed_count: Option<i64> = {
            let reader = self.db.reader()?;
            reader
                .query_row(
                    "SELECT turn_count FROM sessions WHERE id = ?1",
                    params![session_id],
                    |row| row.get(0),
                )
                .optional()?
        };
        if indexed_count != Some(session.turn_count() as i64) {
            tracing::warn!(session = session_id, "index out of date, rebuilding from file");
            self.reindex(&session, &path)?;
        }

        Ok(session)
    }

    /// Rebuild the index rows for one session from its parsed file
    fn reindex(&self, session: &Session, path: &Path) -> Result<()> {
        {
            let mut writer = self.db.writer()?;
            let tx = writer.transaction()?;
            tx.execute(
                "DELETE FROM turns_fts WHERE rowid IN (SELECT id FROM turns WHERE session_id = ?1)",
                params![session.meta.id],
            )?;
            tx.execute(
                "DELETE FROM turns WHERE session_id = ?1",
                params![session.meta.id],
            )?;
            for turn in &session.turns {
                tx.execute(
                    "INSERT INTO turns (session_id, turn_number, role, content, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        session.meta.id,
                        turn.ordinal as i64,
                        turn.role.as_str(),
                        turn.content,
                        turn.created_at.to_rfc3339(),
                    ],
                )?;
                let rowid = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO turns_fts (rowid, content) VALUES (?1, ?2)",
                    params![rowid, turn.content],
                )?;
            }
            tx.commit()?;
        }
        self.index_session(session, path)
    }

    /// List sessions for a project, most recently updated first
    pub fn list(&self, project: &str) -> Result<Vec<SessionSummary>> {
        self.list_where("WHERE project = ?1", params![project])
    }

    /// List every session across projects, most recently updated first
    pub fn list_all(&self) -> Result<Vec<SessionSummary>> {
        self.list_where("", params![])
    }

    fn list_where(
        &self,
        clause: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<SessionSummary>> {
        let reader = self.db.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT id, project, title, created_at, updated_at, turn_count, file_path, tags
             FROM sessions {clause} ORDER BY updated_at DESC"
        ))?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut summaries = Vec::new();
        for row in rows {
            let (id, project, title, created, updated, turn_count, file_path, tags) = row?;
            let parse_dt = |s: &str| {
                DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|_| MemoryError::Corruption(format!("bad timestamp in index: {s}")))
            };
            summaries.push(SessionSummary {
                id,
                project,
                title,
                created: parse_dt(&created)?,
                updated: parse_dt(&updated)?,
                turn_count: turn_count.max(0) as u32,
                file_path: PathBuf::from(file_path),
                tags: serde_json::from_str(&tags).unwrap_or_default(),
            });
        }
        Ok(summaries)
    }

    /// Remove a session's file, index rows, and FTS rows
    pub fn delete(&self, session_id: &str, project: &str) -> Result<()> {
        let path = self.file_path(session_id)?;
        let row_exists: bool = {
            let reader = self.db.reader()?;
            reader
                .query_row(
                    "SELECT 1 FROM sessions WHERE id = ?1",
                    params![session_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some()
        };
        if !path.exists() && !row_exists {
            return Err(MemoryError::NotFound(format!("session missing: {session_id}")));
        }
        if path.exists() {
            let session = self.load_file(&path)?;
            if !project.is_empty() && session.meta.project != project {
                return Err(MemoryError::NotFound(format!(
                    "session {session_id} not in project {project}"
                )));
            }
            std::fs::remove_file(&path)?;
        }

        let mut writer = self.db.writer()?;
        let tx = writer.transaction()?;
        tx.execute(
            "DELETE FROM turns_fts WHERE rowid IN (SELECT id FROM turns WHERE session_id = ?1)",
            params![session_id],
        )?;
        tx.execute("DELETE FROM turns WHERE session_id = ?1", params![session_id])?;
        tx.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // BRANCH / TREE
    // ------------------------------------------------------------------

    /// Create a branch of `parent_id` containing its first `up_to` turns
    ///
    /// The branch carries a proportional share of the parent's totals and a
    /// `branch:<name>` tag. Turns are deep-copied with their ordinals and
    /// timestamps intact.
    pub fn branch(
        &self,
        parent_id: &str,
        project: &str,
        branch_name: &str,
        up_to: Option<u32>,
    ) -> Result<Session> {
        let parent = self.load(parent_id, project)?;
        let parent_turns = parent.turn_count();
        let up_to = up_to.unwrap_or(parent_turns);
        if up_to > parent_turns {
            return Err(MemoryError::Invariant(format!(
                "branch point {up_to} exceeds parent turn count {parent_turns}"
            )));
        }

        let fraction = if parent_turns == 0 {
            0.0
        } else {
            up_to as f64 / parent_turns as f64
        };

        let now = Utc::now();
        let id = new_session_id(now.date_naive());
        let path = self.layout.session_file(&id, now.date_naive());

        let mut tags = parent.meta.tags.clone();
        tags.push(format!("branch:{branch_name}"));

        let session = Session {
            meta: SessionMeta {
                id: id.clone(),
                project: parent.meta.project.clone(),
                title: parent.meta.title.clone(),
                created: now,
                updated: now,
                agent: parent.meta.agent.clone(),
                model: parent.meta.model.clone(),
                parent: Some(parent_id.to_string()),
                branch: Some(branch_name.to_string()),
                tags,
                total_cost: parent.meta.total_cost * fraction,
                total_tokens: (parent.meta.total_tokens as f64 * fraction).round() as u64,
            },
            turns: parent.turns[..up_to as usize].to_vec(),
        };

        Self::write_atomic(&path, &write_session(&session))?;
        self.reindex(&session, &path)?;
        tracing::debug!(parent = parent_id, branch = %id, name = branch_name, "branched session");
        Ok(session)
    }

    /// Build the parent/child tree for a project
    ///
    /// Multiple roots are wrapped under a synthetic root node with no meta.
    pub fn tree(&self, project: &str) -> Result<SessionTree> {
        let summaries = self.list(project)?;
        let mut metas: Vec<SessionMeta> = Vec::with_capacity(summaries.len());
        for summary in &summaries {
            // Front-matter is authoritative for parent links
            match self.load_file(&summary.file_path) {
                Ok(session) => metas.push(session.meta),
                Err(e) => {
                    tracing::warn!(session = %summary.id, error = %e, "skipping unreadable session in tree");
                }
            }
        }

        let known: std::collections::HashSet<String> =
            metas.iter().map(|m| m.id.clone()).collect();
        let mut children_of: HashMap<String, Vec<SessionMeta>> = HashMap::new();
        let mut roots: Vec<SessionMeta> = Vec::new();
        for meta in metas {
            match meta.parent.as_ref().filter(|p| known.contains(*p)) {
                Some(parent) => children_of.entry(parent.clone()).or_default().push(meta),
                None => roots.push(meta),
            }
        }
        roots.sort_by(|a, b| a.created.cmp(&b.created));

        fn build(meta: SessionMeta, children_of: &mut HashMap<String, Vec<SessionMeta>>) -> SessionTreeNode {
            let mut children = children_of.remove(&meta.id).unwrap_or_default();
            children.sort_by(|a, b| a.created.cmp(&b.created));
            SessionTreeNode {
                meta: Some(meta),
                children: children
                    .into_iter()
                    .map(|c| build(c, children_of))
                    .collect(),
            }
        }

        let mut root_nodes: Vec<SessionTreeNode> = roots
            .into_iter()
            .map(|meta| build(meta, &mut children_of))
            .collect();

        let root = if root_nodes.len() == 1 {
            root_nodes.remove(0)
        } else {
            SessionTreeNode {
                meta: None,
                children: root_nodes,
            }
        };
        Ok(SessionTree { root })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AGENT_MIGRATIONS, AGENT_SCHEMA};
    use tempfile::TempDir;

    fn store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let layout = HomeLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        let db = Database::open(layout.agent_db(), AGENT_SCHEMA, AGENT_MIGRATIONS).unwrap();
        (dir, SessionStore::new(Arc::new(db), layout))
    }

    fn create(store: &SessionStore, project: &str, title: &str) -> Session {
        store
            .create(CreateSessionOptions {
                project: project.into(),
                title: title.into(),
                agent: "c".into(),
                model: "m".into(),
                tags: vec![],
            })
            .unwrap()
    }

    #[test]
    fn test_session_lifecycle() {
        let (_dir, store) = store();
        let session = create(&store, "/p", "Hello");

        store.append(&session.meta.id, NewTurn::user("hi")).unwrap();
        store
            .append(&session.meta.id, NewTurn::assistant("yo"))
            .unwrap();

        let loaded = store.load(&session.meta.id, "/p").unwrap();
        assert_eq!(loaded.turns.len(), 2);
        assert_eq!(loaded.turns[0].content, "hi");
        assert_eq!(loaded.turns[0].ordinal, 1);
        assert_eq!(loaded.turns[1].content, "yo");
        assert_eq!(loaded.turns[1].ordinal, 2);
        assert_eq!(loaded.meta.title, "Hello");

        let listing = store.list("/p").unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].id, session.meta.id);
        assert_eq!(listing[0].turn_count, 2);
    }

    #[test]
    fn test_append_ordinals_monotonic() {
        let (_dir, store) = store();
        let session = create(&store, "/p", "t");
        for i in 0..5 {
            store
                .append(&session.meta.id, NewTurn::user(format!("turn {i}")))
                .unwrap();
        }
        let loaded = store.load(&session.meta.id, "/p").unwrap();
        for (i, turn) in loaded.turns.iter().enumerate() {
            assert_eq!(turn.ordinal, i as u32 + 1);
            if i > 0 {
                assert!(turn.created_at >= loaded.turns[i - 1].created_at);
            }
        }
    }

    #[test]
    fn test_append_to_missing_session_fails() {
        let (_dir, store) = store();
        let err = store
            .append("session-2025-01-01-deadbeef", NewTurn::user("hi"))
            .unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }

    #[test]
    fn test_load_missing_session_fails() {
        let (_dir, store) = store();
        let err = store.load("session-2025-01-01-deadbeef", "/p").unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }

    #[test]
    fn test_delete_cascades() {
        let (_dir, store) = store();
        let session = create(&store, "/p", "t");
        store.append(&session.meta.id, NewTurn::user("hi")).unwrap();
        store.delete(&session.meta.id, "/p").unwrap();

        assert!(store.list("/p").unwrap().is_empty());
        let reader = store.db.reader().unwrap();
        let turns: i64 = reader
            .query_row("SELECT COUNT(*) FROM turns", [], |row| row.get(0))
            .unwrap();
        assert_eq!(turns, 0);
        let fts: i64 = reader
            .query_row("SELECT COUNT(*) FROM turns_fts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(fts, 0);
        drop(reader);

        assert!(matches!(
            store.delete(&session.meta.id, "/p").unwrap_err(),
            MemoryError::NotFound(_)
        ));
    }

    #[test]
    fn test_branch_proportional_totals() {
        let (_dir, store) = store();
        let parent = create(&store, "/p", "t");
        for i in 0..4 {
            store
                .append(
                    &parent.meta.id,
                    NewTurn {
                        cost: 0.25,
                        ..NewTurn::user(format!("turn {i}"))
                    },
                )
                .unwrap();
        }

        let branch = store.branch(&parent.meta.id, "/p", "exp", Some(2)).unwrap();
        assert_eq!(branch.turns.len(), 2);
        assert_eq!(branch.meta.parent.as_deref(), Some(parent.meta.id.as_str()));
        assert_eq!(branch.meta.branch.as_deref(), Some("exp"));
        assert!(branch.meta.tags.iter().any(|t| t == "branch:exp"));
        assert!((branch.meta.total_cost - 0.5).abs() < 1e-9);

        // Branch turns are deep copies with contiguous ordinals
        assert_eq!(branch.turns[0].ordinal, 1);
        assert_eq!(branch.turns[1].ordinal, 2);

        let reloaded = store.load(&branch.meta.id, "/p").unwrap();
        assert_eq!(reloaded.turns.len(), 2);
    }

    #[test]
    fn test_branch_past_end_fails() {
        let (_dir, store) = store();
        let parent = create(&store, "/p", "t");
        store.append(&parent.meta.id, NewTurn::user("hi")).unwrap();
        let err = store
            .branch(&parent.meta.id, "/p", "exp", Some(5))
            .unwrap_err();
        assert!(matches!(err, MemoryError::Invariant(_)));
    }

    #[test]
    fn test_tree_with_synthetic_root() {
        let (_dir, store) = store();
        let a = create(&store, "/p", "a");
        store.append(&a.meta.id, NewTurn::user("hi")).unwrap();
        let _b = create(&store, "/p", "b");
        let branch = store.branch(&a.meta.id, "/p", "exp", None).unwrap();

        let tree = store.tree("/p").unwrap();
        // Two roots (a and b) forces a synthetic wrapper
        assert!(tree.root.meta.is_none());
        assert_eq!(tree.root.children.len(), 2);
        let a_node = tree
            .root
            .children
            .iter()
            .find(|n| n.meta.as_ref().unwrap().id == a.meta.id)
            .unwrap();
        assert_eq!(a_node.children.len(), 1);
        assert_eq!(
            a_node.children[0].meta.as_ref().unwrap().id,
            branch.meta.id
        );
    }

    #[test]
    fn test_index_rebuilt_from_file() {
        let (_dir, store) = store();
        let session = create(&store, "/p", "t");
        store.append(&session.meta.id, NewTurn::user("hi")).unwrap();

        // Corrupt the index; the file must win on next load
        store
            .db
            .writer()
            .unwrap()
            .execute("UPDATE sessions SET turn_count = 99 WHERE id = ?1", params![session.meta.id])
            .unwrap();

        let loaded = store.load(&session.meta.id, "/p").unwrap();
        assert_eq!(loaded.turns.len(), 1);

        let count: i64 = store
            .db
            .reader()
            .unwrap()
            .query_row(
                "SELECT turn_count FROM sessions WHERE id = ?1",
                params![session.meta.id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
