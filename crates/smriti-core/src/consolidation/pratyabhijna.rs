//! Pratyabhijna - self-recognition context
//!
//! On session start the assistant recalls who it has been: top decayed
//! vasanas globally and for the current project, the project's active
//! samskara rules, tool mastery from the Atma self-report, and insights
//! carried over from other projects. The built context is cached per
//! session id and appended to an analytic log table; cache eviction never
//! touches the log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::samskara::SamskaraEngine;
use super::vasana::{VasanaEngine, GLOBAL_PROJECT};
use crate::db::Database;
use crate::error::{MemoryError, Result};

// ============================================================================
// SELF-REPORT SEAM
// ============================================================================

/// The Atma collaborator: reports tool mastery levels in [0, 1]
pub trait SelfReport: Send + Sync {
    fn tool_mastery(&self) -> HashMap<String, f64>;
}

/// Default self-report derived from tool-sequence rules in the index
///
/// Tools that appear in many reinforced sequences count as mastered.
pub struct IndexSelfReport {
    db: Arc<Database>,
}

impl IndexSelfReport {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl SelfReport for IndexSelfReport {
    fn tool_mastery(&self) -> HashMap<String, f64> {
        let mut mastery: HashMap<String, f64> = HashMap::new();
        let Ok(reader) = self.db.reader() else {
            return mastery;
        };
        let Ok(mut stmt) = reader.prepare(
            "SELECT content, observation_count FROM consolidation_rules
             WHERE category = 'tool_sequence'",
        ) else {
            return mastery;
        };
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        });
        if let Ok(rows) = rows {
            for (content, count) in rows.flatten() {
                for tool in content.split('>').map(str::trim).filter(|t| !t.is_empty()) {
                    *mastery.entry(tool.to_string()).or_default() += count as f64;
                }
            }
        }
        // Squash raw counts into [0, 1]
        for value in mastery.values_mut() {
            *value = (*value / (*value + 5.0)).clamp(0.0, 1.0);
        }
        mastery
    }
}

// ============================================================================
// CONTEXT TYPE
// ============================================================================

/// A named tendency with its decayed strength
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VasanaGlimpse {
    pub name: String,
    pub valence: String,
    pub effective_strength: f64,
}

/// The self-recognition context for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PratyabhijnaContext {
    pub session_id: String,
    pub project: String,
    pub global_vasanas: Vec<VasanaGlimpse>,
    pub project_vasanas: Vec<VasanaGlimpse>,
    /// Active samskara rule contents for the project
    pub active_samskaras: Vec<String>,
    /// Top tendencies from other projects, keyed by a short project label
    pub cross_project_insights: HashMap<String, String>,
    pub tool_mastery: HashMap<String, f64>,
    pub narrative: String,
    pub warmup_ms: u64,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// BUILDER
// ============================================================================

/// Builder and cache for self-recognition contexts
pub struct Pratyabhijna {
    db: Arc<Database>,
    vasanas: Arc<VasanaEngine>,
    samskaras: Arc<SamskaraEngine>,
    self_report: Arc<dyn SelfReport>,
    cache: Mutex<HashMap<String, Arc<PratyabhijnaContext>>>,
    top_k: usize,
}

/// Short label for a project path: its final segment
fn project_label(project: &str) -> String {
    project
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or(project)
        .to_string()
}

impl Pratyabhijna {
    pub fn new(
        db: Arc<Database>,
        vasanas: Arc<VasanaEngine>,
        samskaras: Arc<SamskaraEngine>,
        self_report: Arc<dyn SelfReport>,
    ) -> Self {
        Self {
            db,
            vasanas,
            samskaras,
            self_report,
            cache: Mutex::new(HashMap::new()),
            top_k: 5,
        }
    }

    /// Build (or return the cached) context for a session
    pub fn context(&self, session_id: &str, project: &str) -> Result<Arc<PratyabhijnaContext>> {
        {
            let cache = self
                .cache
                .lock()
                .map_err(|_| MemoryError::lock("pratyabhijna cache"))?;
            if let Some(context) = cache.get(session_id) {
                tracing::debug!(session_id, "pratyabhijna cache hit");
                return Ok(context.clone());
            }
        }

        let started = Instant::now();
        let glimpse = |pairs: Vec<(super::vasana::Vasana, f64)>| -> Vec<VasanaGlimpse> {
            pairs
                .into_iter()
                .map(|(v, effective)| VasanaGlimpse {
                    name: v.name,
                    valence: v.valence.as_str().to_string(),
                    effective_strength: effective,
                })
                .collect()
        };

        let global_vasanas = glimpse(self.vasanas.top_decayed(GLOBAL_PROJECT, self.top_k)?);
        let project_vasanas = glimpse(self.vasanas.top_decayed(project, self.top_k)?);
        let active_samskaras: Vec<String> = self
            .samskaras
            .top_rules(project, self.top_k)?
            .into_iter()
            .map(|r| r.content)
            .collect();

        // Other projects' strongest tendencies, current and global excluded
        let mut cross_project_insights = HashMap::new();
        for other in self.vasanas.projects()? {
            if other == project {
                continue;
            }
            if let Some((top, _)) = self.vasanas.top_decayed(&other, 1)?.into_iter().next() {
                cross_project_insights.insert(project_label(&other), top.name);
            }
        }

        let tool_mastery = self.self_report.tool_mastery();
        let narrative = render_narrative(
            project,
            &global_vasanas,
            &project_vasanas,
            &active_samskaras,
            &cross_project_insights,
        );

        let context = Arc::new(PratyabhijnaContext {
            session_id: session_id.to_string(),
            project: project.to_string(),
            global_vasanas,
            project_vasanas,
            active_samskaras,
            cross_project_insights,
            tool_mastery,
            narrative,
            warmup_ms: started.elapsed().as_millis() as u64,
            created_at: Utc::now(),
        });

        self.persist(&context)?;
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| MemoryError::lock("pratyabhijna cache"))?;
        cache.insert(session_id.to_string(), context.clone());
        Ok(context)
    }

    /// Append to the analytic log; rows outlive cache eviction
    fn persist(&self, context: &PratyabhijnaContext) -> Result<()> {
        let writer = self.db.writer()?;
        writer.execute(
            "INSERT INTO pratyabhijna_context (session_id, project, context, warmup_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(session_id) DO UPDATE SET
                 context = excluded.context,
                 warmup_ms = excluded.warmup_ms,
                 created_at = excluded.created_at",
            params![
                context.session_id,
                context.project,
                serde_json::to_string(context)?,
                context.warmup_ms as i64,
                context.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Drop one session's cached context; the log row stays
    pub fn evict(&self, session_id: &str) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.remove(session_id);
        }
    }

    /// Drop the whole cache; log rows stay
    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}

fn render_narrative(
    project: &str,
    global: &[VasanaGlimpse],
    local: &[VasanaGlimpse],
    samskaras: &[String],
    cross: &HashMap<String, String>,
) -> String {
    let mut out = String::new();
    out.push_str(&format!("Working in {project}.\n"));
    if let Some(top) = global.first() {
        out.push_str(&format!(
            "Overall tendency: {} ({:.2}).\n",
            top.name, top.effective_strength
        ));
    }
    if let Some(top) = local.first() {
        out.push_str(&format!(
            "In this project: {} ({:.2}).\n",
            top.name, top.effective_strength
        ));
    }
    if !samskaras.is_empty() {
        out.push_str(&format!("Standing rules: {}.\n", samskaras.join("; ")));
    }
    if !cross.is_empty() {
        let mut labels: Vec<(&String, &String)> = cross.iter().collect();
        labels.sort();
        let parts: Vec<String> = labels
            .into_iter()
            .map(|(label, name)| format!("{label}: {name}"))
            .collect();
        out.push_str(&format!("Elsewhere: {}.\n", parts.join(", ")));
    }
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidation::samskara::SamskaraConfig;
    use crate::consolidation::vasana::VasanaConfig;
    use crate::db::{AGENT_MIGRATIONS, AGENT_SCHEMA};
    use tempfile::TempDir;

    struct FixedReport;
    impl SelfReport for FixedReport {
        fn tool_mastery(&self) -> HashMap<String, f64> {
            HashMap::from([("edit_file".to_string(), 0.9)])
        }
    }

    fn seed_vasana(db: &Database, id: &str, name: &str, project: &str) {
        db.writer()
            .unwrap()
            .execute(
                "INSERT INTO vasanas (id, name, description, valence, strength, stability, project, created_at, last_activated, activation_count)
                 VALUES (?1, ?2, '', 'positive', 0.8, 0.7, ?3, ?4, ?4, 4)",
                params![id, name, project, Utc::now().to_rfc3339()],
            )
            .unwrap();
    }

    fn builder() -> (TempDir, Arc<Database>, Pratyabhijna) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::open(dir.path().join("agent.db"), AGENT_SCHEMA, AGENT_MIGRATIONS).unwrap(),
        );
        let vasanas = Arc::new(VasanaEngine::new(db.clone(), VasanaConfig::default()));
        let samskaras = Arc::new(SamskaraEngine::new(db.clone(), SamskaraConfig::default()));
        let builder = Pratyabhijna::new(db.clone(), vasanas, samskaras, Arc::new(FixedReport));
        (dir, db, builder)
    }

    #[test]
    fn test_context_gathers_all_sections() {
        let (_dir, db, builder) = builder();
        seed_vasana(&db, "g1", "thoroughness", GLOBAL_PROJECT);
        seed_vasana(&db, "p1", "short-replies", "/home/u/api");
        seed_vasana(&db, "q1", "deep-dives", "/home/u/web");

        let context = builder.context("session-1", "/home/u/api").unwrap();
        assert_eq!(context.global_vasanas[0].name, "thoroughness");
        assert_eq!(context.project_vasanas[0].name, "short-replies");
        assert_eq!(
            context.cross_project_insights.get("web").map(String::as_str),
            Some("deep-dives")
        );
        // Current project and the global bucket never appear as insights
        assert!(!context.cross_project_insights.contains_key("api"));
        assert_eq!(context.tool_mastery["edit_file"], 0.9);
        assert!(context.narrative.contains("thoroughness"));
    }

    #[test]
    fn test_cache_and_eviction_keep_log_rows() {
        let (_dir, db, builder) = builder();
        let first = builder.context("session-1", "/p").unwrap();
        let second = builder.context("session-1", "/p").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        builder.evict("session-1");
        let third = builder.context("session-1", "/p").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));

        // The analytic log still holds exactly one row for the session
        let count: i64 = db
            .reader()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM pratyabhijna_context WHERE session_id = 'session-1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);

        builder.clear_cache();
        let count_after_clear: i64 = db
            .reader()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM pratyabhijna_context", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count_after_clear, 1);
    }

    #[test]
    fn test_project_label() {
        assert_eq!(project_label("/home/u/api"), "api");
        assert_eq!(project_label("/home/u/api/"), "api");
        assert_eq!(project_label("solo"), "solo");
    }
}
