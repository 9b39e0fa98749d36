//! Yearly consolidation writer
//!
//! Rolls twelve months up into trends: session counts per month, the
//! strongest vasanas, and total activity. Idempotent like the other writers.

use std::sync::Arc;

use chrono::{Datelike, Utc};
use rusqlite::params;

use crate::config::{project_hash, HomeLayout};
use crate::db::Database;
use crate::error::{MemoryError, Result};
use crate::policy::PolicyEngine;
use crate::session::SessionStore;

// ============================================================================
// RESULT TYPE
// ============================================================================

/// Outcome of a year consolidation
#[derive(Debug, Clone)]
pub struct YearSummary {
    pub year: i32,
    pub project: Option<String>,
    pub months_aggregated: usize,
    pub sessions_in_year: usize,
    pub written: bool,
    pub path: std::path::PathBuf,
}

// ============================================================================
// YEAR WRITER
// ============================================================================

/// Writer for `years/YYYY.md` and per-project variants
pub struct YearWriter {
    sessions: Arc<SessionStore>,
    db: Arc<Database>,
    layout: HomeLayout,
    policy: Arc<dyn PolicyEngine>,
}

impl YearWriter {
    pub fn new(
        sessions: Arc<SessionStore>,
        db: Arc<Database>,
        layout: HomeLayout,
        policy: Arc<dyn PolicyEngine>,
    ) -> Self {
        Self {
            sessions,
            db,
            layout,
            policy,
        }
    }

    /// Consolidate one year
    pub fn write_year(
        &self,
        year: i32,
        project: Option<&str>,
        force: bool,
    ) -> Result<(YearSummary, String)> {
        let hash = project.map(project_hash);
        let path = self.layout.year_file(year, hash.as_deref());

        if path.exists() && !force {
            let existing = std::fs::read_to_string(&path)?;
            let (months, sessions) = parse_header(&existing)?;
            return Ok((
                YearSummary {
                    year,
                    project: project.map(String::from),
                    months_aggregated: months,
                    sessions_in_year: sessions,
                    written: false,
                    path,
                },
                existing,
            ));
        }

        // Per-month session counts become the trend line
        let mut per_month = [0usize; 12];
        let mut total = 0usize;
        for summary in self.sessions.list_all()? {
            if summary.updated.year() != year {
                continue;
            }
            if project.is_some_and(|p| summary.project != p) {
                continue;
            }
            per_month[(summary.updated.month0()) as usize] += 1;
            total += 1;
        }

        // Month files already consolidated for the year
        let months_dir = self.layout.root().join("months").join(format!("{year:04}"));
        let month_files = match std::fs::read_dir(&months_dir) {
            Ok(entries) => entries
                .flatten()
                .filter(|e| e.path().extension().is_some_and(|x| x == "md"))
                .count(),
            Err(_) => 0,
        };

        let top_vasanas = self.top_vasanas(project, 10)?;
        let markdown = render(year, project, month_files, total, &per_month, &top_vasanas);

        let decision = self.policy.check(
            "consolidation_write",
            &serde_json::json!({ "kind": "year", "year": year }),
        );
        if !decision.allowed {
            return Err(MemoryError::Policy(
                decision.reason.unwrap_or_else(|| "denied".to_string()),
            ));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("md.tmp");
        std::fs::write(&tmp, &markdown)?;
        std::fs::rename(&tmp, &path)?;
        tracing::info!(year, sessions = total, "year consolidation written");

        Ok((
            YearSummary {
                year,
                project: project.map(String::from),
                months_aggregated: month_files,
                sessions_in_year: total,
                written: true,
                path,
            },
            markdown,
        ))
    }

    fn top_vasanas(&self, project: Option<&str>, limit: usize) -> Result<Vec<(String, f64, i64)>> {
        let reader = self.db.reader()?;
        let mut stmt = reader.prepare(
            "SELECT name, strength, activation_count FROM vasanas
             WHERE (?1 IS NULL OR project = ?1 OR project = '__global__')
             ORDER BY strength DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![project, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

// ============================================================================
// RENDERING AND HEADER PARSING
// ============================================================================

fn render(
    year: i32,
    project: Option<&str>,
    month_files: usize,
    total_sessions: usize,
    per_month: &[usize; 12],
    top_vasanas: &[(String, f64, i64)],
) -> String {
    let mut out = String::new();
    match project {
        Some(project) => out.push_str(&format!("# Year {year} - {project}\n\n")),
        None => out.push_str(&format!("# Year {year}\n\n")),
    }
    out.push_str(&format!(
        "<!-- months: {month_files} sessions: {total_sessions} -->\n\n"
    ));
    out.push_str(&format!(
        "{total_sessions} sessions; {month_files} months consolidated.\n\n"
    ));

    out.push_str("## Sessions by Month\n\n");
    for (i, count) in per_month.iter().enumerate() {
        if *count > 0 {
            out.push_str(&format!("- {year}-{:02}: {count}\n", i + 1));
        }
    }
    out.push('\n');

    out.push_str("## Top Vasanas\n\n");
    if top_vasanas.is_empty() {
        out.push_str("None crystallised yet.\n\n");
    } else {
        for (name, strength, activations) in top_vasanas {
            out.push_str(&format!(
                "- **{name}** (strength {strength:.2}, activated {activations} times)\n"
            ));
        }
        out.push('\n');
    }

    out.push_str(&format!(
        "---\n\nGenerated {}.\n",
        Utc::now().format("%Y-%m-%d %H:%M UTC")
    ));
    out
}

fn parse_header(markdown: &str) -> Result<(usize, usize)> {
    for line in markdown.lines().take(10) {
        if let Some(rest) = line
            .trim()
            .strip_prefix("<!-- months: ")
            .and_then(|r| r.strip_suffix(" -->"))
        {
            let tokens: Vec<&str> = rest.split_whitespace().collect();
            let months = tokens.first().and_then(|t| t.parse().ok()).unwrap_or(0);
            let sessions = tokens
                .iter()
                .position(|t| *t == "sessions:")
                .and_then(|i| tokens.get(i + 1))
                .and_then(|t| t.parse().ok())
                .unwrap_or(0);
            return Ok((months, sessions));
        }
    }
    Err(MemoryError::Corruption(
        "year file has no parsable header".to_string(),
    ))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AGENT_MIGRATIONS, AGENT_SCHEMA};
    use crate::policy::AllowAll;
    use crate::session::{CreateSessionOptions, NewTurn, SessionStore};
    use tempfile::TempDir;

    #[test]
    fn test_write_year_and_idempotence() {
        let dir = TempDir::new().unwrap();
        let layout = HomeLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        let db = Arc::new(Database::open(layout.agent_db(), AGENT_SCHEMA, AGENT_MIGRATIONS).unwrap());
        let sessions = Arc::new(SessionStore::new(db.clone(), layout.clone()));
        let writer = YearWriter::new(sessions.clone(), db, layout, Arc::new(AllowAll));

        let session = sessions
            .create(CreateSessionOptions {
                project: "/p".into(),
                title: "t".into(),
                agent: "a".into(),
                model: "m".into(),
                tags: vec![],
            })
            .unwrap();
        sessions.append(&session.meta.id, NewTurn::user("hi")).unwrap();

        let year = Utc::now().year();
        let (first, markdown) = writer.write_year(year, None, false).unwrap();
        assert!(first.written);
        assert_eq!(first.sessions_in_year, 1);
        assert!(markdown.contains("## Sessions by Month"));

        let (second, _) = writer.write_year(year, None, false).unwrap();
        assert!(!second.written);
        assert_eq!(second.sessions_in_year, 1);
    }
}
