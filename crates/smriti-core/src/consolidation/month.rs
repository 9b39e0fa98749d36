//! Monthly consolidation writer
//!
//! Aggregates a month of day files and index state for one project (or all
//! projects): vasanas crystallised in the period, top rules, tool stats,
//! cost totals, kartavya counts, and a few recommendations derived from the
//! strongest rules.

use std::collections::BTreeMap;
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

/// Outcome of a month consolidation
#[derive(Debug, Clone)]
pub struct MonthSummary {
    pub year: i32,
    pub month: u32,
    pub project: Option<String>,
    pub days_aggregated: usize,
    pub sessions_in_month: usize,
    pub total_cost: f64,
    pub written: bool,
    pub path: std::path::PathBuf,
}

// ============================================================================
// MONTH WRITER
// ============================================================================

/// Writer for `months/YYYY/MM.md` and per-project variants
pub struct MonthWriter {
    sessions: Arc<SessionStore>,
    db: Arc<Database>,
    layout: HomeLayout,
    policy: Arc<dyn PolicyEngine>,
}

impl MonthWriter {
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

    /// Consolidate one month
    pub fn write_month(
        &self,
        year: i32,
        month: u32,
        project: Option<&str>,
        force: bool,
    ) -> Result<(MonthSummary, String)> {
        if !(1..=12).contains(&month) {
            return Err(MemoryError::Invariant(format!("bad month: {month}")));
        }
        let hash = project.map(project_hash);
        let path = self.layout.month_file(year, month, hash.as_deref());

        if path.exists() && !force {
            let existing = std::fs::read_to_string(&path)?;
            let (days, sessions) = parse_header(&existing)?;
            return Ok((
                MonthSummary {
                    year,
                    month,
                    project: project.map(String::from),
                    days_aggregated: days,
                    sessions_in_month: sessions,
                    total_cost: 0.0,
                    written: false,
                    path,
                },
                existing,
            ));
        }

        let period = format!("{year:04}-{month:02}");

        // Sessions in the month; cost comes from the authoritative files
        let mut session_count = 0usize;
        let mut total_cost = 0.0f64;
        for summary in self.sessions.list_all()? {
            if summary.updated.year() != year || summary.updated.month() != month {
                continue;
            }
            if project.is_some_and(|p| summary.project != p) {
                continue;
            }
            session_count += 1;
            match self.sessions.load(&summary.id, "") {
                Ok(session) => total_cost += session.meta.total_cost,
                Err(e) => tracing::warn!(session = %summary.id, error = %e, "cost skipped"),
            }
        }

        // Day files present for the month
        let days_dir = self
            .layout
            .root()
            .join("days")
            .join(format!("{year:04}"))
            .join(format!("{month:02}"));
        let mut day_files: Vec<std::path::PathBuf> = match std::fs::read_dir(&days_dir) {
            Ok(entries) => entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.extension().is_some_and(|e| e == "md"))
                .collect(),
            Err(_) => Vec::new(),
        };
        day_files.sort();

        // Tool stats from the day files' timelines
        let mut tool_counts: BTreeMap<String, usize> = BTreeMap::new();
        for day_file in &day_files {
            if let Ok(text) = std::fs::read_to_string(day_file) {
                let mut in_timeline = false;
                for line in text.lines() {
                    if line.starts_with("## ") {
                        in_timeline = line.trim() == "## Tool Timeline";
                        continue;
                    }
                    if in_timeline {
                        if let Some(rest) = line.trim().strip_prefix("- ") {
                            if let Some((_, tool)) = rest.split_once(' ') {
                                *tool_counts.entry(tool.trim().to_string()).or_default() += 1;
                            }
                        }
                    }
                }
            }
        }

        let vasanas = self.vasanas_in_period(&period, project)?;
        let rules = self.top_rules(project, 5)?;
        let (open_kartavyas, done_kartavyas) = self.kartavya_counts(project)?;

        let markdown = render(
            year,
            month,
            project,
            day_files.len(),
            session_count,
            total_cost,
            &vasanas,
            &rules,
            &tool_counts,
            open_kartavyas,
            done_kartavyas,
        );

        let decision = self.policy.check(
            "consolidation_write",
            &serde_json::json!({ "kind": "month", "period": period }),
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
        tracing::info!(period, sessions = session_count, "month consolidation written");

        Ok((
            MonthSummary {
                year,
                month,
                project: project.map(String::from),
                days_aggregated: day_files.len(),
                sessions_in_month: session_count,
                total_cost,
                written: true,
                path,
            },
            markdown,
        ))
    }

    /// Vasanas whose crystallisation falls inside the period
    fn vasanas_in_period(
        &self,
        period: &str,
        project: Option<&str>,
    ) -> Result<Vec<(String, f64, String)>> {
        let reader = self.db.reader()?;
        let mut stmt = reader.prepare(
            "SELECT name, strength, valence FROM vasanas
             WHERE created_at LIKE ?1 AND (?2 IS NULL OR project = ?2 OR project = '__global__')
             ORDER BY strength DESC LIMIT 10",
        )?;
        let rows = stmt
            .query_map(params![format!("{period}%"), project], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    fn top_rules(&self, project: Option<&str>, limit: usize) -> Result<Vec<(String, String, f64)>> {
        let reader = self.db.reader()?;
        let mut stmt = reader.prepare(
            "SELECT category, content, confidence FROM consolidation_rules
             WHERE (?1 IS NULL OR project = ?1 OR project = '')
             ORDER BY confidence DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![project, limit as i64], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    fn kartavya_counts(&self, project: Option<&str>) -> Result<(usize, usize)> {
        let reader = self.db.reader()?;
        let count = |status: &str| -> Result<usize> {
            let n: i64 = reader.query_row(
                "SELECT COUNT(*) FROM kartavyas
                 WHERE status = ?1 AND (?2 IS NULL OR project = ?2)",
                params![status, project],
                |row| row.get(0),
            )?;
            Ok(n.max(0) as usize)
        };
        Ok((count("open")?, count("done")?))
    }
}

// ============================================================================
// RENDERING AND HEADER PARSING
// ============================================================================

#[allow(clippy::too_many_arguments)]
fn render(
    year: i32,
    month: u32,
    project: Option<&str>,
    day_count: usize,
    session_count: usize,
    total_cost: f64,
    vasanas: &[(String, f64, String)],
    rules: &[(String, String, f64)],
    tool_counts: &BTreeMap<String, usize>,
    open_kartavyas: usize,
    done_kartavyas: usize,
) -> String {
    let mut out = String::new();
    match project {
        Some(project) => out.push_str(&format!("# Month {year:04}-{month:02} - {project}\n\n")),
        None => out.push_str(&format!("# Month {year:04}-{month:02}\n\n")),
    }
    out.push_str(&format!(
        "<!-- days: {day_count} sessions: {session_count} -->\n\n"
    ));
    out.push_str(&format!(
        "{session_count} sessions over {day_count} consolidated days; total cost ${total_cost:.2}.\n\n"
    ));

    out.push_str("## Vasanas Crystallised\n\n");
    if vasanas.is_empty() {
        out.push_str("None this period.\n\n");
    } else {
        for (name, strength, valence) in vasanas {
            out.push_str(&format!("- **{name}** ({valence}, strength {strength:.2})\n"));
        }
        out.push('\n');
    }

    out.push_str("## Top Rules\n\n");
    if rules.is_empty() {
        out.push_str("None yet.\n\n");
    } else {
        for (category, content, confidence) in rules {
            out.push_str(&format!("- [{category}] {content} ({confidence:.2})\n"));
        }
        out.push('\n');
    }

    if !tool_counts.is_empty() {
        out.push_str("## Tool Usage\n\n");
        let mut sorted: Vec<(&String, &usize)> = tool_counts.iter().collect();
        sorted.sort_by(|a, b| b.1.cmp(a.1));
        for (tool, count) in sorted.into_iter().take(10) {
            out.push_str(&format!("- {tool}: {count}\n"));
        }
        out.push('\n');
    }

    out.push_str(&format!(
        "## Kartavyas\n\n{open_kartavyas} open, {done_kartavyas} completed.\n\n"
    ));

    if !rules.is_empty() {
        out.push_str("## Recommendations\n\n");
        for (_, content, _) in rules.iter().take(3) {
            out.push_str(&format!("- Keep applying: {content}\n"));
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
            .strip_prefix("<!-- days: ")
            .and_then(|r| r.strip_suffix(" -->"))
        {
            let tokens: Vec<&str> = rest.split_whitespace().collect();
            let days = tokens.first().and_then(|t| t.parse().ok()).unwrap_or(0);
            let sessions = tokens
                .iter()
                .position(|t| *t == "sessions:")
                .and_then(|i| tokens.get(i + 1))
                .and_then(|t| t.parse().ok())
                .unwrap_or(0);
            return Ok((days, sessions));
        }
    }
    Err(MemoryError::Corruption(
        "month file has no parsable header".to_string(),
    ))
}

// ============================================================================
// TESTS
// ============================================================================
