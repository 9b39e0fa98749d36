//! Daily consolidation writer
//!
//! Merges every session updated on a given date into one markdown file:
//! facts learned, per-project session summaries, a tool-use timeline, and
//! the files modified. Writing is idempotent: when the file already exists
//! and `force` is off, counts come from re-parsing its header and no session
//! is loaded.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use rusqlite::params;
use uuid::Uuid;

use super::events::{self, EventChain, EventKind};
use crate::config::HomeLayout;
use crate::db::Database;
use crate::error::{MemoryError, Result};
use crate::events::{EventBus, MemoryEvent};
use crate::policy::PolicyEngine;
use crate::session::{SessionStore, TurnRole};

// ============================================================================
// RESULT TYPE
// ============================================================================

/// Outcome of a day consolidation
#[derive(Debug, Clone)]
pub struct DaySummary {
    pub date: NaiveDate,
    pub project_count: usize,
    pub sessions_processed: usize,
    pub facts_learned: usize,
    /// Whether this call wrote the file (false when it already existed)
    pub written: bool,
    pub path: std::path::PathBuf,
}

// ============================================================================
// DAY WRITER
// ============================================================================

/// Writer for `days/YYYY/MM/DD.md`
pub struct DayWriter {
    sessions: Arc<SessionStore>,
    db: Arc<Database>,
    layout: HomeLayout,
    policy: Arc<dyn PolicyEngine>,
    bus: EventBus,
}

impl DayWriter {
    pub fn new(
        sessions: Arc<SessionStore>,
        db: Arc<Database>,
        layout: HomeLayout,
        policy: Arc<dyn PolicyEngine>,
        bus: EventBus,
    ) -> Self {
        Self {
            sessions,
            db,
            layout,
            policy,
            bus,
        }
    }

    /// Consolidate one day; returns the markdown alongside the summary
    pub fn write_day(&self, date: NaiveDate, force: bool) -> Result<(DaySummary, String)> {
        let path = self.layout.day_file(date);

        if path.exists() && !force {
            // Idempotent path: counts come from the existing header alone
            let existing = std::fs::read_to_string(&path)?;
            let (project_count, sessions_processed, facts_learned) = parse_header(&existing)?;
            tracing::debug!(%date, "day file exists, skipping regeneration");
            return Ok((
                DaySummary {
                    date,
                    project_count,
                    sessions_processed,
                    facts_learned,
                    written: false,
                    path,
                },
                existing,
            ));
        }

        let summaries = self.sessions.list_all()?;
        let todays: Vec<_> = summaries
            .into_iter()
            .filter(|s| s.updated.date_naive() == date)
            .collect();

        let mut chains: Vec<EventChain> = Vec::new();
        let mut per_project: std::collections::BTreeMap<String, Vec<(String, EventChain, String, f64)>> =
            std::collections::BTreeMap::new();
        let mut tool_timeline: Vec<(String, String)> = Vec::new();
        let mut files_modified: Vec<String> = Vec::new();

        for summary in &todays {
            let session = match self.sessions.load(&summary.id, "") {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(session = %summary.id, error = %e, "skipping unreadable session");
                    continue;
                }
            };
            let chain = events::extract(&session);

            for turn in &session.turns {
                if turn.role != TurnRole::Assistant {
                    continue;
                }
                for call in &turn.tool_calls {
                    tool_timeline.push((
                        turn.created_at.format("%H:%M").to_string(),
                        call.name.clone(),
                    ));
                }
            }
            for event in chain.of_kind(EventKind::FileModified) {
                if !files_modified.contains(&event.summary) {
                    files_modified.push(event.summary.clone());
                }
            }

            let branch = session.meta.branch.clone().unwrap_or_default();
            per_project
                .entry(session.meta.project.clone())
                .or_default()
                .push((
                    session.meta.agent.clone(),
                    chain.clone(),
                    branch,
                    session.meta.total_cost,
                ));
            chains.push(chain);
        }

        let facts: Vec<String> = chains
            .iter()
            .flat_map(|c| c.of_kind(EventKind::Fact))
            .map(|e| e.summary.clone())
            .collect();
        let decisions: Vec<String> = chains
            .iter()
            .flat_map(|c| c.of_kind(EventKind::Decision))
            .map(|e| e.summary.clone())
            .collect();

        let markdown = render(
            date,
            per_project.len(),
            todays.len(),
            &facts,
            &decisions,
            &per_project,
            &tool_timeline,
            &files_modified,
        );

        let decision = self.policy.check(
            "consolidation_write",
            &serde_json::json!({ "kind": "day", "date": date.to_string() }),
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

        self.harvest_kartavyas(&chains)?;

        self.bus.emit(MemoryEvent::DayWritten {
            date,
            sessions_processed: todays.len(),
            at: Utc::now(),
        });
        tracing::info!(%date, sessions = todays.len(), "day consolidation written");

        Ok((
            DaySummary {
                date,
                project_count: per_project.len(),
                sessions_processed: todays.len(),
                facts_learned: facts.len(),
                written: true,
                path,
            },
            markdown,
        ))
    }

    /// Mark an open kartavya as done
    pub fn complete_kartavya(&self, id: &str) -> Result<()> {
        let writer = self.db.writer()?;
        let updated = writer.execute(
            "UPDATE kartavyas SET status = 'done', completed_at = ?1
             WHERE id = ?2 AND status = 'open'",
            params![Utc::now().to_rfc3339(), id],
        )?;
        if updated == 0 {
            return Err(MemoryError::NotFound(format!("open kartavya {id}")));
        }
        Ok(())
    }

    /// Action events become open kartavyas, deduplicated by description
    fn harvest_kartavyas(&self, chains: &[EventChain]) -> Result<()> {
        let writer = self.db.writer()?;
        for chain in chains {
            for event in chain.of_kind(EventKind::Action) {
                let exists: i64 = writer.query_row(
                    "SELECT COUNT(*) FROM kartavyas WHERE description = ?1 AND project = ?2",
                    params![event.summary, chain.project],
                    |row| row.get(0),
                )?;
                if exists == 0 {
                    writer.execute(
                        "INSERT INTO kartavyas (id, description, project, status, created_at)
                         VALUES (?1, ?2, ?3, 'open', ?4)",
                        params![
                            Uuid::new_v4().to_string(),
                            event.summary,
                            chain.project,
                            Utc::now().to_rfc3339(),
                        ],
                    )?;
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// RENDERING AND HEADER PARSING
// ============================================================================

#[allow(clippy::too_many_arguments)]
fn render(
    date: NaiveDate,
    project_count: usize,
    session_count: usize,
    facts: &[String],
    decisions: &[String],
    per_project: &std::collections::BTreeMap<String, Vec<(String, EventChain, String, f64)>>,
    tool_timeline: &[(String, String)],
    files_modified: &[String],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Day {date}\n\n"));
    out.push_str(&format!(
        "<!-- projects: {project_count} sessions: {session_count} facts: {} -->\n\n",
        facts.len()
    ));
    out.push_str(&format!(
        "{session_count} sessions across {project_count} projects.\n\n"
    ));

    out.push_str("## Facts Learned\n\n");
    if facts.is_empty() {
        out.push_str("None recorded.\n\n");
    } else {
        for fact in facts {
            out.push_str(&format!("- {fact}\n"));
        }
        out.push('\n');
    }

    if !decisions.is_empty() {
        out.push_str("## Decisions\n\n");
        for decision in decisions {
            out.push_str(&format!("- {decision}\n"));
        }
        out.push('\n');
    }

    for (project, sessions) in per_project {
        out.push_str(&format!("## Project: {project}\n\n"));
        for (provider, chain, branch, cost) in sessions {
            let branch_note = if branch.is_empty() {
                String::new()
            } else {
                format!(", branch {branch}")
            };
            out.push_str(&format!(
                "### {} ({provider}{branch_note}, ${cost:.4})\n\n",
                chain.session_id
            ));
            if chain.narrative.is_empty() {
                out.push_str("(no events)\n\n");
            } else {
                for line in chain.narrative.lines().take(12) {
                    out.push_str(&format!("- {line}\n"));
                }
                out.push('\n');
            }
        }
    }

    if !tool_timeline.is_empty() {
        out.push_str("## Tool Timeline\n\n");
        for (time, tool) in tool_timeline {
            out.push_str(&format!("- {time} {tool}\n"));
        }
        out.push('\n');
    }

    if !files_modified.is_empty() {
        out.push_str("## Files Modified\n\n");
        for file in files_modified {
            out.push_str(&format!("- `{file}`\n"));
        }
        out.push('\n');
    }

    out.push_str(&format!(
        "---\n\nGenerated {}.\n",
        Utc::now().format("%Y-%m-%d %H:%M UTC")
    ));
    out
}

/// Read counts back out of an existing day file's header comment
fn parse_header(markdown: &str) -> Result<(usize, usize, usize)> {
    for line in markdown.lines().take(10) {
        let trimmed = line.trim();
        if let Some(rest) = trimmed
            .strip_prefix("<!-- projects: ")
            .and_then(|r| r.strip_suffix(" -->"))
        {
            let tokens: Vec<&str> = rest.split_whitespace().collect();
            let after = |key: &str| -> usize {
                tokens
                    .iter()
                    .position(|t| *t == key)
                    .and_then(|i| tokens.get(i + 1))
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(0)
            };
            let projects = tokens.first().and_then(|t| t.parse().ok()).unwrap_or(0);
            return Ok((projects, after("sessions:"), after("facts:")));
        }
    }
    Err(MemoryError::Corruption(
        "day file has no parsable header".to_string(),
    ))
}

// ============================================================================
// TESTS
// ============================================================================
