//! Samskara rules
//!
//! Five pattern detectors run over a window of sessions: tool-sequence
//! bigrams, preference phrases, decision phrases, corrections, and
//! convention statements. Each detected pattern with enough occurrences
//! becomes (or reinforces) a consolidation rule with a deterministic id, so
//! repeated cycles converge instead of duplicating. Confidence decays per
//! elapsed day; rules under the prune threshold are deleted.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::Database;
use crate::error::Result;
use crate::session::{Session, TurnRole};

// ============================================================================
// PATTERN KINDS
// ============================================================================

/// What kind of pattern a rule came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    ToolSequence,
    Preference,
    Decision,
    Correction,
    Convention,
}

impl PatternKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternKind::ToolSequence => "tool_sequence",
            PatternKind::Preference => "preference",
            PatternKind::Decision => "decision",
            PatternKind::Correction => "correction",
            PatternKind::Convention => "convention",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "tool_sequence" => Some(PatternKind::ToolSequence),
            "preference" => Some(PatternKind::Preference),
            "decision" => Some(PatternKind::Decision),
            "correction" => Some(PatternKind::Correction),
            "convention" => Some(PatternKind::Convention),
            _ => None,
        }
    }
}

/// A persisted consolidation rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidationRule {
    pub id: String,
    pub category: PatternKind,
    pub content: String,
    pub observation_count: i64,
    pub confidence: f64,
    pub tags: Vec<String>,
    pub project: String,
    pub created_at: DateTime<Utc>,
    pub last_reinforced_at: DateTime<Utc>,
}

/// Samskara engine tunables
#[derive(Debug, Clone)]
pub struct SamskaraConfig {
    /// Occurrences a pattern needs within a window to become a rule
    pub min_observations: usize,
    /// Confidence learning rate on reinforcement
    pub learning_rate: f64,
    /// Multiplicative confidence decay per elapsed day
    pub decay_per_day: f64,
    /// Rules under this confidence are pruned
    pub prune_threshold: f64,
    /// Samskaras at or above this confidence count as active
    pub active_threshold: f64,
}

impl Default for SamskaraConfig {
    fn default() -> Self {
        Self {
            min_observations: 2,
            learning_rate: 0.2,
            decay_per_day: 0.01,
            prune_threshold: 0.1,
            active_threshold: 0.3,
        }
    }
}

/// Outcome of one consolidation cycle
#[derive(Debug, Clone, Default)]
pub struct SamskaraReport {
    pub detected: usize,
    pub created: usize,
    pub reinforced: usize,
    pub pruned: usize,
}

// ============================================================================
// DETECTORS
// ============================================================================

/// Canonicalise pattern content for hashing and dedup
fn canonical(content: &str) -> String {
    content
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '>')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Deterministic rule id from category and canonicalised content
pub fn rule_id(category: PatternKind, content: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", category.as_str(), canonical(content)));
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

fn bump(counts: &mut HashMap<(PatternKind, String), usize>, kind: PatternKind, content: String) {
    *counts.entry((kind, canonical(&content))).or_default() += 1;
}

/// Run all five detectors over the window
fn detect_patterns(sessions: &[&Session]) -> HashMap<(PatternKind, String), usize> {
    let mut counts: HashMap<(PatternKind, String), usize> = HashMap::new();

    for session in sessions {
        // 1. Tool-sequence bigrams across each assistant turn
        for turn in &session.turns {
            if turn.role != TurnRole::Assistant {
                continue;
            }
            for pair in turn.tool_calls.windows(2) {
                bump(
                    &mut counts,
                    PatternKind::ToolSequence,
                    format!("{} > {}", pair[0].name, pair[1].name),
                );
            }
        }

        for turn in &session.turns {
            if turn.role != TurnRole::User {
                continue;
            }
            for raw in turn.content.split(['\n', '.']) {
                let line = raw.trim();
                if line.len() < 8 || line.len() > 200 {
                    continue;
                }
                let lower = line.to_lowercase();

                // 2. Preference phrases
                if lower.contains("i prefer")
                    || lower.starts_with("always ")
                    || lower.starts_with("never ")
                {
                    bump(&mut counts, PatternKind::Preference, line.to_string());
                }
                // 3. Decision phrases
                else if lower.starts_with("we decided")
                    || lower.starts_with("let's go with")
                    || lower.starts_with("going with")
                    || lower.starts_with("use ") && lower.split_whitespace().count() <= 6
                {
                    bump(&mut counts, PatternKind::Decision, line.to_string());
                }
                // 4. Corrections
                else if lower.starts_with("actually")
                    || lower.starts_with("no, ")
                    || lower.contains("instead of")
                    || lower.contains(" instead")
                {
                    bump(&mut counts, PatternKind::Correction, line.to_string());
                }
                // 5. Convention statements
                else if lower.contains("convention")
                    || lower.contains("naming")
                    || lower.contains("style guide")
                    || lower.contains("format as")
                {
                    bump(&mut counts, PatternKind::Convention, line.to_string());
                }
            }
        }
    }
    counts
}

// ============================================================================
// SAMSKARA ENGINE
// ============================================================================

/// Engine over `samskaras` and `consolidation_rules`
pub struct SamskaraEngine {
    db: Arc<Database>,
    config: SamskaraConfig,
}

impl SamskaraEngine {
    pub fn new(db: Arc<Database>, config: SamskaraConfig) -> Self {
        Self { db, config }
    }

    pub fn config(&self) -> &SamskaraConfig {
        &self.config
    }

    /// One consolidation cycle over a window of sessions
    ///
    /// Detected patterns record a samskara row per originating session and
    /// create or reinforce their rule. Decay and pruning run at the end of
    /// the cycle.
    pub fn consolidate(&self, sessions: &[&Session], project: &str) -> Result<SamskaraReport> {
        let now = Utc::now();
        let counts = detect_patterns(sessions);
        let mut report = SamskaraReport::default();

        for ((kind, content), occurrences) in counts {
            if occurrences < self.config.min_observations {
                continue;
            }
            report.detected += 1;
            self.record_samskara(sessions, project, kind, &content, occurrences, now)?;

            let id = rule_id(kind, &content);
            let existing = self.get_rule(&id)?;
            match existing {
                Some(rule) => {
                    let new_confidence = (rule.confidence
                        + self.config.learning_rate * (1.0 - rule.confidence))
                        .clamp(0.0, 1.0);
                    let writer = self.db.writer()?;
                    writer.execute(
                        "UPDATE consolidation_rules
                         SET observation_count = observation_count + ?1,
                             confidence = ?2,
                             last_reinforced_at = ?3
                         WHERE id = ?4",
                        params![occurrences as i64, new_confidence, now.to_rfc3339(), id],
                    )?;
                    report.reinforced += 1;
                }
                None => {
                    let writer = self.db.writer()?;
                    writer.execute(
                        "INSERT INTO consolidation_rules
                             (id, category, content, observation_count, confidence, tags, project,
                              created_at, last_reinforced_at)
                         VALUES (?1, ?2, ?3, ?4, ?5, '[]', ?6, ?7, ?7)",
                        params![
                            id,
                            kind.as_str(),
                            content,
                            occurrences as i64,
                            0.3 + 0.1 * (occurrences.min(7) as f64),
                            project,
                            now.to_rfc3339(),
                        ],
                    )?;
                    report.created += 1;
                }
            }
        }

        self.decay(now)?;
        report.pruned = self.prune()?;
        Ok(report)
    }

    /// Record the raw observed pattern against its sessions
    fn record_samskara(
        &self,
        sessions: &[&Session],
        project: &str,
        kind: PatternKind,
        content: &str,
        occurrences: usize,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let session_id = sessions
            .first()
            .map(|s| s.meta.id.clone())
            .unwrap_or_default();
        let id = format!("{}:{}", rule_id(kind, content), session_id);
        let writer = self.db.writer()?;
        writer.execute(
            "INSERT INTO samskaras (id, session_id, pattern_type, pattern_content,
                                    observation_count, confidence, project, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 observation_count = samskaras.observation_count + excluded.observation_count,
                 confidence = MIN(1.0, samskaras.confidence + 0.1)",
            params![
                id,
                session_id,
                kind.as_str(),
                content,
                occurrences as i64,
                0.3f64,
                project,
                now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    fn get_rule(&self, id: &str) -> Result<Option<ConsolidationRule>> {
        let reader = self.db.reader()?;
        let rule = reader
            .query_row(
                "SELECT id, category, content, observation_count, confidence, tags, project,
                        created_at, last_reinforced_at
                 FROM consolidation_rules WHERE id = ?1",
                params![id],
                Self::row_to_rule,
            )
            .optional()?;
        Ok(rule)
    }

    fn row_to_rule(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConsolidationRule> {
        let parse_dt = |s: String| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now())
        };
        Ok(ConsolidationRule {
            id: row.get(0)?,
            category: PatternKind::parse_name(&row.get::<_, String>(1)?)
                .unwrap_or(PatternKind::Convention),
            content: row.get(2)?,
            observation_count: row.get(3)?,
            confidence: row.get(4)?,
            tags: serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default(),
            project: row.get(6)?,
            created_at: parse_dt(row.get(7)?),
            last_reinforced_at: parse_dt(row.get(8)?),
        })
    }

    /// Apply per-day confidence decay since each rule's last reinforcement
    fn decay(&self, now: DateTime<Utc>) -> Result<()> {
        let rules = self.all_rules()?;
        let writer = self.db.writer()?;
        for rule in rules {
            let days = (now - rule.last_reinforced_at).num_days().max(0) as f64;
            if days < 1.0 {
                continue;
            }
            let decayed = rule.confidence * (1.0 - self.config.decay_per_day).powf(days);
            writer.execute(
                "UPDATE consolidation_rules SET confidence = ?1 WHERE id = ?2",
                params![decayed, rule.id],
            )?;
        }
        Ok(())
    }

    fn prune(&self) -> Result<usize> {
        let writer = self.db.writer()?;
        let pruned = writer.execute(
            "DELETE FROM consolidation_rules WHERE confidence < ?1",
            params![self.config.prune_threshold],
        )?;
        writer.execute(
            "DELETE FROM samskaras WHERE confidence < ?1",
            params![self.config.prune_threshold],
        )?;
        Ok(pruned)
    }

    fn all_rules(&self) -> Result<Vec<ConsolidationRule>> {
        let reader = self.db.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, category, content, observation_count, confidence, tags, project,
                    created_at, last_reinforced_at
             FROM consolidation_rules",
        )?;
        let rules = stmt
            .query_map([], Self::row_to_rule)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rules)
    }

    /// Top active rules for a project by confidence
    pub fn top_rules(&self, project: &str, k: usize) -> Result<Vec<ConsolidationRule>> {
        let reader = self.db.reader()?;
        let mut stmt = reader.prepare(
            "SELECT id, category, content, observation_count, confidence, tags, project,
                    created_at, last_reinforced_at
             FROM consolidation_rules
             WHERE (project = ?1 OR project = '') AND confidence >= ?2
             ORDER BY confidence DESC LIMIT ?3",
        )?;
        let rules = stmt
            .query_map(
                params![project, self.config.active_threshold, k as i64],
                Self::row_to_rule,
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rules)
    }
}

// ============================================================================
// TESTS
// ============================================================================
