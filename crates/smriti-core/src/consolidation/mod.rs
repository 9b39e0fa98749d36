//! Consolidation pipeline
//!
//! Raw sessions become progressively more abstract memories: event chains
//! per session, day/month/year summaries on disk and in the vector store,
//! crystallised vasanas, and samskara rules. The [`ConsolidationPipeline`]
//! drives one full cycle; Nidra decides when cycles run.

pub mod day;
pub mod events;
pub mod indexer;
pub mod month;
pub mod nidra;
pub mod pratyabhijna;
pub mod rasa;
pub mod samskara;
pub mod vasana;
pub mod year;

pub use day::{DaySummary, DayWriter};
pub use events::{
    classify, extract, ChainEvent, CoreSessionClass, EventChain, EventKind, ExtendedDomain,
    SessionClass,
};
pub use indexer::{extract_excerpt, ConsolidationIndexer, SummaryLevel, EXCERPT_CAP};
pub use month::{MonthSummary, MonthWriter};
pub use nidra::{DreamHandler, NidraConfig, NidraCycle, NidraPhase};
pub use pratyabhijna::{
    IndexSelfReport, Pratyabhijna, PratyabhijnaContext, SelfReport, VasanaGlimpse,
};
pub use rasa::{BehavioralAdaptation, NavaRasa, NavaRasaConfig, Rasa, RasaSnapshot};
pub use samskara::{
    rule_id, ConsolidationRule, PatternKind, SamskaraConfig, SamskaraEngine, SamskaraReport,
};
pub use vasana::{
    Valence, Vasana, VasanaConfig, VasanaEngine, VasanaObservation, GLOBAL_PROJECT,
};
pub use year::{YearSummary, YearWriter};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::{MemoryError, Result};
use crate::graph::GraphStore;
use crate::session::{Session, SessionStore, TurnRole};

// ============================================================================
// PIPELINE
// ============================================================================

/// Outcome of one consolidation cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub sessions_seen: usize,
    pub vasanas_crystallised: usize,
    pub vasanas_pruned: usize,
    pub samskara: SamskaraReport,
    pub day_written: bool,
}

/// One full consolidation cycle over recent sessions
pub struct ConsolidationPipeline {
    sessions: Arc<SessionStore>,
    graph: Arc<GraphStore>,
    vasanas: Arc<VasanaEngine>,
    samskaras: Arc<SamskaraEngine>,
    day_writer: Arc<DayWriter>,
    indexer: Arc<ConsolidationIndexer>,
}

impl ConsolidationPipeline {
    pub fn new(
        sessions: Arc<SessionStore>,
        graph: Arc<GraphStore>,
        vasanas: Arc<VasanaEngine>,
        samskaras: Arc<SamskaraEngine>,
        day_writer: Arc<DayWriter>,
        indexer: Arc<ConsolidationIndexer>,
    ) -> Self {
        Self {
            sessions,
            graph,
            vasanas,
            samskaras,
            day_writer,
            indexer,
        }
    }

    /// Run one cycle for `date`: extract chains, feed the vasana and
    /// samskara engines, write and index the day summary, prune
    ///
    /// Cancellation is honoured between stages; no partial summary is
    /// committed after the token fires.
    pub async fn run_cycle(&self, date: NaiveDate, cancel: &CancellationToken) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        let summaries = self.sessions.list_all()?;
        let todays: Vec<_> = summaries
            .into_iter()
            .filter(|s| s.updated.date_naive() == date)
            .collect();

        let mut loaded: Vec<Session> = Vec::new();
        for summary in &todays {
            if cancel.is_cancelled() {
                return Err(MemoryError::Cancelled);
            }
            match self.sessions.load(&summary.id, "") {
                Ok(session) => loaded.push(session),
                Err(e) => {
                    tracing::warn!(session = %summary.id, error = %e, "cycle skips session")
                }
            }
        }
        report.sessions_seen = loaded.len();

        // Vasana observations from user turns, labelled by session class
        for session in &loaded {
            if cancel.is_cancelled() {
                return Err(MemoryError::Cancelled);
            }
            let chain = events::extract(session);
            let label = chain.class.label().to_lowercase();
            for turn in &session.turns {
                if turn.role != TurnRole::User {
                    continue;
                }
                let lower = turn.content.to_lowercase();
                let valence = sentiment(&lower);
                let observation = VasanaObservation {
                    valence,
                    novelty: 0.3,
                    tool_context: session.turns.iter().any(|t| !t.tool_calls.is_empty()),
                    label: label.clone(),
                    at: turn.created_at,
                };
                if self
                    .vasanas
                    .observe(&session.meta.project, &observation)?
                    .is_some()
                {
                    report.vasanas_crystallised += 1;
                }
            }
        }

        // Samskara detection per project window
        let mut by_project: HashMap<String, Vec<&Session>> = HashMap::new();
        for session in &loaded {
            by_project
                .entry(session.meta.project.clone())
                .or_default()
                .push(session);
        }
        for (project, sessions) in &by_project {
            if cancel.is_cancelled() {
                return Err(MemoryError::Cancelled);
            }
            let project_report = self.samskaras.consolidate(sessions, project)?;
            report.samskara.detected += project_report.detected;
            report.samskara.created += project_report.created;
            report.samskara.reinforced += project_report.reinforced;
            report.samskara.pruned += project_report.pruned;
        }

        if cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }

        // Day summary, then its vector index entry
        let (day, markdown) = self.day_writer.write_day(date, false)?;
        report.day_written = day.written;
        if day.written {
            self.indexer
                .index_summary(SummaryLevel::Day, &date.to_string(), None, &markdown)
                .await?;
        }

        let now = Utc::now();
        self.vasanas.promote_global(now)?;
        report.vasanas_pruned = self.vasanas.prune(now)?;

        // Ranking upkeep is best-effort; a sick graph never fails a cycle
        if let Err(e) = self.graph.refresh_pagerank() {
            tracing::warn!(error = %e, "pagerank refresh skipped");
        }

        tracing::info!(
            sessions = report.sessions_seen,
            crystallised = report.vasanas_crystallised,
            rules_created = report.samskara.created,
            "consolidation cycle complete"
        );
        Ok(report)
    }
}

/// Tiny lexicon sentiment in [-1, 1]; enough to tag observations
fn sentiment(text: &str) -> f64 {
    const POSITIVE: &[&str] = &[
        "great", "good", "love", "nice", "perfect", "works", "fixed", "thanks", "excellent",
    ];
    const NEGATIVE: &[&str] = &[
        "bad", "broken", "hate", "wrong", "fails", "failed", "annoying", "bug", "crash",
    ];
    let mut score = 0i32;
    for word in text.split_whitespace() {
        let bare: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
        if POSITIVE.contains(&bare.as_str()) {
            score += 1;
        } else if NEGATIVE.contains(&bare.as_str()) {
            score -= 1;
        }
    }
    (score as f64 / 3.0).clamp(-1.0, 1.0)
}

// ============================================================================
// TESTS
// ============================================================================
