//! Vasana engine
//!
//! A vasana is a crystallised behavioural tendency. Observations from user
//! turns stream into a per-project Bayesian online change-point detector
//! (Adams-MacKay, Gaussian predictive); when the current regime is both long
//! and certain enough, it crystallises into a vasana row. Matching
//! observations later reinforce it; strength decays between activations and
//! weak vasanas are pruned during consolidation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::Database;
use crate::error::{MemoryError, Result};

/// Project key for promoted, cross-project vasanas
pub const GLOBAL_PROJECT: &str = "__global__";

// ============================================================================
// TYPES
// ============================================================================

/// Emotional direction of a tendency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Valence {
    Positive,
    Negative,
    Neutral,
}

impl Valence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Valence::Positive => "positive",
            Valence::Negative => "negative",
            Valence::Neutral => "neutral",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "positive" => Valence::Positive,
            "negative" => Valence::Negative,
            _ => Valence::Neutral,
        }
    }

    fn from_mean(mean: f64) -> Self {
        if mean > 0.1 {
            Valence::Positive
        } else if mean < -0.1 {
            Valence::Negative
        } else {
            Valence::Neutral
        }
    }
}

/// A crystallised behavioural tendency
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vasana {
    pub id: String,
    pub name: String,
    pub description: String,
    pub valence: Valence,
    /// Clamped to [0, 1]
    pub strength: f64,
    /// Clamped to [0, 1]
    pub stability: f64,
    pub project: String,
    pub created_at: DateTime<Utc>,
    pub last_activated: DateTime<Utc>,
    pub activation_count: i64,
}

/// One observation from a user turn
#[derive(Debug, Clone)]
pub struct VasanaObservation {
    /// Emotional direction of the observation, in [-1, 1]
    pub valence: f64,
    /// How novel the content is, in [0, 1]
    pub novelty: f64,
    /// Whether tools were in play
    pub tool_context: bool,
    /// Short label naming the tendency (topic, habit, tool)
    pub label: String,
    pub at: DateTime<Utc>,
}

/// Vasana engine tunables
#[derive(Debug, Clone)]
pub struct VasanaConfig {
    /// Observations a regime needs before it can crystallise
    pub min_observations: usize,
    /// Run-length posterior mass required to crystallise
    pub crystallisation_threshold: f64,
    /// Constant change-point hazard
    pub hazard: f64,
    /// Reinforcement learning rate
    pub learning_rate: f64,
    /// Strength half-life between activations, in days
    pub half_life_days: f64,
    /// Effective strength under this marks a vasana for pruning
    pub prune_threshold: f64,
}

impl Default for VasanaConfig {
    fn default() -> Self {
        Self {
            min_observations: 5,
            crystallisation_threshold: 0.5,
            hazard: 1.0 / 50.0,
            learning_rate: 0.2,
            half_life_days: 30.0,
            prune_threshold: 0.1,
        }
    }
}

// ============================================================================
// CHANGE-POINT DETECTOR
// ============================================================================

/// Sufficient statistics for one run-length hypothesis
#[derive(Debug, Clone, Copy, Default)]
struct RunStat {
    n: f64,
    sum: f64,
}

/// Per-project detector state
#[derive(Debug, Default)]
struct Stream {
    /// posterior[i] is the probability of run length i
    posterior: Vec<f64>,
    stats: Vec<RunStat>,
    recent_labels: VecDeque<String>,
}

const PRIOR_MEAN: f64 = 0.0;
const PRIOR_VAR: f64 = 1.0;
const OBS_VAR: f64 = 0.25;
const MAX_RUN_LENGTH: usize = 200;

fn normal_pdf(x: f64, mean: f64, var: f64) -> f64 {
    let var = var.max(1e-9);
    (-((x - mean).powi(2)) / (2.0 * var)).exp() / (2.0 * std::f64::consts::PI * var).sqrt()
}

impl Stream {
    fn new() -> Self {
        Self {
            posterior: vec![1.0],
            stats: vec![RunStat::default()],
            recent_labels: VecDeque::new(),
        }
    }

    /// One BOCD update; returns the most probable run length and its mass
    fn observe(&mut self, x: f64, hazard: f64) -> (usize, f64) {
        let len = self.posterior.len();
        let mut grown = vec![0.0; len + 1];
        let mut grown_stats = vec![RunStat::default(); len + 1];
        let mut changepoint_mass = 0.0;

        for r in 0..len {
            let stat = self.stats[r];
            // Posterior predictive under hypothesis r
            let precision = 1.0 / PRIOR_VAR + stat.n / OBS_VAR;
            let post_var = 1.0 / precision;
            let post_mean = post_var * (PRIOR_MEAN / PRIOR_VAR + stat.sum / OBS_VAR);
            let predictive = normal_pdf(x, post_mean, post_var + OBS_VAR);

            let mass = self.posterior[r] * predictive;
            grown[r + 1] = mass * (1.0 - hazard);
            grown_stats[r + 1] = RunStat {
                n: stat.n + 1.0,
                sum: stat.sum + x,
            };
            changepoint_mass += mass * hazard;
        }
        grown[0] = changepoint_mass;

        // Normalise; a numerically dead posterior restarts fresh
        let total: f64 = grown.iter().sum();
        if total <= f64::MIN_POSITIVE {
            *self = Stream::new();
            return (0, 1.0);
        }
        for value in &mut grown {
            *value /= total;
        }

        if grown.len() > MAX_RUN_LENGTH {
            // Fold the tail into the longest retained hypothesis
            let tail: f64 = grown[MAX_RUN_LENGTH..].iter().sum();
            grown.truncate(MAX_RUN_LENGTH);
            grown_stats.truncate(MAX_RUN_LENGTH);
            if let Some(last) = grown.last_mut() {
                *last += tail;
            }
        }

        self.posterior = grown;
        self.stats = grown_stats;

        let (best_run, best_mass) = self
            .posterior
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(i, p)| (i, *p))
            .unwrap_or((0, 1.0));
        (best_run, best_mass)
    }

    fn run_mean(&self, run: usize) -> f64 {
        let stat = self.stats.get(run).copied().unwrap_or_default();
        if stat.n > 0.0 {
            stat.sum / stat.n
        } else {
            0.0
        }
    }

    fn dominant_label(&self) -> Option<String> {
        let mut counts: HashMap<&String, usize> = HashMap::new();
        for label in &self.recent_labels {
            *counts.entry(label).or_default() += 1;
        }
        counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(label, _)| label.clone())
    }
}

// ============================================================================
// VASANA ENGINE
// ============================================================================

/// Engine over the `vasanas` table plus in-memory detector streams
pub struct VasanaEngine {
    db: Arc<Database>,
    config: VasanaConfig,
    streams: Mutex<HashMap<String, Stream>>,
}

impl VasanaEngine {
    pub fn new(db: Arc<Database>, config: VasanaConfig) -> Self {
        Self {
            db,
            config,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &VasanaConfig {
        &self.config
    }

    /// Feed one observation; returns the vasana if this one crystallised it
    pub fn observe(
        &self,
        project: &str,
        observation: &VasanaObservation,
    ) -> Result<Option<Vasana>> {
        let signal = observation.valence.clamp(-1.0, 1.0)
            + 0.2 * observation.novelty.clamp(0.0, 1.0)
            + if observation.tool_context { 0.1 } else { 0.0 };

        let (run, mass, mean, label) = {
            let mut streams = self
                .streams
                .lock()
                .map_err(|_| MemoryError::lock("vasana streams"))?;
            let stream = streams
                .entry(project.to_string())
                .or_insert_with(Stream::new);
            stream.recent_labels.push_back(observation.label.clone());
            if stream.recent_labels.len() > 64 {
                stream.recent_labels.pop_front();
            }
            let (run, mass) = stream.observe(signal, self.config.hazard);
            let mean = stream.run_mean(run);
            let label = stream.dominant_label();
            if run >= self.config.min_observations
                && mass >= self.config.crystallisation_threshold
            {
                // Crystallised: restart the detector so the same regime
                // does not fire again
                streams.insert(project.to_string(), Stream::new());
                (run, mass, mean, label)
            } else {
                return Ok(None);
            }
        };

        let name = label.unwrap_or_else(|| observation.label.clone());
        // Re-observing an already crystallised tendency reinforces instead
        if let Some(existing) = self.find(project, &name)? {
            self.reinforce(&existing.id, signal.clamp(0.0, 1.0))?;
            return Ok(None);
        }

        let vasana = Vasana {
            id: Uuid::new_v4().to_string(),
            name,
            description: format!("Crystallised after {run} consistent observations"),
            valence: Valence::from_mean(mean),
            strength: mass.clamp(0.3, 1.0),
            stability: 0.5,
            project: project.to_string(),
            created_at: observation.at,
            last_activated: observation.at,
            activation_count: run as i64,
        };
        self.insert(&vasana)?;
        tracing::info!(project, name = %vasana.name, strength = vasana.strength, "vasana crystallised");
        Ok(Some(vasana))
    }

    fn insert(&self, vasana: &Vasana) -> Result<()> {
        let writer = self.db.writer()?;
        writer.execute(
            "INSERT INTO vasanas (id, name, description, valence, strength, stability, project,
                                  created_at, last_activated, activation_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                vasana.id,
                vasana.name,
                vasana.description,
                vasana.valence.as_str(),
                vasana.strength.clamp(0.0, 1.0),
                vasana.stability.clamp(0.0, 1.0),
                vasana.project,
                vasana.created_at.to_rfc3339(),
                vasana.last_activated.to_rfc3339(),
                vasana.activation_count,
            ],
        )?;
        Ok(())
    }

    fn row_to_vasana(row: &rusqlite::Row<'_>) -> rusqlite::Result<Vasana> {
        let parse_dt = |s: String| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now())
        };
        Ok(Vasana {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            valence: Valence::parse_name(&row.get::<_, String>(3)?),
            strength: row.get(4)?,
            stability: row.get(5)?,
            project: row.get(6)?,
            created_at: parse_dt(row.get(7)?),
            last_activated: parse_dt(row.get(8)?),
            activation_count: row.get(9)?,
        })
    }

    const COLUMNS: &'static str = "id, name, description, valence, strength, stability, project, created_at, last_activated, activation_count";

    /// Find a vasana by project and name
    pub fn find(&self, project: &str, name: &str) -> Result<Option<Vasana>> {
        let reader = self.db.reader()?;
        let vasana = reader
            .query_row(
                &format!(
                    "SELECT {} FROM vasanas WHERE project = ?1 AND name = ?2",
                    Self::COLUMNS
                ),
                params![project, name],
                Self::row_to_vasana,
            )
            .optional()?;
        Ok(vasana)
    }

    /// Reinforce a vasana with a matching observation signal in [0, 1]
    pub fn reinforce(&self, id: &str, signal: f64) -> Result<Vasana> {
        let reader = self.db.reader()?;
        let vasana = reader
            .query_row(
                &format!("SELECT {} FROM vasanas WHERE id = ?1", Self::COLUMNS),
                params![id],
                Self::row_to_vasana,
            )
            .optional()?
            .ok_or_else(|| MemoryError::NotFound(format!("vasana {id}")))?;
        drop(reader);

        let eta = self.config.learning_rate;
        let new_strength = (vasana.strength + eta * (signal.clamp(0.0, 1.0) - vasana.strength))
            .clamp(0.0, 1.0);
        let new_stability = (vasana.stability + 0.05).clamp(0.0, 1.0);
        let now = Utc::now();

        let writer = self.db.writer()?;
        writer.execute(
            "UPDATE vasanas SET strength = ?1, stability = ?2, last_activated = ?3,
                                activation_count = activation_count + 1
             WHERE id = ?4",
            params![new_strength, new_stability, now.to_rfc3339(), id],
        )?;
        drop(writer);

        Ok(Vasana {
            strength: new_strength,
            stability: new_stability,
            last_activated: now,
            activation_count: vasana.activation_count + 1,
            ..vasana
        })
    }

    /// Strength discounted by time since the last activation
    pub fn effective_strength(&self, vasana: &Vasana, now: DateTime<Utc>) -> f64 {
        let age_days = (now - vasana.last_activated).num_seconds().max(0) as f64 / 86_400.0;
        vasana.strength * 0.5f64.powf(age_days / self.config.half_life_days.max(f64::EPSILON))
    }

    /// Top-K vasanas for a project by decayed strength
    pub fn top_decayed(&self, project: &str, k: usize) -> Result<Vec<(Vasana, f64)>> {
        let now = Utc::now();
        let reader = self.db.reader()?;
        let mut stmt = reader.prepare(&format!(
            "SELECT {} FROM vasanas WHERE project = ?1",
            Self::COLUMNS
        ))?;
        let vasanas: Vec<Vasana> = stmt
            .query_map(params![project], Self::row_to_vasana)?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(reader);

        let mut scored: Vec<(Vasana, f64)> = vasanas
            .into_iter()
            .map(|v| {
                let effective = self.effective_strength(&v, now);
                (v, effective)
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// Distinct projects holding vasanas, the global bucket excluded
    pub fn projects(&self) -> Result<Vec<String>> {
        let reader = self.db.reader()?;
        let mut stmt = reader.prepare(
            "SELECT DISTINCT project FROM vasanas WHERE project != ?1 ORDER BY project",
        )?;
        let projects = stmt
            .query_map(params![GLOBAL_PROJECT], |row| row.get::<_, String>(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(projects)
    }

    /// Promote tendencies seen across projects with sustained stability
    pub fn promote_global(&self, now: DateTime<Utc>) -> Result<usize> {
        let reader = self.db.reader()?;
        let mut stmt = reader.prepare(
            "SELECT name, COUNT(DISTINCT project), AVG(stability), MIN(created_at)
             FROM vasanas WHERE project != ?1
             GROUP BY name HAVING COUNT(DISTINCT project) >= 2",
        )?;
        let candidates: Vec<(String, i64, f64, String)> = stmt
            .query_map(params![GLOBAL_PROJECT], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(reader);

        let mut promoted = 0usize;
        for (name, _projects, avg_stability, oldest) in candidates {
            let old_enough = DateTime::parse_from_rfc3339(&oldest)
                .map(|dt| (now - dt.with_timezone(&Utc)).num_days() >= 60)
                .unwrap_or(false);
            if avg_stability < 0.6 || !old_enough {
                continue;
            }
            if self.find(GLOBAL_PROJECT, &name)?.is_some() {
                continue;
            }
            self.insert(&Vasana {
                id: Uuid::new_v4().to_string(),
                name: name.clone(),
                description: "Promoted: held across projects with sustained stability".to_string(),
                valence: Valence::Neutral,
                strength: 0.6,
                stability: avg_stability.clamp(0.0, 1.0),
                project: GLOBAL_PROJECT.to_string(),
                created_at: now,
                last_activated: now,
                activation_count: 0,
            })?;
            promoted += 1;
            tracing::info!(name, "vasana promoted to global");
        }
        Ok(promoted)
    }

    /// Delete vasanas whose decayed strength fell under the prune threshold
    pub fn prune(&self, now: DateTime<Utc>) -> Result<usize> {
        let reader = self.db.reader()?;
        let mut stmt = reader.prepare(&format!("SELECT {} FROM vasanas", Self::COLUMNS))?;
        let vasanas: Vec<Vasana> = stmt
            .query_map([], Self::row_to_vasana)?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);
        drop(reader);

        let doomed: Vec<String> = vasanas
            .iter()
            .filter(|v| self.effective_strength(v, now) < self.config.prune_threshold)
            .map(|v| v.id.clone())
            .collect();

        let writer = self.db.writer()?;
        for id in &doomed {
            writer.execute("DELETE FROM vasanas WHERE id = ?1", params![id])?;
        }
        if !doomed.is_empty() {
            tracing::info!(pruned = doomed.len(), "weak vasanas pruned");
        }
        Ok(doomed.len())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{AGENT_MIGRATIONS, AGENT_SCHEMA};
    use chrono::Duration;
    use tempfile::TempDir;

    fn engine() -> (TempDir, VasanaEngine) {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(
            Database::open(dir.path().join("agent.db"), AGENT_SCHEMA, AGENT_MIGRATIONS).unwrap(),
        );
        (dir, VasanaEngine::new(db, VasanaConfig::default()))
    }

    fn observation(valence: f64, label: &str) -> VasanaObservation {
        VasanaObservation {
            valence,
            novelty: 0.2,
            tool_context: false,
            label: label.into(),
            at: Utc::now(),
        }
    }

    #[test]
    fn test_consistent_stream_crystallises() {
        let (_dir, engine) = engine();
        let mut crystallised = None;
        for _ in 0..30 {
            if let Some(vasana) = engine
                .observe("/p", &observation(0.8, "thorough-testing"))
                .unwrap()
            {
                crystallised = Some(vasana);
                break;
            }
        }
        let vasana = crystallised.expect("a steady stream crystallises");
        assert_eq!(vasana.name, "thorough-testing");
        assert_eq!(vasana.valence, Valence::Positive);
        assert!(vasana.strength >= 0.3);
        assert!((0.0..=1.0).contains(&vasana.strength));
    }

    #[test]
    fn test_few_observations_do_not_crystallise() {
        let (_dir, engine) = engine();
        for _ in 0..3 {
            assert!(engine
                .observe("/p", &observation(0.8, "tiny"))
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn test_reinforcement_moves_strength_and_bumps_counters() {
        let (_dir, engine) = engine();
        let vasana = Vasana {
            id: "v1".into(),
            name: "short-replies".into(),
            description: String::new(),
            valence: Valence::Neutral,
            strength: 0.4,
            stability: 0.5,
            project: "/p".into(),
            created_at: Utc::now(),
            last_activated: Utc::now(),
            activation_count: 1,
        };
        engine.insert(&vasana).unwrap();

        let updated = engine.reinforce("v1", 1.0).unwrap();
        assert!(updated.strength > 0.4);
        assert_eq!(updated.activation_count, 2);
        assert!(updated.stability > 0.5);

        // Strength always stays clamped
        let mut current = updated;
        for _ in 0..50 {
            current = engine.reinforce("v1", 1.0).unwrap();
        }
        assert!(current.strength <= 1.0);
    }

    #[test]
    fn test_decay_on_query() {
        let (_dir, engine) = engine();
        let vasana = Vasana {
            id: "v1".into(),
            name: "x".into(),
            description: String::new(),
            valence: Valence::Neutral,
            strength: 0.8,
            stability: 0.5,
            project: "/p".into(),
            created_at: Utc::now() - Duration::days(60),
            last_activated: Utc::now() - Duration::days(30),
            activation_count: 1,
        };
        // Half-life 30 days: one half-life elapsed
        let effective = engine.effective_strength(&vasana, Utc::now());
        assert!((effective - 0.4).abs() < 0.01);
    }

    #[test]
    fn test_prune_removes_faded() {
        let (_dir, engine) = engine();
        for (id, days_stale) in [("fresh", 0i64), ("stale", 365)] {
            engine
                .insert(&Vasana {
                    id: id.into(),
                    name: id.into(),
                    description: String::new(),
                    valence: Valence::Neutral,
                    strength: 0.5,
                    stability: 0.5,
                    project: "/p".into(),
                    created_at: Utc::now() - Duration::days(days_stale),
                    last_activated: Utc::now() - Duration::days(days_stale),
                    activation_count: 1,
                })
                .unwrap();
        }
        let pruned = engine.prune(Utc::now()).unwrap();
        assert_eq!(pruned, 1);
        let remaining = engine.top_decayed("/p", 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0.id, "fresh");
    }

    #[test]
    fn test_promotion_requires_spread_and_stability() {
        let (_dir, engine) = engine();
        let old = Utc::now() - Duration::days(120);
        for project in ["/a", "/b"] {
            engine
                .insert(&Vasana {
                    id: format!("{project}-v"),
                    name: "careful-reviews".into(),
                    description: String::new(),
                    valence: Valence::Positive,
                    strength: 0.7,
                    stability: 0.8,
                    project: project.into(),
                    created_at: old,
                    last_activated: Utc::now(),
                    activation_count: 9,
                })
                .unwrap();
        }
        // One project only, should not promote
        engine
            .insert(&Vasana {
                id: "solo".into(),
                name: "solo-habit".into(),
                description: String::new(),
                valence: Valence::Neutral,
                strength: 0.7,
                stability: 0.9,
                project: "/a".into(),
                created_at: old,
                last_activated: Utc::now(),
                activation_count: 9,
            })
            .unwrap();

        let promoted = engine.promote_global(Utc::now()).unwrap();
        assert_eq!(promoted, 1);
        assert!(engine.find(GLOBAL_PROJECT, "careful-reviews").unwrap().is_some());
        assert!(engine.find(GLOBAL_PROJECT, "solo-habit").unwrap().is_none());
    }
}
