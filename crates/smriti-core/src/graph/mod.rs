//! Bi-temporal knowledge graph
//!
//! Entities and relationships with two time axes: valid time (when the fact
//! held in the world) and transaction time (when it was recorded). Historical
//! rows are never mutated; supersession stamps the old row and inserts a new
//! one, so `query_at` can reconstruct the graph as of any moment.

mod community;
mod pagerank;
mod store;

pub use community::{CommunityConfig, CommunityDetector, XorShift64};
pub use pagerank::{PageRankConfig, PersonalizedPageRank};
pub use store::{GraphConfig, GraphStore, NewEdge};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

// ============================================================================
// PROVENANCE
// ============================================================================

/// Provenance kind of an edge: how the fact was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pramana {
    /// Direct observation
    Pratyaksha,
    /// Inference from other facts
    Anumana,
    /// Testimony: stated by the user or another agent
    Shabda,
}

impl Pramana {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pramana::Pratyaksha => "pratyaksha",
            Pramana::Anumana => "anumana",
            Pramana::Shabda => "shabda",
        }
    }

    pub fn parse_name(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "pratyaksha" => Ok(Pramana::Pratyaksha),
            "anumana" => Ok(Pramana::Anumana),
            "shabda" => Ok(Pramana::Shabda),
            other => Err(MemoryError::Invariant(format!("unknown pramana: {other}"))),
        }
    }
}

impl std::fmt::Display for Pramana {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trust tier applied to a pramana
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Viveka {
    /// Corroborated or directly verified
    Grounded,
    /// Plausible but unverified
    Probable,
    /// Tentative, needs confirmation
    Speculative,
}

impl Viveka {
    pub fn as_str(&self) -> &'static str {
        match self {
            Viveka::Grounded => "grounded",
            Viveka::Probable => "probable",
            Viveka::Speculative => "speculative",
        }
    }

    pub fn parse_name(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "grounded" => Ok(Viveka::Grounded),
            "probable" => Ok(Viveka::Probable),
            "speculative" => Ok(Viveka::Speculative),
            other => Err(MemoryError::Invariant(format!("unknown viveka: {other}"))),
        }
    }
}

impl std::fmt::Display for Viveka {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Ranked reliability of a (pramana, viveka) pair, in [0, 1]
///
/// Direct observation outranks inference outranks testimony; within a
/// pramana, the trust tier scales the score.
pub fn reliability(pramana: Pramana, viveka: Viveka) -> f32 {
    let base = match pramana {
        Pramana::Pratyaksha => 1.0,
        Pramana::Anumana => 0.75,
        Pramana::Shabda => 0.55,
    };
    let tier = match viveka {
        Viveka::Grounded => 1.0,
        Viveka::Probable => 0.7,
        Viveka::Speculative => 0.4,
    };
    base * tier
}

// ============================================================================
// NODES AND EDGES
// ============================================================================

/// An entity in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNode {
    pub id: String,
    pub node_type: String,
    pub label: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A bi-temporal edge row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphEdge {
    /// Row id; addresses this exact historical row
    pub id: i64,
    pub source: String,
    pub target: String,
    pub relationship: String,
    pub weight: f64,
    pub pramana: Pramana,
    pub viveka: Viveka,
    /// When the fact started holding in the world
    pub valid_from: DateTime<Utc>,
    /// When the fact stopped holding; unbounded when `None`
    pub valid_to: Option<DateTime<Utc>>,
    /// Transaction time at which this row was replaced
    pub superseded_at: Option<DateTime<Utc>>,
    /// Transaction time at which this row was recorded
    pub recorded_at: DateTime<Utc>,
}

impl GraphEdge {
    /// Whether this row is the current one for its triple
    pub fn is_current(&self) -> bool {
        self.superseded_at.is_none()
    }

    /// Whether the fact held at `time` and the row had not yet been
    /// superseded as of `time`
    pub fn visible_at(&self, time: DateTime<Utc>) -> bool {
        let valid = self.valid_from <= time && self.valid_to.is_none_or(|to| time <= to);
        let recorded = self.superseded_at.is_none_or(|s| s > time);
        valid && recorded
    }

    /// Weight discounted by age, measured from `valid_from`
    pub fn effective_weight(&self, now: DateTime<Utc>, half_life_days: f64) -> f64 {
        let age_days = (now - self.valid_from).num_seconds().max(0) as f64 / 86_400.0;
        let half_life = half_life_days.max(f64::EPSILON);
        self.weight * (-std::f64::consts::LN_2 * age_days / half_life).exp()
    }

    /// Combined provenance reliability of this row
    pub fn reliability(&self) -> f32 {
        reliability(self.pramana, self.viveka)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_reliability_ordering() {
        // Direct grounded observation is the ceiling
        assert!(
            reliability(Pramana::Pratyaksha, Viveka::Grounded)
                > reliability(Pramana::Anumana, Viveka::Grounded)
        );
        assert!(
            reliability(Pramana::Anumana, Viveka::Grounded)
                > reliability(Pramana::Shabda, Viveka::Grounded)
        );
        // Trust tier scales within a pramana
        assert!(
            reliability(Pramana::Shabda, Viveka::Grounded)
                > reliability(Pramana::Shabda, Viveka::Speculative)
        );
        assert_eq!(reliability(Pramana::Pratyaksha, Viveka::Grounded), 1.0);
    }

    #[test]
    fn test_visibility_windows() {
        let t0 = Utc::now();
        let edge = GraphEdge {
            id: 1,
            source: "a".into(),
            target: "b".into(),
            relationship: "uses".into(),
            weight: 0.8,
            pramana: Pramana::Pratyaksha,
            viveka: Viveka::Grounded,
            valid_from: t0,
            valid_to: None,
            superseded_at: Some(t0 + Duration::hours(1)),
            recorded_at: t0,
        };

        assert!(edge.visible_at(t0));
        assert!(edge.visible_at(t0 + Duration::minutes(30)));
        // At and after supersession, the row disappears from that timeline
        assert!(!edge.visible_at(t0 + Duration::hours(1)));
        assert!(!edge.visible_at(t0 - Duration::seconds(1)));
    }

    #[test]
    fn test_effective_weight_halves_at_half_life() {
        let now = Utc::now();
        let edge = GraphEdge {
            id: 1,
            source: "a".into(),
            target: "b".into(),
            relationship: "uses".into(),
            weight: 1.0,
            pramana: Pramana::Pratyaksha,
            viveka: Viveka::Grounded,
            valid_from: now - Duration::days(30),
            valid_to: None,
            superseded_at: None,
            recorded_at: now - Duration::days(30),
        };
        let effective = edge.effective_weight(now, 30.0);
        assert!((effective - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_pramana_viveka_roundtrip() {
        for p in [Pramana::Pratyaksha, Pramana::Anumana, Pramana::Shabda] {
            assert_eq!(Pramana::parse_name(p.as_str()).unwrap(), p);
        }
        for v in [Viveka::Grounded, Viveka::Probable, Viveka::Speculative] {
            assert_eq!(Viveka::parse_name(v.as_str()).unwrap(), v);
        }
        assert!(Pramana::parse_name("hearsay").is_err());
    }
}
