//! Kala Chakra - the multi-scale temporal engine
//!
//! Scores document relevance as a weighted sum of exponential decays across
//! seven time scales, from single turns up to years. Pure functions over
//! timestamps; the context snapshot additionally reads best-effort counts
//! through the [`DatabaseReader`] capability.

use chrono::{DateTime, Datelike, Duration, Utc};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::config::{MAX_HALF_LIFE_SECS, MIN_HALF_LIFE_SECS};
use crate::db::{scalar_i64, DatabaseReader};

// ============================================================================
// TIME SCALES
// ============================================================================

/// The seven scales of the wheel, finest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeScale {
    Turn,
    Session,
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

impl TimeScale {
    /// All scales, finest first
    pub const ALL: [TimeScale; 7] = [
        TimeScale::Turn,
        TimeScale::Session,
        TimeScale::Day,
        TimeScale::Week,
        TimeScale::Month,
        TimeScale::Quarter,
        TimeScale::Year,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeScale::Turn => "turn",
            TimeScale::Session => "session",
            TimeScale::Day => "day",
            TimeScale::Week => "week",
            TimeScale::Month => "month",
            TimeScale::Quarter => "quarter",
            TimeScale::Year => "year",
        }
    }
}

impl std::fmt::Display for TimeScale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Half-lives and weights per scale
///
/// Half-lives clamp to [1 s, 10 y]; weights clamp to [0, 1] and are
/// renormalised to sum to 1 when stored through [`KalaConfig::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KalaConfig {
    /// Half-life per scale, in seconds, in [`TimeScale::ALL`] order
    pub half_lives: [f64; 7],
    /// Relevance weight per scale, same order
    pub weights: [f64; 7],
}

impl Default for KalaConfig {
    fn default() -> Self {
        Self {
            half_lives: [
                60.0,            // turn: 1 minute
                3_600.0,         // session: 1 hour
                86_400.0,        // day
                7.0 * 86_400.0,  // week
                30.0 * 86_400.0, // month
                90.0 * 86_400.0, // quarter
                365.0 * 86_400.0, // year
            ],
            weights: [0.25, 0.20, 0.15, 0.15, 0.10, 0.08, 0.07],
        }
    }
}

impl KalaConfig {
    /// Build a config, clamping half-lives and weights to system bounds and
    /// renormalising weights to sum to 1
    pub fn new(half_lives: [f64; 7], weights: [f64; 7]) -> Self {
        let half_lives = half_lives.map(|h| h.clamp(MIN_HALF_LIFE_SECS, MAX_HALF_LIFE_SECS));
        let mut weights = weights.map(|w| w.clamp(0.0, 1.0));
        let sum: f64 = weights.iter().sum();
        if sum > 0.0 {
            for w in &mut weights {
                *w /= sum;
            }
        } else {
            weights = KalaConfig::default().weights;
        }
        Self { half_lives, weights }
    }

    fn index(scale: TimeScale) -> usize {
        TimeScale::ALL.iter().position(|s| *s == scale).unwrap_or(0)
    }

    /// Half-life of one scale, in seconds
    pub fn half_life(&self, scale: TimeScale) -> f64 {
        self.half_lives[Self::index(scale)]
    }

    /// Weight of one scale
    pub fn weight(&self, scale: TimeScale) -> f64 {
        self.weights[Self::index(scale)]
    }
}

// ============================================================================
// RELEVANCE
// ============================================================================

/// The temporal engine
#[derive(Debug, Clone, Default)]
pub struct KalaChakra {
    config: KalaConfig,
}

impl KalaChakra {
    pub fn new(config: KalaConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KalaConfig {
        &self.config
    }

    /// Multi-scale relevance of a document created `elapsed_secs` ago
    ///
    /// `relevance(0) = 1` (weights sum to 1) and the value decays toward 0
    /// as elapsed time grows. Negative elapsed time (clock skew) is treated
    /// as zero.
    pub fn relevance_at(&self, elapsed_secs: f64) -> f64 {
        let t = elapsed_secs.max(0.0);
        TimeScale::ALL
            .iter()
            .map(|&scale| {
                let half_life = self.config.half_life(scale);
                self.config.weight(scale) * (-std::f64::consts::LN_2 * t / half_life).exp()
            })
            .sum()
    }

    /// Relevance of a document with the given timestamp, as of `now`
    pub fn relevance(&self, doc_time: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let elapsed = (now - doc_time).num_milliseconds() as f64 / 1000.0;
        self.relevance_at(elapsed)
    }

    /// Score multiplier applied after fusion: age alone never pushes a
    /// document below half of its fused score
    pub fn boost(&self, doc_time: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        0.5 + 0.5 * self.relevance(doc_time, now)
    }

    /// The scale that dominates an elapsed interval
    pub fn dominant_scale(&self, elapsed: Duration) -> TimeScale {
        let secs = elapsed.num_seconds().unsigned_abs();
        match secs {
            s if s <= 5 * 60 => TimeScale::Turn,
            s if s <= 2 * 3_600 => TimeScale::Session,
            s if s <= 36 * 3_600 => TimeScale::Day,
            s if s <= 10 * 86_400 => TimeScale::Week,
            s if s <= 45 * 86_400 => TimeScale::Month,
            s if s <= 120 * 86_400 => TimeScale::Quarter,
            _ => TimeScale::Year,
        }
    }

    /// Build a context snapshot as of `now`
    ///
    /// Count queries run through the injected reader and are best-effort: a
    /// failing query yields a zero count, never an error.
    pub fn context(&self, reader: &dyn DatabaseReader, now: DateTime<Utc>) -> KalaContext {
        let count = |sql: &str, since: DateTime<Utc>| -> u64 {
            let params = [Value::Text(since.to_rfc3339())];
            match reader.get_one(sql, &params) {
                Ok(Some(row)) => scalar_i64(&row).unwrap_or(0).max(0) as u64,
                Ok(None) => 0,
                Err(e) => {
                    tracing::warn!(error = %e, "kala context count failed");
                    0
                }
            }
        };

        let turns_since = "SELECT COUNT(*) FROM turns WHERE created_at >= ?1";
        let sessions_since = "SELECT COUNT(*) FROM sessions WHERE updated_at >= ?1";

        let day_start = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|d| d.and_utc())
            .unwrap_or(now);
        let iso = now.iso_week();
        let week_start = chrono::NaiveDate::from_isoywd_opt(iso.year(), iso.week(), chrono::Weekday::Mon)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
            .unwrap_or(day_start);
        let month_start = now
            .date_naive()
            .with_day(1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
            .unwrap_or(day_start);
        let quarter_month = ((now.month0() / 3) * 3) + 1;
        let quarter_start = chrono::NaiveDate::from_ymd_opt(now.year(), quarter_month, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
            .unwrap_or(month_start);
        let year_start = chrono::NaiveDate::from_ymd_opt(now.year(), 1, 1)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|d| d.and_utc())
            .unwrap_or(month_start);

        KalaContext {
            built_at: now,
            scales: [
                ScaleSnapshot {
                    scale: TimeScale::Turn,
                    window_start: now - Duration::minutes(5),
                    turn_count: count(turns_since, now - Duration::minutes(5)),
                    session_count: 0,
                },
                ScaleSnapshot {
                    scale: TimeScale::Session,
                    window_start: now - Duration::hours(2),
                    turn_count: count(turns_since, now - Duration::hours(2)),
                    session_count: count(sessions_since, now - Duration::hours(2)),
                },
                ScaleSnapshot {
                    scale: TimeScale::Day,
                    window_start: day_start,
                    turn_count: count(turns_since, day_start),
                    session_count: count(sessions_since, day_start),
                },
                ScaleSnapshot {
                    scale: TimeScale::Week,
                    window_start: week_start,
                    turn_count: count(turns_since, week_start),
                    session_count: count(sessions_since, week_start),
                },
                ScaleSnapshot {
                    scale: TimeScale::Month,
                    window_start: month_start,
                    turn_count: count(turns_since, month_start),
                    session_count: count(sessions_since, month_start),
                },
                ScaleSnapshot {
                    scale: TimeScale::Quarter,
                    window_start: quarter_start,
                    turn_count: count(turns_since, quarter_start),
                    session_count: count(sessions_since, quarter_start),
                },
                ScaleSnapshot {
                    scale: TimeScale::Year,
                    window_start: year_start,
                    turn_count: count(turns_since, year_start),
                    session_count: count(sessions_since, year_start),
                },
            ],
        }
    }
}

// ============================================================================
// CONTEXT SNAPSHOT
// ============================================================================

/// Activity within one scale's window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleSnapshot {
    pub scale: TimeScale,
    pub window_start: DateTime<Utc>,
    pub turn_count: u64,
    pub session_count: u64,
}

/// Snapshot of activity at all seven scales
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KalaContext {
    pub built_at: DateTime<Utc>,
    pub scales: [ScaleSnapshot; 7],
}

impl KalaContext {
    /// Snapshot for a single scale
    pub fn scale(&self, scale: TimeScale) -> &ScaleSnapshot {
        &self.scales[TimeScale::ALL.iter().position(|s| *s == scale).unwrap_or(0)]
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Row, DatabaseReader};
    use crate::error::{MemoryError, Result};

    struct FixedReader(i64);
    impl DatabaseReader for FixedReader {
        fn get_one(&self, _sql: &str, _params: &[Value]) -> Result<Option<Row>> {
            Ok(Some(vec![Value::Integer(self.0)]))
        }
    }

    struct FailingReader;
    impl DatabaseReader for FailingReader {
        fn get_one(&self, _sql: &str, _params: &[Value]) -> Result<Option<Row>> {
            Err(MemoryError::Transient {
                message: "db down".into(),
                attempts: 1,
            })
        }
    }

    #[test]
    fn test_relevance_at_zero_is_one() {
        let kala = KalaChakra::default();
        assert!((kala.relevance_at(0.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_relevance_half_life_per_scale() {
        let kala = KalaChakra::default();
        // At exactly one scale's half-life, that scale alone contributes
        // 0.5 * w_s.
        for &scale in &TimeScale::ALL {
            let hl = kala.config().half_life(scale);
            let w = kala.config().weight(scale);
            let contribution = w * (-std::f64::consts::LN_2 * hl / hl).exp();
            assert!((contribution - 0.5 * w).abs() < 1e-9);
        }
    }

    #[test]
    fn test_relevance_monotone_decreasing() {
        let kala = KalaChakra::default();
        let mut last = kala.relevance_at(0.0);
        for days in [1.0, 7.0, 30.0, 90.0, 365.0, 3650.0] {
            let r = kala.relevance_at(days * 86_400.0);
            assert!(r < last);
            assert!(r > 0.0);
            last = r;
        }
        // Approaches zero
        assert!(kala.relevance_at(100.0 * 365.0 * 86_400.0) < 1e-3);
    }

    #[test]
    fn test_boost_floor() {
        let kala = KalaChakra::default();
        let now = Utc::now();
        let ancient = now - Duration::days(365 * 50);
        assert!(kala.boost(ancient, now) >= 0.5);
        assert!(kala.boost(now, now) > 0.99);
    }

    #[test]
    fn test_boost_matches_expected_magnitudes() {
        let kala = KalaChakra::default();
        let now = Utc::now();
        // ~5 minutes old stays close to full score
        let recent = kala.boost(now - Duration::minutes(5), now);
        assert!(recent > 0.75 && recent <= 1.0);
        // ~90 days old drops near the floor
        let old = kala.boost(now - Duration::days(90), now);
        assert!(old > 0.5 && old < 0.62);
    }

    #[test]
    fn test_dominant_scale_buckets() {
        let kala = KalaChakra::default();
        assert_eq!(kala.dominant_scale(Duration::minutes(3)), TimeScale::Turn);
        assert_eq!(kala.dominant_scale(Duration::minutes(90)), TimeScale::Session);
        assert_eq!(kala.dominant_scale(Duration::hours(30)), TimeScale::Day);
        assert_eq!(kala.dominant_scale(Duration::days(9)), TimeScale::Week);
        assert_eq!(kala.dominant_scale(Duration::days(40)), TimeScale::Month);
        assert_eq!(kala.dominant_scale(Duration::days(100)), TimeScale::Quarter);
        assert_eq!(kala.dominant_scale(Duration::days(400)), TimeScale::Year);
        // Sign does not matter
        assert_eq!(kala.dominant_scale(-Duration::days(9)), TimeScale::Week);
    }

    #[test]
    fn test_config_clamping() {
        let config = KalaConfig::new([0.0; 7], [2.0, -1.0, 0.5, 0.5, 0.5, 0.5, 0.5]);
        for hl in config.half_lives {
            assert!(hl >= MIN_HALF_LIFE_SECS);
        }
        let sum: f64 = config.weights.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert!(config.weights.iter().all(|w| (0.0..=1.0).contains(w)));
    }

    #[test]
    fn test_context_counts() {
        let kala = KalaChakra::default();
        let ctx = kala.context(&FixedReader(7), Utc::now());
        assert_eq!(ctx.scale(TimeScale::Day).turn_count, 7);
        assert_eq!(ctx.scale(TimeScale::Turn).session_count, 0);
    }

    #[test]
    fn test_context_is_best_effort() {
        let kala = KalaChakra::default();
        let ctx = kala.context(&FailingReader, Utc::now());
        for snapshot in &ctx.scales {
            assert_eq!(snapshot.turn_count, 0);
            assert_eq!(snapshot.session_count, 0);
        }
    }
}
