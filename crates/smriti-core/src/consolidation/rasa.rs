//! Nava Rasa - affective state on the probability simplex
//!
//! Nine rasas as a probability vector updated by exponentially-weighted
//! moving average and re-projected through a softmax at a configurable
//! temperature. Every update preserves the simplex: components stay
//! non-negative and sum to one within 1e-8. The dominant rasa exposes a
//! behavioural adaptation record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::events::{EventBus, MemoryEvent};

// ============================================================================
// RASAS
// ============================================================================

/// The nine rasas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rasa {
    /// Love, warmth
    Shringara,
    /// Humour, playfulness
    Hasya,
    /// Compassion, sadness
    Karuna,
    /// Anger, frustration
    Raudra,
    /// Heroic energy, determination
    Veera,
    /// Fear, anxiety
    Bhayanaka,
    /// Disgust, aversion
    Bibhatsa,
    /// Wonder, curiosity
    Adbhuta,
    /// Calm, equanimity (the resting state)
    Shanta,
}

impl Rasa {
    pub const ALL: [Rasa; 9] = [
        Rasa::Shringara,
        Rasa::Hasya,
        Rasa::Karuna,
        Rasa::Raudra,
        Rasa::Veera,
        Rasa::Bhayanaka,
        Rasa::Bibhatsa,
        Rasa::Adbhuta,
        Rasa::Shanta,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Rasa::Shringara => "shringara",
            Rasa::Hasya => "hasya",
            Rasa::Karuna => "karuna",
            Rasa::Raudra => "raudra",
            Rasa::Veera => "veera",
            Rasa::Bhayanaka => "bhayanaka",
            Rasa::Bibhatsa => "bibhatsa",
            Rasa::Adbhuta => "adbhuta",
            Rasa::Shanta => "shanta",
        }
    }

    pub fn index(&self) -> usize {
        Rasa::ALL.iter().position(|r| r == self).unwrap_or(8)
    }
}

impl std::fmt::Display for Rasa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// CONFIG
// ============================================================================

/// Nava Rasa tunables; setters clamp to system ceilings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavaRasaConfig {
    /// EWMA blend factor toward new observations, in (0, 1]
    pub alpha: f64,
    /// Softmax temperature; lower sharpens, higher flattens
    pub temperature: f64,
    /// Ceiling applied to observation components
    pub max_input: f64,
    /// History entries retained
    pub max_history: usize,
}

impl Default for NavaRasaConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            temperature: 1.0,
            max_input: 1.0,
            max_history: 64,
        }
    }
}

impl NavaRasaConfig {
    /// Clamp all fields to their legal ranges
    pub fn clamped(mut self) -> Self {
        self.alpha = self.alpha.clamp(0.01, 1.0);
        self.temperature = self.temperature.clamp(0.05, 10.0);
        self.max_input = self.max_input.clamp(0.1, 10.0);
        self.max_history = self.max_history.clamp(1, 4096);
        self
    }
}

// ============================================================================
// STATE
// ============================================================================

/// One history entry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RasaSnapshot {
    pub dominant: Rasa,
    pub state: [f64; 9],
    pub at: DateTime<Utc>,
}

/// How the dominant rasa shapes behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BehavioralAdaptation {
    /// Willingness to act without asking, in [0, 1]
    pub autonomy: f64,
    /// How expansive replies should be, in [0, 1]
    pub verbosity: f64,
    /// Whether risky actions need confirmation first
    pub confirm_before_actions: bool,
}

/// The simplex-constrained affective state
#[derive(Debug, Clone)]
pub struct NavaRasa {
    state: [f64; 9],
    config: NavaRasaConfig,
    history: Vec<RasaSnapshot>,
    bus: Option<EventBus>,
}

/// Shanta-dominant resting distribution
fn resting_state() -> [f64; 9] {
    let mut state = [0.05; 9];
    state[Rasa::Shanta.index()] = 0.6;
    state
}

fn softmax(values: &[f64; 9], temperature: f64) -> [f64; 9] {
    let t = temperature.max(1e-6);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mut out = [0.0; 9];
    let mut sum = 0.0;
    for (i, v) in values.iter().enumerate() {
        let e = ((v - max) / t).exp();
        out[i] = e;
        sum += e;
    }
    for v in &mut out {
        *v /= sum;
    }
    out
}

impl Default for NavaRasa {
    fn default() -> Self {
        Self::new(NavaRasaConfig::default())
    }
}

impl NavaRasa {
    pub fn new(config: NavaRasaConfig) -> Self {
        Self {
            state: resting_state(),
            config: config.clamped(),
            history: Vec::new(),
            bus: None,
        }
    }

    /// Emit `nava_rasa:rasa_shift` events on dominant changes
    pub fn with_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &NavaRasaConfig {
        &self.config
    }

    /// Current distribution
    pub fn state(&self) -> [f64; 9] {
        self.state
    }

    /// The rasa carrying the most mass
    pub fn dominant(&self) -> Rasa {
        let (index, _) = self
            .state
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap_or((Rasa::Shanta.index(), &0.0));
        Rasa::ALL[index]
    }

    /// Verify the simplex invariant
    pub fn check_simplex(&self) -> Result<()> {
        let sum: f64 = self.state.iter().sum();
        if (sum - 1.0).abs() > 1e-8 {
            return Err(MemoryError::Invariant(format!(
                "rasa state sums to {sum}, expected 1"
            )));
        }
        if self.state.iter().any(|v| !(0.0..=1.0).contains(v) || !v.is_finite()) {
            return Err(MemoryError::Invariant(
                "rasa state has a component outside [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Blend one observation in and re-project onto the simplex
    ///
    /// Observation components clamp to `[0, max_input]`. Returns the
    /// dominant rasa after the update.
    pub fn observe(&mut self, observation: [f64; 9]) -> Rasa {
        let before = self.dominant();

        let mut blended = [0.0; 9];
        for i in 0..9 {
            let input = if observation[i].is_finite() {
                observation[i].clamp(0.0, self.config.max_input)
            } else {
                0.0
            };
            blended[i] = (1.0 - self.config.alpha) * self.state[i] + self.config.alpha * input;
        }
        self.state = softmax(&blended, self.config.temperature);

        // Guard against drift from repeated float ops
        let sum: f64 = self.state.iter().sum();
        for v in &mut self.state {
            *v /= sum;
        }

        let after = self.dominant();
        let now = Utc::now();
        self.history.push(RasaSnapshot {
            dominant: after,
            state: self.state,
            at: now,
        });
        if self.history.len() > self.config.max_history {
            self.history.remove(0);
        }

        if before != after {
            tracing::debug!(from = before.as_str(), to = after.as_str(), "rasa shift");
            if let Some(bus) = &self.bus {
                bus.emit(MemoryEvent::RasaShift {
                    from: before.as_str().to_string(),
                    to: after.as_str().to_string(),
                    at: now,
                });
            }
        }
        after
    }

    /// Return to the shanta-dominant resting state
    pub fn reset(&mut self) {
        self.state = resting_state();
        self.history.clear();
    }

    /// History of updates, oldest first
    pub fn history(&self) -> &[RasaSnapshot] {
        &self.history
    }

    /// Behavioural adaptation for the current dominant rasa
    pub fn adaptation(&self) -> BehavioralAdaptation {
        match self.dominant() {
            Rasa::Veera => BehavioralAdaptation {
                autonomy: 0.9,
                verbosity: 0.4,
                confirm_before_actions: false,
            },
            Rasa::Adbhuta => BehavioralAdaptation {
                autonomy: 0.7,
                verbosity: 0.7,
                confirm_before_actions: false,
            },
            Rasa::Shringara | Rasa::Hasya => BehavioralAdaptation {
                autonomy: 0.6,
                verbosity: 0.6,
                confirm_before_actions: false,
            },
            Rasa::Karuna => BehavioralAdaptation {
                autonomy: 0.4,
                verbosity: 0.7,
                confirm_before_actions: true,
            },
            Rasa::Raudra | Rasa::Bhayanaka | Rasa::Bibhatsa => BehavioralAdaptation {
                autonomy: 0.2,
                verbosity: 0.3,
                confirm_before_actions: true,
            },
            Rasa::Shanta => BehavioralAdaptation {
                autonomy: 0.5,
                verbosity: 0.5,
                confirm_before_actions: false,
            },
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
