//! Anveshana - multi-round retrieval
//!
//! Complex queries are decomposed by heuristics (no model call), each
//! sub-query runs through hybrid search in parallel, and later rounds chase
//! key terms the accumulated results have not covered yet. Fusion is
//! weighted by sub-query, with a boost for documents several sub-queries
//! agree on. The whole function is deterministic for identical inputs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{MemoryError, Result};
use crate::search::{HybridSearch, RecallQuery, SignalKind};

// ============================================================================
// CONFIG
// ============================================================================

/// Multi-round retrieval tunables
#[derive(Debug, Clone)]
pub struct AnveshanaConfig {
    /// Cap on sub-queries per round, the original included
    pub max_sub_queries: usize,
    /// Final result count
    pub max_results: usize,
    /// Boost base for documents found by n sub-queries: boost^(n-1)
    pub multi_query_boost: f32,
    /// Minimum top-score improvement to keep iterating
    pub improvement_threshold: f32,
    /// Hard ceiling on rounds after the first
    pub max_rounds: usize,
    /// Weight carried by follow-up sub-queries
    pub follow_up_weight: f32,
    /// Per-sub-query fetch size
    pub per_query_limit: usize,
}

impl Default for AnveshanaConfig {
    fn default() -> Self {
        Self {
            max_sub_queries: 4,
            max_results: 15,
            multi_query_boost: 1.3,
            improvement_threshold: 0.05,
            max_rounds: 2,
            follow_up_weight: 0.6,
            per_query_limit: 10,
        }
    }
}

// ============================================================================
// COMPLEXITY GATE
// ============================================================================

const CONJUNCTIONS: &[&str] = &[
    "and", "or", "but", "that", "which", "who", "where", "when", "while", "although",
];

const TEMPORAL_MARKERS: &[&str] = &[
    "yesterday", "today", "tomorrow", "ago", "recently", "earlier", "before", "after",
    "last week", "last month", "last year", "this week", "this month",
];

const COMPARATIVE_MARKERS: &[&str] = &[
    " vs ", " versus ", " compared to ", "difference between", "better than", "worse than",
];

const CAUSAL_MARKERS: &[&str] = &[
    "because", "led to", "resulted in", "reason for", "due to", "why",
];

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "of", "to", "in", "on", "for", "with", "at", "by", "from", "about",
    "into", "over", "after", "before", "between", "and", "or", "but", "that", "which", "who",
    "what", "where", "when", "while", "although", "how", "did", "does", "do", "is", "are",
    "was", "were", "has", "have", "had", "not", "this", "these", "those", "they", "them",
    "their", "our", "your", "its", "it", "we", "you",
];

fn word_count(query: &str) -> usize {
    query.split_whitespace().count()
}

fn quoted_phrase_count(query: &str) -> usize {
    query.matches('"').count() / 2
}

fn mid_sentence_capitalised(query: &str) -> usize {
    query
        .split_whitespace()
        .skip(1)
        .filter(|word| {
            let mut chars = word.chars();
            matches!(chars.next(), Some(c) if c.is_uppercase()) && chars.any(|c| c.is_lowercase())
        })
        .count()
}

/// Whether a query is complex enough to decompose
pub fn is_complex(query: &str) -> bool {
    let lower = query.to_lowercase();
    word_count(query) > 8
        || CONJUNCTIONS
            .iter()
            .any(|c| lower.split_whitespace().any(|w| w == *c))
        || TEMPORAL_MARKERS.iter().any(|m| lower.contains(m))
        || COMPARATIVE_MARKERS.iter().any(|m| lower.contains(m))
        || quoted_phrase_count(query) >= 2
        || mid_sentence_capitalised(query) >= 2
}

// ============================================================================
// DECOMPOSITION
// ============================================================================

/// A sub-query with its fusion weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubQuery {
    pub text: String,
    pub weight: f32,
}

fn positional_weight(position: usize) -> f32 {
    (1.0 - 0.2 * position as f32).max(0.4)
}

fn clean_fragment(fragment: &str) -> Option<String> {
    let cleaned = fragment
        .trim()
        .trim_matches(|c: char| c == ',' || c == '?' || c == '.' || c == ';')
        .trim();
    (word_count(cleaned) >= 1 && cleaned.len() >= 3).then(|| cleaned.to_string())
}

/// Split on the first comparative marker: `X vs Y` becomes both sides
fn split_comparative(query: &str) -> Option<Vec<String>> {
    let lower = query.to_lowercase();
    for marker in [" vs ", " versus ", " compared to "] {
        if let Some(pos) = lower.find(marker) {
            let left = clean_fragment(&query[..pos])?;
            let right = clean_fragment(query.get(pos + marker.len()..)?)?;
            return Some(vec![left, right]);
        }
    }
    None
}

/// `difference between X and Y` becomes both entities
fn split_difference(query: &str) -> Option<Vec<String>> {
    let lower = query.to_lowercase();
    let pos = lower.find("difference between ")?;
    let rest = query.get(pos + "difference between ".len()..)?;
    let rest_lower = rest.to_lowercase();
    let and_pos = rest_lower.find(" and ")?;
    let left = clean_fragment(&rest[..and_pos])?;
    let right = clean_fragment(rest.get(and_pos + 5..)?)?;
    Some(vec![left, right])
}

/// Split at the first causal marker
fn split_causal(query: &str) -> Option<Vec<String>> {
    let lower = query.to_lowercase();
    for marker in CAUSAL_MARKERS {
        if let Some(pos) = lower.find(marker) {
            let left = clean_fragment(&query[..pos]);
            let right = clean_fragment(query.get(pos + marker.len()..)?);
            let parts: Vec<String> = [left, right].into_iter().flatten().collect();
            if parts.len() == 2 {
                return Some(parts);
            }
        }
    }
    None
}

/// `A, B, and C` becomes one sub-query per item
fn split_entity_list(query: &str) -> Option<Vec<String>> {
    let commas = query.matches(',').count();
    if commas < 1 {
        return None;
    }
    let mut items: Vec<String> = Vec::new();
    for segment in query.split(',') {
        let segment = segment.trim();
        let lower = segment.to_lowercase();
        // The final segment usually carries the closing conjunction
        if let Some(rest) = lower
            .strip_prefix("and ")
            .or_else(|| lower.strip_prefix("or "))
        {
            let offset = segment.len() - rest.len();
            if let Some(item) = clean_fragment(&segment[offset..]) {
                items.push(item);
            }
        } else if let Some(item) = clean_fragment(segment) {
            items.push(item);
        }
    }
    (items.len() >= 2 && commas >= 2).then_some(items)
}

/// Split at the first conjunction with enough material on both sides
fn split_conjunction(query: &str) -> Option<Vec<String>> {
    let words: Vec<&str> = query.split_whitespace().collect();
    for (i, word) in words.iter().enumerate() {
        let bare: String = word
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        if CONJUNCTIONS.contains(&bare.as_str()) && i >= 2 && words.len() - i - 1 >= 1 {
            let left = clean_fragment(&words[..i].join(" "))?;
            let right = clean_fragment(&words[i + 1..].join(" "))?;
            return Some(vec![left, right]);
        }
    }
    None
}

/// Decompose a query into weighted sub-queries
///
/// The original always comes first at weight 1.0. Rules fire in priority
/// order and the first hit wins; the list is capped at `max_sub_queries`
/// keeping the original plus the highest-weighted parts.
pub fn decompose(query: &str, max_sub_queries: usize) -> Vec<SubQuery> {
    let mut sub_queries = vec![SubQuery {
        text: query.trim().to_string(),
        weight: 1.0,
    }];

    let parts = split_comparative(query)
        .or_else(|| split_difference(query))
        .or_else(|| split_causal(query))
        .or_else(|| split_entity_list(query))
        .or_else(|| split_conjunction(query))
        .unwrap_or_default();

    for (i, part) in parts.into_iter().enumerate() {
        if sub_queries.iter().any(|sq| sq.text == part) {
            continue;
        }
        sub_queries.push(SubQuery {
            text: part,
            weight: positional_weight(i + 1),
        });
    }

    sub_queries.truncate(max_sub_queries.max(1));
    sub_queries
}

/// Key terms of a query: stop-words out, short tokens out
fn key_terms(query: &str) -> Vec<String> {
    query
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.chars().filter(|c| c.is_alphanumeric()).collect::<String>())
        .filter(|w| w.len() >= 3 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

// ============================================================================
// MULTI-ROUND RETRIEVAL
// ============================================================================

/// One fused document after all rounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnveshanaHit {
    pub doc_id: String,
    pub content: String,
    pub score: f32,
    /// How many distinct sub-queries found this document
    pub matched_queries: usize,
    pub signals: Vec<SignalKind>,
}

/// Result of a retrieval run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiRoundResult {
    pub hits: Vec<AnveshanaHit>,
    pub sub_queries: Vec<SubQuery>,
    pub rounds: usize,
}

#[derive(Debug, Default, Clone)]
struct DocAccumulator {
    content: String,
    weighted_score: f32,
    matched_by: HashSet<String>,
    signals: Vec<SignalKind>,
}

/// Multi-round retrieval engine
pub struct Anveshana {
    hybrid: Arc<HybridSearch>,
    config: AnveshanaConfig,
}

impl Anveshana {
    pub fn new(hybrid: Arc<HybridSearch>) -> Self {
        Self {
            hybrid,
            config: AnveshanaConfig::default(),
        }
    }

    pub fn with_config(mut self, config: AnveshanaConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &AnveshanaConfig {
        &self.config
    }

    /// Run decomposition, rounds, and fusion
    pub async fn retrieve(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<MultiRoundResult> {
        let sub_queries = if is_complex(query) {
            decompose(query, self.config.max_sub_queries)
        } else {
            vec![SubQuery {
                text: query.trim().to_string(),
                weight: 1.0,
            }]
        };

        let mut docs: HashMap<String, DocAccumulator> = HashMap::new();
        let mut queried: HashSet<String> = HashSet::new();
        let mut all_sub_queries = sub_queries.clone();
        let mut best_score = 0.0f32;
        let mut rounds = 0usize;

        let mut current = sub_queries;
        loop {
            if cancel.is_cancelled() {
                return Err(MemoryError::Cancelled);
            }
            rounds += 1;

            // Fan the round's sub-queries out in parallel
            let searches = current.iter().map(|sq| {
                let hybrid = self.hybrid.clone();
                let text = sq.text.clone();
                let limit = self.config.per_query_limit;
                async move { hybrid.search(&RecallQuery::new(text, limit)).await }
            });
            let outcomes = join_all(searches).await;

            if cancel.is_cancelled() {
                return Err(MemoryError::Cancelled);
            }

            let mut new_docs = 0usize;
            for (sub_query, outcome) in current.iter().zip(outcomes) {
                queried.insert(sub_query.text.to_lowercase());
                let hits = match outcome {
                    Ok(hits) => hits,
                    Err(e) => {
                        tracing::warn!(sub_query = %sub_query.text, error = %e, "sub-query failed");
                        continue;
                    }
                };
                for hit in hits {
                    let entry = docs.entry(hit.doc_id.clone()).or_insert_with(|| {
                        new_docs += 1;
                        DocAccumulator {
                            content: hit.content.clone(),
                            ..Default::default()
                        }
                    });
                    entry.weighted_score += hit.score * sub_query.weight;
                    entry.matched_by.insert(sub_query.text.clone());
                    for signal in hit.signals {
                        if !entry.signals.contains(&signal) {
                            entry.signals.push(signal);
                        }
                    }
                }
            }

            let top = self.fused_top_score(&docs);
            let improved = top - best_score >= self.config.improvement_threshold;
            let stalled = new_docs == 0 && !improved;
            best_score = best_score.max(top);

            if stalled || rounds > self.config.max_rounds {
                break;
            }

            // Follow-ups: key terms the accumulated results do not cover yet
            let covered: String = docs
                .values()
                .map(|d| d.content.to_lowercase())
                .collect::<Vec<_>>()
                .join(" ");
            let follow_ups: Vec<SubQuery> = key_terms(query)
                .into_iter()
                .filter(|term| !covered.contains(term.as_str()))
                .filter(|term| !queried.contains(term))
                .take(2)
                .map(|term| SubQuery {
                    text: term,
                    weight: self.config.follow_up_weight,
                })
                .collect();
            if follow_ups.is_empty() {
                break;
            }
            all_sub_queries.extend(follow_ups.clone());
            current = follow_ups;
        }

        let mut hits: Vec<AnveshanaHit> = docs
            .into_iter()
            .map(|(doc_id, acc)| {
                let boost = self
                    .config
                    .multi_query_boost
                    .powi(acc.matched_by.len().saturating_sub(1) as i32);
                AnveshanaHit {
                    doc_id,
                    content: acc.content,
                    score: acc.weighted_score * boost,
                    matched_queries: acc.matched_by.len(),
                    signals: acc.signals,
                }
            })
            .collect();
        // Id tiebreak keeps identical inputs fully deterministic
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        hits.truncate(self.config.max_results);

        Ok(MultiRoundResult {
            hits,
            sub_queries: all_sub_queries,
            rounds,
        })
    }

    fn fused_top_score(&self, docs: &HashMap<String, DocAccumulator>) -> f32 {
        docs.values()
            .map(|acc| {
                acc.weighted_score
                    * self
                        .config
                        .multi_query_boost
                        .powi(acc.matched_by.len().saturating_sub(1) as i32)
            })
            .fold(0.0, f32::max)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complexity_gate() {
        // Simple
        assert!(!is_complex("argon2 settings"));
        assert!(!is_complex("deploy steps"));
        // Word count
        assert!(is_complex(
            "show me every note from the database migration planning effort"
        ));
        // Conjunction
        assert!(is_complex("auth and storage"));
        // Temporal
        assert!(is_complex("deploys yesterday"));
        // Comparative
        assert!(is_complex("postgres vs sqlite"));
        // Quoted phrases
        assert!(is_complex("\"rate limiter\" \"token bucket\""));
        // Mid-sentence capitalised tokens
        assert!(is_complex("compare Redis Postgres"));
    }

    #[test]
    fn test_decompose_comparative() {
        let subs = decompose("postgres vs sqlite", 4);
        assert_eq!(subs.len(), 3);
        assert_eq!(subs[0].text, "postgres vs sqlite");
        assert_eq!(subs[0].weight, 1.0);
        assert_eq!(subs[1].text, "postgres");
        assert!((subs[1].weight - 0.8).abs() < 1e-6);
        assert_eq!(subs[2].text, "sqlite");
        assert!((subs[2].weight - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_decompose_difference() {
        let subs = decompose("what is the difference between tokio and async-std", 4);
        let texts: Vec<&str> = subs.iter().map(|s| s.text.as_str()).collect();
        assert!(texts.contains(&"tokio"));
        assert!(texts.contains(&"async-std"));
    }

    #[test]
    fn test_decompose_causal() {
        let subs = decompose("the outage happened because the cache was cold", 4);
        assert!(subs.len() >= 3);
        assert!(subs.iter().any(|s| s.text.contains("outage")));
        assert!(subs.iter().any(|s| s.text.contains("cache")));
    }

    #[test]
    fn test_decompose_entity_list() {
        let subs = decompose("sessions, retrieval, and consolidation", 4);
        let texts: Vec<&str> = subs.iter().map(|s| s.text.as_str()).collect();
        assert!(texts.contains(&"sessions"));
        assert!(texts.contains(&"retrieval"));
        assert!(texts.contains(&"consolidation"));
    }

    #[test]
    fn test_decompose_conjunction_s4() {
        let query = "What decisions about auth affected the API layer and the storage layer?";
        let subs = decompose(query, 4);
        assert!(subs.len() >= 3);
        assert_eq!(subs[0].weight, 1.0);
        assert!(subs
            .iter()
            .any(|s| s.text.to_lowercase().contains("api layer")));
        assert!(subs
            .iter()
            .any(|s| s.text.to_lowercase().contains("storage layer")));
    }

    #[test]
    fn test_decompose_caps_at_max() {
        let subs = decompose("alpha, beta, gamma, delta, and epsilon", 4);
        assert_eq!(subs.len(), 4);
        assert_eq!(subs[0].weight, 1.0);
        // Weights never fall under the floor
        assert!(subs.iter().all(|s| s.weight >= 0.4));
    }

    #[test]
    fn test_weight_floor() {
        assert!((positional_weight(1) - 0.8).abs() < 1e-6);
        assert!((positional_weight(2) - 0.6).abs() < 1e-6);
        assert!((positional_weight(3) - 0.4).abs() < 1e-6);
        assert!((positional_weight(9) - 0.4).abs() < 1e-6);
    }

    #[test]
    fn test_key_terms_filters_stop_words() {
        let terms = key_terms("What did we decide about the storage layer?");
        assert!(terms.contains(&"decide".to_string()));
        assert!(terms.contains(&"storage".to_string()));
        assert!(!terms.contains(&"the".to_string()));
        assert!(!terms.contains(&"we".to_string()));
    }

    #[test]
    fn test_multi_query_boost_formula() {
        // found by n sub-queries -> boost^(n-1)
        let config = AnveshanaConfig::default();
        let boost = |n: usize| config.multi_query_boost.powi(n.saturating_sub(1) as i32);
        assert!((boost(1) - 1.0).abs() < 1e-6);
        assert!((boost(2) - 1.3).abs() < 1e-6);
        assert!((boost(3) - 1.69).abs() < 1e-6);
    }
}
