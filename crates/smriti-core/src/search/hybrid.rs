//! Hybrid search
//!
//! Four signal producers (lexical, vector, graph, provenance) fused with
//! weighted Reciprocal Rank Fusion and boosted by multi-scale temporal
//! relevance. A failing producer degrades to an empty ranking; the fused
//! result is exactly what the remaining signals would have produced alone.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::fts::LexicalSearcher;
use crate::embeddings::EmbeddingClient;
use crate::error::{MemoryError, Result};
use crate::graph::{GraphStore, PersonalizedPageRank};
use crate::kala::KalaChakra;
use crate::memory::{MemoryScope, SmaranStore};
use crate::vector::VectorStore;

// ============================================================================
// SIGNALS AND WEIGHTS
// ============================================================================

/// The four signal producers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Lexical,
    Vector,
    Graph,
    Provenance,
}

impl SignalKind {
    pub const ALL: [SignalKind; 4] = [
        SignalKind::Lexical,
        SignalKind::Vector,
        SignalKind::Graph,
        SignalKind::Provenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Lexical => "lexical",
            SignalKind::Vector => "vector",
            SignalKind::Graph => "graph",
            SignalKind::Provenance => "provenance",
        }
    }
}

/// Per-signal fusion weights
///
/// Stored behind an `RwLock` and swapped whole, so readers never observe a
/// half-updated vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalWeights {
    pub lexical: f32,
    pub vector: f32,
    pub graph: f32,
    pub provenance: f32,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            lexical: 0.30,
            vector: 0.40,
            graph: 0.20,
            provenance: 0.10,
        }
    }
}

impl SignalWeights {
    /// Clamp each weight to [0, 1] and renormalise to sum 1
    pub fn normalized(mut self) -> Self {
        for w in [
            &mut self.lexical,
            &mut self.vector,
            &mut self.graph,
            &mut self.provenance,
        ] {
            *w = w.clamp(0.0, 1.0);
        }
        let sum = self.lexical + self.vector + self.graph + self.provenance;
        if sum > 0.0 {
            self.lexical /= sum;
            self.vector /= sum;
            self.graph /= sum;
            self.provenance /= sum;
            self
        } else {
            Self::default()
        }
    }

    pub fn get(&self, kind: SignalKind) -> f32 {
        match kind {
            SignalKind::Lexical => self.lexical,
            SignalKind::Vector => self.vector,
            SignalKind::Graph => self.graph,
            SignalKind::Provenance => self.provenance,
        }
    }
}

// ============================================================================
// WEIGHT LEARNER HOOK
// ============================================================================

/// Feedback about which results the user actually accepted
#[derive(Debug, Clone)]
pub struct RecallFeedback {
    pub query: String,
    /// Document ids the user accepted
    pub accepted: Vec<String>,
    /// Per-signal top-K rankings from the query that produced the results
    pub per_signal_top_k: HashMap<SignalKind, Vec<String>>,
}

/// Online weight learner seam
///
/// The update rule is intentionally left to implementations; returning
/// `None` keeps the current weights.
pub trait WeightLearner: Send + Sync {
    fn observe(&self, feedback: &RecallFeedback) -> Option<SignalWeights>;
}

/// Default learner: never adjusts
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLearner;

impl WeightLearner for NoopLearner {
    fn observe(&self, _feedback: &RecallFeedback) -> Option<SignalWeights> {
        None
    }
}

// ============================================================================
// CONFIG AND QUERY TYPES
// ============================================================================

/// Hybrid search tunables
#[derive(Debug, Clone)]
pub struct HybridSearchConfig {
    /// RRF constant
    pub rrf_k: f32,
    /// Minimum cosine similarity for vector candidates
    pub min_similarity: f32,
    /// Minimum (pramana, viveka) reliability for provenance candidates
    pub min_reliability: f32,
    /// Fetch multiplier applied to each signal before fusion
    pub source_limit_multiplier: usize,
    /// Queries shorter than this skip retrieval entirely
    pub min_retrieval_chars: usize,
}

impl Default for HybridSearchConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            min_similarity: 0.25,
            min_reliability: 0.5,
            source_limit_multiplier: 3,
            min_retrieval_chars: 4,
        }
    }
}

/// A recall query
#[derive(Debug, Clone)]
pub struct RecallQuery {
    pub text: String,
    pub limit: usize,
    /// Explicit time scope; edges and boosts evaluate as of this moment
    pub valid_at: Option<DateTime<Utc>>,
}

impl RecallQuery {
    pub fn new(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            limit,
            valid_at: None,
        }
    }
}

/// One fused result
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecallHit {
    /// Stable document id, e.g. `turn:<session>:<ordinal>` or `node:<id>`
    pub doc_id: String,
    pub content: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// Which signals produced this document
    pub signals: Vec<SignalKind>,
}

/// Fused hits plus the per-signal rankings that produced them
#[derive(Debug, Clone)]
pub struct RecallResponse {
    pub hits: Vec<RecallHit>,
    pub per_signal_top_k: HashMap<SignalKind, Vec<String>>,
}

/// A candidate before fusion
#[derive(Debug, Clone)]
struct Candidate {
    doc_id: String,
    content: String,
    timestamp: Option<DateTime<Utc>>,
}

// ============================================================================
// SHOULD-RETRIEVE PREDICATE
// ============================================================================

const GREETINGS: &[&str] = &[
    "hi", "hello", "hey", "yo", "thanks", "thank", "you", "ok", "okay", "yes", "no", "yep",
    "nope", "bye", "goodbye", "cool", "nice", "sure", "great", "lol",
];

/// Whether a message warrants retrieval at all
///
/// Short acknowledgements, pure greetings, and pure punctuation skip the
/// whole pipeline.
pub fn should_retrieve(text: &str, min_chars: usize) -> bool {
    let trimmed = text.trim();
    if trimmed.len() < min_chars {
        return false;
    }
    if trimmed.chars().all(|c| !c.is_alphanumeric()) {
        return false;
    }
    let words: Vec<String> = trimmed
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.chars().filter(|c| c.is_alphanumeric()).collect())
        .filter(|w: &String| !w.is_empty())
        .collect();
    if words.is_empty() {
        return false;
    }
    if words.len() <= 3 && words.iter().all(|w| GREETINGS.contains(&w.as_str())) {
        return false;
    }
    true
}

// ============================================================================
// HYBRID SEARCH
// ============================================================================

/// The fused retrieval engine
pub struct HybridSearch {
    lexical: LexicalSearcher,
    graph: Arc<GraphStore>,
    vectors: Arc<VectorStore>,
    embeddings: Arc<EmbeddingClient>,
    kala: Arc<KalaChakra>,
    smaran: Option<Arc<SmaranStore>>,
    pagerank: PersonalizedPageRank,
    weights: RwLock<SignalWeights>,
    learner: Box<dyn WeightLearner>,
    /// Query-embedding cache; repeated queries skip the provider round-trip
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
    config: HybridSearchConfig,
}

impl HybridSearch {
    pub fn new(
        agent_db: Arc<crate::db::Database>,
        graph: Arc<GraphStore>,
        vectors: Arc<VectorStore>,
        embeddings: Arc<EmbeddingClient>,
        kala: Arc<KalaChakra>,
    ) -> Self {
        Self {
            lexical: LexicalSearcher::new(agent_db),
            graph,
            vectors,
            embeddings,
            kala,
            smaran: None,
            pagerank: PersonalizedPageRank::default(),
            weights: RwLock::new(SignalWeights::default()),
            learner: Box::new(NoopLearner),
            query_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(100).expect("100 is non-zero"),
            )),
            config: HybridSearchConfig::default(),
        }
    }

    /// Include scope memory files in the lexical signal
    pub fn with_smaran(mut self, smaran: Arc<SmaranStore>) -> Self {
        self.smaran = Some(smaran);
        self
    }

    pub fn with_config(mut self, config: HybridSearchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_learner(mut self, learner: Box<dyn WeightLearner>) -> Self {
        self.learner = learner;
        self
    }

    /// Current weight vector
    pub fn weights(&self) -> SignalWeights {
        self.weights
            .read()
            .map(|w| *w)
            .unwrap_or_default()
    }

    /// Feed acceptance feedback to the learner; a returned vector is
    /// normalised and swapped in atomically
    pub fn record_feedback(&self, feedback: &RecallFeedback) {
        if let Some(new_weights) = self.learner.observe(feedback) {
            if let Ok(mut weights) = self.weights.write() {
                *weights = new_weights.normalized();
                tracing::debug!(?new_weights, "signal weights updated");
            }
        }
    }

    // ------------------------------------------------------------------
    // SIGNAL PRODUCERS
    // ------------------------------------------------------------------

    fn lexical_signal(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        let mut candidates: Vec<Candidate> = self
            .lexical
            .search(query, limit)?
            .into_iter()
            .map(|hit| Candidate {
                doc_id: format!("turn:{}:{}", hit.session_id, hit.ordinal),
                content: hit.content,
                timestamp: Some(hit.created_at),
            })
            .collect();

        // Scope memory files participate lexically by token overlap
        if let Some(smaran) = &self.smaran {
            let tokens: Vec<String> = query
                .to_lowercase()
                .split_whitespace()
                .map(String::from)
                .collect();
            let entries = smaran.recall(&MemoryScope::Global, None)?;
            let mut scored: Vec<(usize, crate::memory::SmaranEntry)> = entries
                .into_iter()
                .filter_map(|entry| {
                    let content = entry.content.to_lowercase();
                    let overlap = tokens.iter().filter(|t| content.contains(*t)).count();
                    (overlap > 0).then_some((overlap, entry))
                })
                .collect();
            scored.sort_by(|a, b| b.0.cmp(&a.0));
            candidates.extend(scored.into_iter().take(limit).map(|(_, entry)| Candidate {
                doc_id: format!("smaran:{}", entry.id),
                content: entry.content,
                timestamp: Some(entry.created_at),
            }));
        }
        Ok(candidates)
    }

    async fn query_embedding(&self, query: &str) -> Vec<f32> {
        if let Ok(mut cache) = self.query_cache.lock() {
            if let Some(vector) = cache.get(query) {
                return vector.clone();
            }
        }
        let vector = self.embeddings.embed_one(query).await;
        if let Ok(mut cache) = self.query_cache.lock() {
            cache.put(query.to_string(), vector.clone());
        }
        vector
    }

    async fn vector_signal(&self, query: &str, limit: usize) -> Result<Vec<Candidate>> {
        let embedding = self.query_embedding(query).await;
        let matches = self
            .vectors
            .search(&embedding, &[], limit, self.config.min_similarity)?;
        Ok(matches
            .into_iter()
            .map(|m| Candidate {
                doc_id: format!("{}:{}", m.record.source_type, m.record.source_id),
                content: m.record.text,
                timestamp: Some(m.record.created_at),
            })
            .collect())
    }

    fn graph_signal(
        &self,
        query: &str,
        at: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let tokens: Vec<String> = query.split_whitespace().map(String::from).collect();
        let seeds = self.graph.nodes_matching(&tokens)?;
        if seeds.is_empty() {
            return Ok(Vec::new());
        }
        let teleport: Vec<String> = seeds.iter().map(|n| n.id.clone()).collect();
        let adjacency = self.graph.adjacency_at(at)?;
        let scores = self.pagerank.rank(&adjacency, &teleport);

        let labels: HashMap<String, (String, DateTime<Utc>)> = seeds
            .into_iter()
            .map(|n| (n.id.clone(), (n.label, n.updated_at)))
            .collect();

        let mut ranked: Vec<(String, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let mut candidates = Vec::new();
        for (node_id, score) in ranked.into_iter().take(limit) {
            if score <= 0.0 {
                continue;
            }
            let (content, timestamp) = match labels.get(&node_id) {
                Some((label, updated)) => (label.clone(), Some(*updated)),
                None => match self.graph.get_node(&node_id)? {
                    Some(node) => (node.label, Some(node.updated_at)),
                    None => (node_id.clone(), None),
                },
            };
            candidates.push(Candidate {
                doc_id: format!("node:{node_id}"),
                content,
                timestamp,
            });
        }
        Ok(candidates)
    }

    fn provenance_signal(
        &self,
        query: &str,
        at: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candidate>> {
        let tokens: Vec<String> = query
            .to_lowercase()
            .split_whitespace()
            .filter(|t| t.len() >= 3)
            .map(String::from)
            .collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(f32, Candidate)> = Vec::new();
        for edge in self.graph.query_at(at)? {
            let reliability = edge.reliability();
            if reliability < self.config.min_reliability {
                continue;
            }
            let haystack = format!(
                "{} {} {}",
                edge.source.to_lowercase(),
                edge.relationship.to_lowercase(),
                edge.target.to_lowercase()
            );
            if !tokens.iter().any(|t| haystack.contains(t)) {
                continue;
            }
            let half_life = self.graph.config().half_life_days(&edge.relationship);
            let score = reliability * edge.effective_weight(at, half_life) as f32;
            scored.push((
                score,
                Candidate {
                    doc_id: format!("edge:{}", edge.id),
                    content: format!("{} {} {}", edge.source, edge.relationship, edge.target),
                    timestamp: Some(edge.recorded_at),
                },
            ));
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(_, c)| c).collect())
    }

    // ------------------------------------------------------------------
    // FUSION
    // ------------------------------------------------------------------

    /// Run all signals and fuse; also returns per-signal rankings
    pub async fn search_detailed(&self, query: &RecallQuery) -> Result<RecallResponse> {
        if !should_retrieve(&query.text, self.config.min_retrieval_chars) {
            return Ok(RecallResponse {
                hits: Vec::new(),
                per_signal_top_k: HashMap::new(),
            });
        }

        let at = query.valid_at.unwrap_or_else(Utc::now);
        let fetch = query.limit.max(1) * self.config.source_limit_multiplier;

        let mut rankings: HashMap<SignalKind, Vec<Candidate>> = HashMap::new();
        let mut run = |kind: SignalKind, result: Result<Vec<Candidate>>| match result {
            Ok(candidates) => {
                rankings.insert(kind, candidates);
            }
            Err(e) => {
                // A failed producer degrades to an empty ranking
                tracing::warn!(signal = kind.as_str(), error = %e, "signal producer failed");
            }
        };

        run(SignalKind::Lexical, self.lexical_signal(&query.text, fetch));
        run(
            SignalKind::Vector,
            self.vector_signal(&query.text, fetch).await,
        );
        run(SignalKind::Graph, self.graph_signal(&query.text, at, fetch));
        run(
            SignalKind::Provenance,
            self.provenance_signal(&query.text, at, fetch),
        );

        let weights = self.weights();
        let now = query.valid_at.unwrap_or_else(Utc::now);

        // Weighted RRF: score(d) = sum over signals of w_s / (k + rank_s(d))
        let mut fused: HashMap<String, RecallHit> = HashMap::new();
        for (&kind, candidates) in &rankings {
            let weight = weights.get(kind);
            for (rank, candidate) in candidates.iter().enumerate() {
                let contribution = weight / (self.config.rrf_k + rank as f32);
                let entry = fused
                    .entry(candidate.doc_id.clone())
                    .or_insert_with(|| RecallHit {
                        doc_id: candidate.doc_id.clone(),
                        content: candidate.content.clone(),
                        score: 0.0,
                        timestamp: candidate.timestamp,
                        signals: Vec::new(),
                    });
                entry.score += contribution;
                if !entry.signals.contains(&kind) {
                    entry.signals.push(kind);
                }
                if entry.timestamp.is_none() {
                    entry.timestamp = candidate.timestamp;
                }
            }
        }

        // Temporal boost; never suppresses below half of the fused score
        let mut hits: Vec<RecallHit> = fused
            .into_values()
            .map(|mut hit| {
                let boost = match hit.timestamp {
                    Some(ts) => self.kala.boost(ts, now) as f32,
                    None => 1.0,
                };
                hit.score *= boost;
                hit
            })
            .collect();
        // Id tiebreak keeps identical queries fully deterministic
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        hits.truncate(query.limit);

        let per_signal_top_k = rankings
            .into_iter()
            .map(|(kind, candidates)| {
                (
                    kind,
                    candidates.into_iter().map(|c| c.doc_id).collect::<Vec<_>>(),
                )
            })
            .collect();

        Ok(RecallResponse {
            hits,
            per_signal_top_k,
        })
    }

    /// Run all signals and fuse to the top-K hits
    pub async fn search(&self, query: &RecallQuery) -> Result<Vec<RecallHit>> {
        Ok(self.search_detailed(query).await?.hits)
    }

    /// Paged variant: materialises the ranking once and yields pages on
    /// demand; cancelling the token invalidates the cursor
    pub async fn search_paged(
        &self,
        query: &RecallQuery,
        page_size: usize,
        cancel: CancellationToken,
    ) -> Result<RecallCursor> {
        let hits = self.search(query).await?;
        Ok(RecallCursor {
            hits,
            page_size: page_size.max(1),
            offset: 0,
            cancel,
        })
    }
}

// ============================================================================
// CURSOR
// ============================================================================

/// Pull-model pagination over a recall result
pub struct RecallCursor {
    hits: Vec<RecallHit>,
    page_size: usize,
    offset: usize,
    cancel: CancellationToken,
}

impl RecallCursor {
    /// Next page, `None` once exhausted; `Cancelled` once the token fires
    pub fn next_page(&mut self) -> Result<Option<Vec<RecallHit>>> {
        if self.cancel.is_cancelled() {
            return Err(MemoryError::Cancelled);
        }
        if self.offset >= self.hits.len() {
            return Ok(None);
        }
        let end = (self.offset + self.page_size).min(self.hits.len());
        let page = self.hits[self.offset..end].to_vec();
        self.offset = end;
        Ok(Some(page))
    }

    /// Total hits behind this cursor
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HomeLayout;
    use crate::db::{
        Database, AGENT_MIGRATIONS, AGENT_SCHEMA, GRAPH_MIGRATIONS, GRAPH_SCHEMA,
        VECTOR_MIGRATIONS, VECTOR_SCHEMA,
    };
    use crate::graph::{GraphConfig, NewEdge, Pramana, Viveka};
    use crate::session::{CreateSessionOptions, NewTurn, SessionStore};
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        search: HybridSearch,
        graph: Arc<GraphStore>,
        sessions: SessionStore,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let layout = HomeLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        let agent_db = Arc::new(
            Database::open(layout.agent_db(), AGENT_SCHEMA, AGENT_MIGRATIONS).unwrap(),
        );
        let graph_db = Arc::new(
            Database::open(layout.graph_db(), GRAPH_SCHEMA, GRAPH_MIGRATIONS).unwrap(),
        );
        let vector_db = Arc::new(
            Database::open(layout.vectors_db(), VECTOR_SCHEMA, VECTOR_MIGRATIONS).unwrap(),
        );
        let graph = Arc::new(GraphStore::new(graph_db, GraphConfig::default()));
        let vectors = Arc::new(VectorStore::new(vector_db));
        let embeddings = Arc::new(EmbeddingClient::fallback_only());
        let kala = Arc::new(KalaChakra::default());
        let sessions = SessionStore::new(agent_db.clone(), layout);
        let search = HybridSearch::new(agent_db, graph.clone(), vectors, embeddings, kala);
        Fixture {
            _dir: dir,
            search,
            graph,
            sessions,
        }
    }

    fn seed_turns(fixture: &Fixture, turns: &[&str]) {
        let session = fixture
            .sessions
            .create(CreateSessionOptions {
                project: "/p".into(),
                title: "t".into(),
                agent: "a".into(),
                model: "m".into(),
                tags: vec![],
            })
            .unwrap();
        for turn in turns {
            fixture
                .sessions
                .append(&session.meta.id, NewTurn::user(*turn))
                .unwrap();
        }
    }

    #[test]
    fn test_should_retrieve_predicate() {
        assert!(!should_retrieve("hi", 4));
        assert!(!should_retrieve("ok thanks", 4));
        assert!(!should_retrieve("?!...", 4));
        assert!(!should_retrieve("   ", 4));
        assert!(should_retrieve("what did we decide about auth", 4));
        assert!(should_retrieve("postgres timeout settings", 4));
    }

    #[test]
    fn test_weights_normalize_and_clamp() {
        let weights = SignalWeights {
            lexical: 2.0,
            vector: -1.0,
            graph: 1.0,
            provenance: 1.0,
        }
        .normalized();
        let sum = weights.lexical + weights.vector + weights.graph + weights.provenance;
        assert!((sum - 1.0).abs() < 1e-6);
        assert_eq!(weights.vector, 0.0);
    }

    #[tokio::test]
    async fn test_search_finds_lexical_and_vector_hits() {
        let fixture = fixture();
        seed_turns(
            &fixture,
            &[
                "we picked argon2 for password hashing",
                "lunch was sandwiches",
            ],
        );

        let hits = fixture
            .search
            .search(&RecallQuery::new("argon2 password hashing", 10))
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0].content.contains("argon2"));
        assert!(hits[0].signals.contains(&SignalKind::Lexical));
    }

    #[tokio::test]
    async fn test_degrades_when_graph_signal_fails() {
        let fixture = fixture();
        seed_turns(&fixture, &["the auth service uses jwt tokens"]);
        fixture
            .graph
            .upsert_node("auth", "entity", "auth service")
            .unwrap();

        let query = RecallQuery::new("auth service tokens", 10);
        let healthy = fixture.search.search(&query).await.unwrap();

        // Break the graph database underneath the store
        fixture
            .graph
            .database()
            .writer()
            .unwrap()
            .execute_batch("DROP TABLE edges;")
            .unwrap();
        let degraded = fixture.search.search(&query).await.unwrap();

        // The surviving signals still answer, and turn hits are identical
        let healthy_turns: Vec<&String> = healthy
            .iter()
            .filter(|h| h.doc_id.starts_with("turn:"))
            .map(|h| &h.doc_id)
            .collect();
        let degraded_turns: Vec<&String> = degraded
            .iter()
            .filter(|h| h.doc_id.starts_with("turn:"))
            .map(|h| &h.doc_id)
            .collect();
        assert_eq!(healthy_turns, degraded_turns);
        assert!(!degraded_turns.is_empty());
    }

    #[tokio::test]
    async fn test_provenance_signal_respects_reliability_floor() {
        let fixture = fixture();
        let now = Utc::now();
        for (target, pramana, viveka) in [
            ("postgres", Pramana::Pratyaksha, Viveka::Grounded),
            ("redis", Pramana::Shabda, Viveka::Speculative),
        ] {
            fixture
                .graph
                .create_edge(NewEdge {
                    source: "api".into(),
                    target: target.into(),
                    relationship: "uses".into(),
                    weight: 1.0,
                    pramana,
                    viveka,
                    valid_from: now,
                    valid_to: None,
                })
                .unwrap();
        }

        let response = fixture
            .search
            .search_detailed(&RecallQuery::new("what does the api use postgres redis", 10))
            .await
            .unwrap();
        let provenance = &response.per_signal_top_k[&SignalKind::Provenance];
        // Only the grounded direct observation clears the reliability floor
        assert_eq!(provenance.len(), 1);
        let hit = response
            .hits
            .iter()
            .find(|h| h.doc_id == provenance[0])
            .unwrap();
        assert!(hit.content.contains("postgres"));
    }

    #[tokio::test]
    async fn test_temporal_boost_orders_equal_hits() {
        // Directly check the boost shape used by fusion (scenario S3)
        let kala = KalaChakra::default();
        let now = Utc::now();
        let fresh = 0.80 * kala.boost(now - chrono::Duration::minutes(5), now);
        let stale = 0.80 * kala.boost(now - chrono::Duration::days(90), now);
        assert!((fresh - 0.79).abs() < 0.02);
        assert!((stale - 0.45).abs() < 0.03);
    }

    #[test]
    fn test_learner_hook_swaps_weights_atomically() {
        struct FavourVectors;
        impl WeightLearner for FavourVectors {
            fn observe(&self, _feedback: &RecallFeedback) -> Option<SignalWeights> {
                Some(SignalWeights {
                    lexical: 0.1,
                    vector: 0.7,
                    graph: 0.1,
                    provenance: 0.1,
                })
            }
        }

        let fixture = fixture();
        let search = fixture.search.with_learner(Box::new(FavourVectors));
        let before = search.weights();
        assert!((before.vector - 0.40).abs() < 1e-6);

        search.record_feedback(&RecallFeedback {
            query: "anything".into(),
            accepted: vec!["turn:s:1".into()],
            per_signal_top_k: HashMap::new(),
        });
        let after = search.weights();
        assert!((after.vector - 0.7).abs() < 1e-6);
        // The swapped vector is still a normalised weight vector
        let sum = after.lexical + after.vector + after.graph + after.provenance;
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_cursor_pages_and_cancels() {
        let fixture = fixture();
        seed_turns(
            &fixture,
            &[
                "alpha beta gamma",
                "alpha beta delta",
                "alpha beta epsilon",
            ],
        );
        let cancel = CancellationToken::new();
        let mut cursor = fixture
            .search
            .search_paged(&RecallQuery::new("alpha beta", 10), 2, cancel.clone())
            .await
            .unwrap();

        let first = cursor.next_page().unwrap().unwrap();
        assert_eq!(first.len(), 2);

        cancel.cancel();
        assert!(matches!(cursor.next_page(), Err(MemoryError::Cancelled)));
    }
}
