//! # Smriti Core
//!
//! Persistent memory core for a long-running personal assistant:
//!
//! - **Session Store**: append-only, branchable conversations with a
//!   markdown source of truth and an FTS5-indexed relational mirror
//! - **Hybrid Search**: lexical, vector, graph, and provenance signals
//!   fused by weighted Reciprocal Rank Fusion, boosted by temporal relevance
//! - **Anveshana**: heuristic query decomposition and multi-round retrieval
//!   with adaptive termination
//! - **Kala Chakra**: seven-scale exponential-decay relevance scoring
//! - **Bi-Temporal Graph**: valid-time and transaction-time edges with
//!   provenance tiers, community detection, and personalised PageRank
//! - **Consolidation**: event-chain extraction, day/month/year summaries,
//!   vasana crystallisation, samskara rules, self-recognition context,
//!   the Nidra sleep cycle, and the Nava Rasa affective state
//!
//! The surrounding CLI, HTTP adapters, and provider bridges are external
//! collaborators: they submit turns, request recall, and trigger
//! consolidation through the contracts in [`embeddings`], [`policy`], and
//! [`consolidation::nidra`].
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use smriti_core::{HomeLayout, MemoryCore, NewTurn, RecallQuery};
//!
//! let core = MemoryCore::open(HomeLayout::new("/home/me/.smriti"))?;
//!
//! let session = core.sessions.create(Default::default())?;
//! core.sessions.append(&session.meta.id, NewTurn::user("we picked sqlite"))?;
//!
//! let hits = core.search.search(&RecallQuery::new("which database", 10)).await?;
//! ```

// ============================================================================
// MODULES
// ============================================================================

pub mod anveshana;
pub mod checkpoint;
pub mod config;
pub mod consolidation;
pub mod core;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod events;
pub mod graph;
pub mod kala;
pub mod memory;
pub mod policy;
pub mod search;
pub mod session;
pub mod vector;

// ============================================================================
// PUBLIC API RE-EXPORTS
// ============================================================================

pub use error::{MemoryError, Result, RetryPolicy};

pub use config::{project_hash, HomeLayout, DEFAULT_MAX_CHECKPOINTS, MAX_MEMORY_SIZE};

pub use events::{EventBus, MemoryEvent};

pub use db::{Database, DatabaseReader, Migration, Row};

pub use session::{
    new_session_id, parse_session, session_id_date, write_session, CreateSessionOptions, NewTurn,
    Session, SessionMeta, SessionStore, SessionSummary, SessionTree, SessionTreeNode, ToolCall,
    Turn, TurnRole,
};

pub use embeddings::{
    cosine_similarity, Embedding, EmbeddingClient, EmbeddingProvider, FallbackEmbedder,
    FALLBACK_DIMENSIONS,
};

pub use vector::{VectorMatch, VectorRecord, VectorStore, VectorUpsert};

pub use kala::{KalaChakra, KalaConfig, KalaContext, ScaleSnapshot, TimeScale};

pub use graph::{
    reliability, CommunityConfig, CommunityDetector, GraphConfig, GraphEdge, GraphNode,
    GraphStore, NewEdge, PageRankConfig, PersonalizedPageRank, Pramana, Viveka, XorShift64,
};

pub use search::{
    sanitize_fts_query, should_retrieve, HybridSearch, HybridSearchConfig, NoopLearner,
    RecallCursor, RecallFeedback, RecallHit, RecallQuery, RecallResponse, SignalKind,
    SignalWeights, WeightLearner,
};

pub use anveshana::{
    decompose, is_complex, Anveshana, AnveshanaConfig, AnveshanaHit, MultiRoundResult, SubQuery,
};

pub use memory::{
    MemoryFileStore, MemoryScope, SmaranCategory, SmaranEntry, SmaranStore,
    MEMORY_FILE_HEADER_MARKER,
};

pub use checkpoint::CheckpointStore;

pub use policy::{AllowAll, PolicyDecision, PolicyEngine};

pub use consolidation::{
    classify, extract, extract_excerpt, rule_id, BehavioralAdaptation, ChainEvent,
    ConsolidationIndexer, ConsolidationPipeline, ConsolidationRule, CoreSessionClass, CycleReport,
    DaySummary, DayWriter, DreamHandler, EventChain, EventKind, ExtendedDomain, IndexSelfReport,
    MonthSummary, MonthWriter, NavaRasa, NavaRasaConfig, NidraConfig, NidraCycle, NidraPhase,
    PatternKind, Pratyabhijna, PratyabhijnaContext, Rasa, RasaSnapshot, SamskaraConfig,
    SamskaraEngine, SamskaraReport, SelfReport, SessionClass, SummaryLevel, Valence, Vasana,
    VasanaConfig, VasanaEngine, VasanaGlimpse, VasanaObservation, YearSummary, YearWriter,
    EXCERPT_CAP, GLOBAL_PROJECT,
};

pub use crate::core::{MemoryCore, MemoryCoreBuilder};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// PRELUDE
// ============================================================================

/// Convenient imports for common usage
pub mod prelude {
    pub use crate::{
        Anveshana, CreateSessionOptions, EventBus, GraphStore, HomeLayout, HybridSearch,
        KalaChakra, MemoryCore, MemoryError, MemoryEvent, MemoryScope, NewTurn, RecallHit,
        RecallQuery, Result, Session, SessionStore, SmaranCategory, SmaranStore, ToolCall, Turn,
        TurnRole, VectorStore,
    };

    pub use crate::{
        ConsolidationPipeline, DayWriter, NavaRasa, NidraConfig, NidraCycle, Pratyabhijna,
        SamskaraEngine, VasanaEngine,
    };
}
