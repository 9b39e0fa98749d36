//! MemoryCore facade
//!
//! Wires the stores, engines, and event bus together from a home directory
//! plus injected collaborators (embedding provider, policy engine). All
//! components stay independently usable; the facade only handles
//! construction order and shared handles.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::anveshana::Anveshana;
use crate::checkpoint::CheckpointStore;
use crate::config::HomeLayout;
use crate::consolidation::{
    ConsolidationIndexer, ConsolidationPipeline, DayWriter, DreamHandler, IndexSelfReport,
    MonthWriter, NidraConfig, NidraCycle, Pratyabhijna, SamskaraConfig, SamskaraEngine,
    VasanaConfig, VasanaEngine, YearWriter,
};
use crate::db::{
    Database, AGENT_MIGRATIONS, AGENT_SCHEMA, GRAPH_MIGRATIONS, GRAPH_SCHEMA, VECTOR_MIGRATIONS,
    VECTOR_SCHEMA,
};
use crate::embeddings::{EmbeddingClient, EmbeddingProvider, DEFAULT_EMBED_TIMEOUT};
use crate::error::Result;
use crate::events::EventBus;
use crate::graph::{GraphConfig, GraphStore};
use crate::kala::KalaChakra;
use crate::memory::{MemoryFileStore, SmaranStore};
use crate::policy::{AllowAll, PolicyEngine};
use crate::search::HybridSearch;
use crate::session::SessionStore;
use crate::vector::VectorStore;

// ============================================================================
// BUILDER
// ============================================================================

/// Construction options for [`MemoryCore`]
pub struct MemoryCoreBuilder {
    layout: HomeLayout,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    embed_timeout: Duration,
    policy: Arc<dyn PolicyEngine>,
}

impl MemoryCoreBuilder {
    pub fn new(layout: HomeLayout) -> Self {
        Self {
            layout,
            embedding_provider: None,
            embed_timeout: DEFAULT_EMBED_TIMEOUT,
            policy: Arc::new(AllowAll),
        }
    }

    /// Wire an external embedding provider
    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    /// Deadline for provider calls before the hash-trick fallback kicks in
    pub fn embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = timeout;
        self
    }

    /// Wire an external policy engine
    pub fn policy(mut self, policy: Arc<dyn PolicyEngine>) -> Self {
        self.policy = policy;
        self
    }

    /// Open databases, run migrations, and wire everything
    pub fn build(self) -> Result<MemoryCore> {
        self.layout.ensure_dirs()?;

        let agent_db = Arc::new(Database::open(
            self.layout.agent_db(),
            AGENT_SCHEMA,
            AGENT_MIGRATIONS,
        )?);
        let graph_db = Arc::new(Database::open(
            self.layout.graph_db(),
            GRAPH_SCHEMA,
            GRAPH_MIGRATIONS,
        )?);
        let vector_db = Arc::new(Database::open(
            self.layout.vectors_db(),
            VECTOR_SCHEMA,
            VECTOR_MIGRATIONS,
        )?);

        let bus = EventBus::default();
        let embeddings = Arc::new(match self.embedding_provider {
            Some(provider) => EmbeddingClient::new(provider, self.embed_timeout),
            None => EmbeddingClient::fallback_only(),
        });

        let sessions = Arc::new(SessionStore::new(agent_db.clone(), self.layout.clone()));
        let graph = Arc::new(GraphStore::new(graph_db, GraphConfig::default()));
        let vectors = Arc::new(VectorStore::new(vector_db));
        let kala = Arc::new(KalaChakra::default());

        let memory_files = Arc::new(MemoryFileStore::new(
            self.layout.clone(),
            self.policy.clone(),
        ));
        let smaran = Arc::new(SmaranStore::new(memory_files.clone()));

        let search = Arc::new(
            HybridSearch::new(
                agent_db.clone(),
                graph.clone(),
                vectors.clone(),
                embeddings.clone(),
                kala.clone(),
            )
            .with_smaran(smaran.clone()),
        );
        let anveshana = Arc::new(Anveshana::new(search.clone()));

        let vasanas = Arc::new(VasanaEngine::new(agent_db.clone(), VasanaConfig::default()));
        let samskaras = Arc::new(SamskaraEngine::new(
            agent_db.clone(),
            SamskaraConfig::default(),
        ));
        let day_writer = Arc::new(DayWriter::new(
            sessions.clone(),
            agent_db.clone(),
            self.layout.clone(),
            self.policy.clone(),
            bus.clone(),
        ));
        let month_writer = Arc::new(MonthWriter::new(
            sessions.clone(),
            agent_db.clone(),
            self.layout.clone(),
            self.policy.clone(),
        ));
        let year_writer = Arc::new(YearWriter::new(
            sessions.clone(),
            agent_db.clone(),
            self.layout.clone(),
            self.policy.clone(),
        ));
        let indexer = Arc::new(ConsolidationIndexer::new(
            vectors.clone(),
            embeddings.clone(),
            bus.clone(),
        ));
        let pipeline = Arc::new(ConsolidationPipeline::new(
            sessions.clone(),
            graph.clone(),
            vasanas.clone(),
            samskaras.clone(),
            day_writer.clone(),
            indexer.clone(),
        ));
        let pratyabhijna = Arc::new(Pratyabhijna::new(
            agent_db.clone(),
            vasanas.clone(),
            samskaras.clone(),
            Arc::new(IndexSelfReport::new(agent_db.clone())),
        ));
        let checkpoints = Arc::new(CheckpointStore::new(self.layout.clone()));

        Ok(MemoryCore {
            layout: self.layout,
            bus,
            agent_db,
            sessions,
            graph,
            vectors,
            embeddings,
            kala,
            search,
            anveshana,
            vasanas,
            samskaras,
            day_writer,
            month_writer,
            year_writer,
            indexer,
            pipeline,
            pratyabhijna,
            checkpoints,
            memory_files,
            smaran,
        })
    }
}

// ============================================================================
// MEMORY CORE
// ============================================================================

/// The assembled memory subsystem
pub struct MemoryCore {
    layout: HomeLayout,
    bus: EventBus,
    agent_db: Arc<Database>,
    pub sessions: Arc<SessionStore>,
    pub graph: Arc<GraphStore>,
    pub vectors: Arc<VectorStore>,
    pub embeddings: Arc<EmbeddingClient>,
    pub kala: Arc<KalaChakra>,
    pub search: Arc<HybridSearch>,
    pub anveshana: Arc<Anveshana>,
    pub vasanas: Arc<VasanaEngine>,
    pub samskaras: Arc<SamskaraEngine>,
    pub day_writer: Arc<DayWriter>,
    pub month_writer: Arc<MonthWriter>,
    pub year_writer: Arc<YearWriter>,
    pub indexer: Arc<ConsolidationIndexer>,
    pub pipeline: Arc<ConsolidationPipeline>,
    pub pratyabhijna: Arc<Pratyabhijna>,
    pub checkpoints: Arc<CheckpointStore>,
    pub memory_files: Arc<MemoryFileStore>,
    pub smaran: Arc<SmaranStore>,
}

impl MemoryCore {
    /// Open with defaults: no external providers, allow-all policy
    pub fn open(layout: HomeLayout) -> Result<Self> {
        MemoryCoreBuilder::new(layout).build()
    }

    pub fn builder(layout: HomeLayout) -> MemoryCoreBuilder {
        MemoryCoreBuilder::new(layout)
    }

    pub fn layout(&self) -> &HomeLayout {
        &self.layout
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// The relational index; also the temporal engine's reader capability
    pub fn agent_db(&self) -> &Arc<Database> {
        &self.agent_db
    }

    /// Build a Nidra cycle whose dream handler runs the consolidation
    /// pipeline for the current day
    pub fn nidra(&self, config: NidraConfig) -> Arc<NidraCycle> {
        let pipeline = self.pipeline.clone();
        let handler: DreamHandler = Arc::new(move |cancel: CancellationToken| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                pipeline
                    .run_cycle(Utc::now().date_naive(), &cancel)
                    .await
                    .map(|_| ())
            })
        });
        Arc::new(NidraCycle::new(
            self.agent_db.clone(),
            config,
            self.bus.clone(),
            handler,
        ))
    }
}

// ============================================================================
// TESTS
// ============================================================================
