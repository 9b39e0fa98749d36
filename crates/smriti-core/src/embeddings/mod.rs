//! Embedding provider seam
//!
//! Embedding generation is an external collaborator. The core depends only
//! on the [`EmbeddingProvider`] trait; when the provider is unconfigured,
//! errors, or misses its deadline, the [`EmbeddingClient`] falls back to a
//! deterministic hash-trick projection so indexing always makes progress.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{MemoryError, Result};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Dimensionality of the fallback projection (and the default expectation
/// for providers that do not declare one)
pub const FALLBACK_DIMENSIONS: usize = 256;

/// Default deadline for provider calls
pub const DEFAULT_EMBED_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// EMBEDDING TYPE
// ============================================================================

/// A dense embedding vector
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// The embedding vector
    pub vector: Vec<f32>,
    /// Dimensions of the vector
    pub dimensions: usize,
}

impl Embedding {
    /// Create a new embedding from a vector
    pub fn new(vector: Vec<f32>) -> Self {
        let dimensions = vector.len();
        Self { vector, dimensions }
    }

    /// Normalize to unit length in place
    pub fn normalize(&mut self) {
        let norm = self.vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut self.vector {
                *x /= norm;
            }
        }
    }

    /// Serialize as a little-endian f32 blob
    pub fn to_bytes(&self) -> Vec<u8> {
        self.vector.iter().flat_map(|f| f.to_le_bytes()).collect()
    }

    /// Deserialize from a little-endian f32 blob; `None` when the blob
    /// length is not a multiple of four
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Some(Self::new(vector))
    }
}

/// Cosine similarity of two vectors; 0 on dimension mismatch or zero norm
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ============================================================================
// PROVIDER CONTRACT
// ============================================================================

/// External embedding provider
///
/// Implemented outside the core (an HTTP bridge, a local model). A stable
/// dimensionality is part of the contract.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Whether the provider can currently serve requests
    fn is_configured(&self) -> bool;

    /// Embedding dimensionality, stable for the provider's lifetime
    fn dimensions(&self) -> usize;

    /// Embed a batch of texts, one vector per input
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

// ============================================================================
// FALLBACK: HASH-TRICK PROJECTION
// ============================================================================

/// Deterministic hash-trick projection used when no provider is available
///
/// Each whitespace token is hashed (FNV-1a) into a bucket with an
/// alternating sign, then the vector is L2-normalised. Stable across runs
/// and platforms, which is all the fallback promises: identical text maps to
/// identical vectors so dedup and keyed upserts keep working offline.
#[derive(Debug, Clone, Copy)]
pub struct FallbackEmbedder {
    dimensions: usize,
}

impl Default for FallbackEmbedder {
    fn default() -> Self {
        Self {
            dimensions: FALLBACK_DIMENSIONS,
        }
    }
}

impl FallbackEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(8),
        }
    }

    fn fnv1a(token: &str) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
        let mut hash = FNV_OFFSET;
        for byte in token.as_bytes() {
            hash ^= u64::from(*byte);
            hash = hash.wrapping_mul(FNV_PRIME);
        }
        hash
    }

    /// Project one text
    pub fn embed_one(&self, text: &str) -> Embedding {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text.to_lowercase().split_whitespace() {
            let hash = Self::fnv1a(token);
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        let mut embedding = Embedding::new(vector);
        embedding.normalize();
        embedding
    }
}

#[async_trait]
impl EmbeddingProvider for FallbackEmbedder {
    fn is_configured(&self) -> bool {
        true
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t).vector).collect())
    }
}

// ============================================================================
// CLIENT (deadline + fallback)
// ============================================================================

/// Front door for embedding generation
///
/// Wraps an optional external provider with a deadline; on unconfigured
/// provider, error, or timeout the client degrades to the fallback
/// projection rather than failing the caller.
pub struct EmbeddingClient {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    fallback: FallbackEmbedder,
    timeout: Duration,
}

impl Default for EmbeddingClient {
    fn default() -> Self {
        Self::fallback_only()
    }
}

impl EmbeddingClient {
    /// A client backed by an external provider
    pub fn new(provider: Arc<dyn EmbeddingProvider>, timeout: Duration) -> Self {
        let fallback = FallbackEmbedder::new(provider.dimensions());
        Self {
            provider: Some(provider),
            fallback,
            timeout,
        }
    }

    /// A client with no external provider at all
    pub fn fallback_only() -> Self {
        Self {
            provider: None,
            fallback: FallbackEmbedder::default(),
            timeout: DEFAULT_EMBED_TIMEOUT,
        }
    }

    /// Dimensionality of the vectors this client produces
    pub fn dimensions(&self) -> usize {
        self.provider
            .as_ref()
            .map(|p| p.dimensions())
            .unwrap_or(self.fallback.dimensions)
    }

    /// Whether an external provider is wired and configured
    pub fn has_provider(&self) -> bool {
        self.provider.as_ref().is_some_and(|p| p.is_configured())
    }

    /// Embed a batch of texts; never fails
    ///
    /// Individual vectors come from the provider when possible and from the
    /// hash-trick fallback otherwise.
    pub async fn embed(&self, texts: &[String]) -> Vec<Vec<f32>> {
        if texts.is_empty() {
            return Vec::new();
        }
        if let Some(provider) = self.provider.as_ref().filter(|p| p.is_configured()) {
            match tokio::time::timeout(self.timeout, provider.embed(texts)).await {
                Ok(Ok(vectors)) if vectors.len() == texts.len() => return vectors,
                Ok(Ok(vectors)) => {
                    tracing::warn!(
                        expected = texts.len(),
                        got = vectors.len(),
                        "provider returned wrong batch size, using fallback"
                    );
                }
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "embedding provider failed, using fallback");
                }
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = self.timeout.as_millis() as u64,
                        "embedding provider deadline missed, using fallback"
                    );
                }
            }
        }
        texts.iter().map(|t| self.fallback.embed_one(t).vector).collect()
    }

    /// Embed a single text
    pub async fn embed_one(&self, text: &str) -> Vec<f32> {
        self.embed(std::slice::from_ref(&text.to_string()))
            .await
            .pop()
            .unwrap_or_else(|| self.fallback.embed_one(text).vector)
    }
}

impl std::fmt::Debug for EmbeddingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddingClient")
            .field("has_provider", &self.provider.is_some())
            .field("dimensions", &self.dimensions())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenProvider;

    #[async_trait]
    impl EmbeddingProvider for BrokenProvider {
        fn is_configured(&self) -> bool {
            true
        }
        fn dimensions(&self) -> usize {
            64
        }
        async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(MemoryError::Transient {
                message: "provider unreachable".into(),
                attempts: 1,
            })
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl EmbeddingProvider for SlowProvider {
        fn is_configured(&self) -> bool {
            true
        }
        fn dimensions(&self) -> usize {
            64
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(texts.iter().map(|_| vec![0.0; 64]).collect())
        }
    }

    #[test]
    fn test_embedding_bytes_roundtrip() {
        let embedding = Embedding::new(vec![0.25, -1.5, 3.75]);
        let bytes = embedding.to_bytes();
        assert_eq!(bytes.len(), 12);
        let back = Embedding::from_bytes(&bytes).unwrap();
        assert_eq!(back, embedding);

        // Truncated blob is corrupt
        assert!(Embedding::from_bytes(&bytes[..7]).is_none());
    }

    #[test]
    fn test_cosine_similarity_bounds() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
        assert_eq!(cosine_similarity(&a, &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&a, &[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn test_fallback_is_deterministic() {
        let embedder = FallbackEmbedder::default();
        let a = embedder.embed_one("the quick brown fox");
        let b = embedder.embed_one("the quick brown fox");
        assert_eq!(a, b);
        assert_eq!(a.dimensions, FALLBACK_DIMENSIONS);

        // Similar texts land closer than unrelated ones
        let c = embedder.embed_one("the quick brown dog");
        let d = embedder.embed_one("quarterly finance report");
        let sim_close = cosine_similarity(&a.vector, &c.vector);
        let sim_far = cosine_similarity(&a.vector, &d.vector);
        assert!(sim_close > sim_far);
    }

    #[tokio::test]
    async fn test_client_falls_back_on_provider_error() {
        let client = EmbeddingClient::new(Arc::new(BrokenProvider), Duration::from_millis(100));
        let vectors = client.embed(&["hello".to_string()]).await;
        assert_eq!(vectors.len(), 1);
        assert_eq!(vectors[0].len(), 64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_falls_back_on_deadline() {
        let client = EmbeddingClient::new(Arc::new(SlowProvider), Duration::from_millis(50));
        let vectors = client.embed(&["hello".to_string()]).await;
        assert_eq!(vectors.len(), 1);
        // Fallback dimensions follow the provider contract
        assert_eq!(vectors[0].len(), 64);
    }

    #[tokio::test]
    async fn test_fallback_only_client() {
        let client = EmbeddingClient::fallback_only();
        assert!(!client.has_provider());
        let vector = client.embed_one("stable text").await;
        assert_eq!(vector.len(), FALLBACK_DIMENSIONS);
        let again = client.embed_one("stable text").await;
        assert_eq!(vector, again);
    }
}
