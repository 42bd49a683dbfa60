//! Vector Store - chunk / entry types, similarity, and the store trait

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Fixed-length embedding of one chunk
pub type EmbeddingVector = Vec<f32>;

// ============================================================================
// Types
// ============================================================================

/// A bounded segment of document text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Chunk text
    pub text: String,
    /// Source identifier (usually the file path)
    pub source_id: String,
    /// Position of this chunk within its source (0-based)
    pub sequence_index: usize,
    /// Metadata inherited from the loader (`source`, `page`, `row`, ...)
    pub origin_metadata: BTreeMap<String, String>,
}

/// Stored unit of the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub vector: EmbeddingVector,
    pub chunk: Chunk,
}

/// Query hit
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub entry: IndexEntry,
    /// Cosine similarity (-1.0 ~ 1.0)
    pub similarity: f32,
}

// ============================================================================
// VectorStore Trait
// ============================================================================

/// Common interface of nearest-neighbour stores
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Append entries; all-or-nothing
    async fn add(&self, entries: Vec<IndexEntry>) -> Result<usize>;

    /// Up to `k` entries ranked by descending similarity, ties in insertion order
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<SearchResult>>;

    /// Number of stored entries
    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Dimensionality established by the first entry, if any
    async fn dimension(&self) -> Option<usize>;
}

// ============================================================================
// Utility Functions
// ============================================================================

/// Cosine similarity between two vectors.
///
/// Returns 0.0 for mismatched lengths, empty input or zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

// ============================================================================
// Tests
// ============================================================================
