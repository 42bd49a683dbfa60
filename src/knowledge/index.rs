//! In-memory vector index
//!
//! Brute-force cosine search over every entry. Writers are serialized by the
//! lock; queries share it and run concurrently once ingestion is done.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{RagError, Result};

use super::lance;
use super::vector::{cosine_similarity, IndexEntry, SearchResult, VectorStore};

#[derive(Debug, Default)]
struct IndexInner {
    dimension: Option<usize>,
    entries: Vec<IndexEntry>,
}

/// Append-only vector index
#[derive(Debug, Default)]
pub struct VectorIndex {
    inner: RwLock<IndexInner>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index whose dimensionality is fixed up front
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            inner: RwLock::new(IndexInner {
                dimension: Some(dimension),
                entries: Vec::new(),
            }),
        }
    }

    pub(crate) fn from_parts(dimension: Option<usize>, entries: Vec<IndexEntry>) -> Self {
        Self {
            inner: RwLock::new(IndexInner { dimension, entries }),
        }
    }

    /// Copy of every entry in insertion order
    pub async fn snapshot(&self) -> (Option<usize>, Vec<IndexEntry>) {
        let inner = self.inner.read().await;
        (inner.dimension, inner.entries.clone())
    }

    /// Write the full entry set under `dir`
    pub async fn persist(&self, dir: &Path) -> Result<()> {
        // hold the read lock so no add lands halfway through the write
        let inner = self.inner.read().await;
        lance::save_index(dir, inner.dimension, &inner.entries).await
    }

    /// Read an index previously written by [`VectorIndex::persist`]
    pub async fn load(dir: &Path) -> Result<Self> {
        let (dimension, entries) = lance::load_index(dir).await?;
        Ok(Self::from_parts(dimension, entries))
    }

    /// Load from `dir`, or start empty if nothing has been persisted there yet
    pub async fn load_or_new(dir: &Path) -> Result<Self> {
        match Self::load(dir).await {
            Ok(index) => Ok(index),
            Err(RagError::IndexNotFound(_)) => {
                tracing::info!("No index at {:?}, starting a new one", dir);
                Ok(Self::new())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl VectorStore for VectorIndex {
    async fn add(&self, entries: Vec<IndexEntry>) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut inner = self.inner.write().await;

        // validate the whole batch before touching the index
        let expected = inner.dimension.unwrap_or(entries[0].vector.len());
        if let Some(bad) = entries.iter().find(|e| e.vector.len() != expected) {
            return Err(RagError::DimensionMismatch {
                expected,
                actual: bad.vector.len(),
            });
        }
        if expected == 0 {
            return Err(RagError::DimensionMismatch {
                expected: 0,
                actual: 0,
            });
        }

        let added = entries.len();
        inner.dimension = Some(expected);
        inner.entries.extend(entries);

        tracing::debug!("Indexed {} entries (total {})", added, inner.entries.len());
        Ok(added)
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        let inner = self.inner.read().await;

        if let Some(dimension) = inner.dimension {
            if vector.len() != dimension {
                return Err(RagError::DimensionMismatch {
                    expected: dimension,
                    actual: vector.len(),
                });
            }
        }

        if k == 0 || inner.entries.is_empty() {
            return Ok(vec![]);
        }

        let mut scored: Vec<(usize, f32)> = inner
            .entries
            .iter()
            .enumerate()
            .map(|(seq, entry)| {
                let score = cosine_similarity(vector, &entry.vector);
                (seq, if score.is_nan() { f32::NEG_INFINITY } else { score })
            })
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(seq, similarity)| SearchResult {
                entry: inner.entries[seq].clone(),
                similarity,
            })
            .collect())
    }

    async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    async fn dimension(&self) -> Option<usize> {
        self.inner.read().await.dimension
    }
}

// ============================================================================
// Tests
// ============================================================================
