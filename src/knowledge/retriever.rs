//! Retriever - embed the query, ask the index, keep the chunks

use std::sync::Arc;
use std::time::Duration;

use crate::embedding::EmbeddingProvider;
use crate::error::{query_hash, RagError, Result};

use super::vector::{Chunk, SearchResult, VectorStore};

pub struct Retriever {
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    /// Deadline for embedding the query
    timeout: Duration,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            embedder,
            store,
            timeout,
        }
    }

    /// Top `k` chunks for `query`, best first
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Chunk>> {
        Ok(self
            .retrieve_scored(query, k)
            .await?
            .into_iter()
            .map(|result| result.entry.chunk)
            .collect())
    }

    /// Like [`Retriever::retrieve`], keeping the similarity scores
    pub async fn retrieve_scored(&self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        let vector = tokio::time::timeout(self.timeout, self.embedder.embed(query))
            .await
            .map_err(|_| {
                RagError::timeout(format!("embedding query {}", query_hash(query)), self.timeout)
            })??;

        let results = self.store.query(&vector, k).await?;
        tracing::debug!(
            "Retrieved {} chunk(s) for query {}",
            results.len(),
            query_hash(query)
        );
        Ok(results)
    }
}

// ============================================================================
// Tests
// ============================================================================
