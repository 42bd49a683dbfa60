//! Knowledge module - the RAG index side
//!
//! - Chunker: fixed-size overlapping character windows
//! - Vector index: in-memory cosine search, persisted with LanceDB
//! - Retriever: query text → top-k chunks
//! - Ingest: load → chunk → embed → index, with an SQLite manifest

mod chunker;
mod index;
mod ingest;
mod lance;
mod retriever;
mod store;
mod vector;

// Re-exports
pub use chunker::{ChunkConfig, Chunks, TextChunker};
pub use index::VectorIndex;
pub use ingest::{FileOutcome, IngestReport, Ingestor, DEFAULT_BATCH_SIZE};
pub use lance::index_exists;
pub use retriever::Retriever;
pub use store::{content_hash, IngestManifest, ManifestEntry, MANIFEST_FILE};
pub use vector::{
    cosine_similarity, Chunk, EmbeddingVector, IndexEntry, SearchResult, VectorStore,
};
