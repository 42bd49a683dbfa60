//! instant-rag - chat with your documents
//!
//! Documents are split into overlapping chunks, embedded, and stored in a
//! vector index. Questions retrieve the closest chunks and a language model
//! answers from them, keeping the conversation history per session.

pub mod cli;
pub mod collector;
pub mod config;
pub mod conversation;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod knowledge;
pub mod llm;

// Re-exports
pub use config::{get_data_dir, RagConfig};
pub use conversation::{
    ConversationState, PendingAnswer, QueryResult, Session, SessionSettings, SessionState,
    SessionStore,
};
pub use embedding::{create_embedder, EmbeddingProvider, HashEmbedding, OllamaEmbedding};
pub use error::{query_hash, EmbedTarget, RagError, Result};
pub use extractor::{DocumentLoader, LoadedDocument, LoaderKind};
pub use knowledge::{
    Chunk, ChunkConfig, IndexEntry, IngestManifest, IngestReport, Ingestor, Retriever,
    SearchResult, TextChunker, VectorIndex, VectorStore,
};
pub use llm::{ChatMessage, ChatModel, OllamaChat, Role, TextStream};
