//! Conversation engine
//!
//! A `Session` moves `Idle → Ingested → Answering(1) → Answering(2) → …`.
//! Each question is condensed against the history (when there is any),
//! answered from the top-k retrieved chunks, and appended to the history
//! only once the whole answer has arrived. A failed, timed-out or abandoned
//! answer leaves the conversation exactly as it was.
//!
//! Sessions are independent objects; `SessionStore` keys them by id.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{Instant, Sleep};
use uuid::Uuid;

use crate::config::RagConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{query_hash, RagError, Result};
use crate::extractor::DocumentLoader;
use crate::knowledge::{Chunk, FileOutcome, Ingestor, Retriever, TextChunker, VectorIndex, VectorStore};
use crate::llm::{ChatMessage, ChatModel, Role, TextStream};

/// Instructions sent ahead of the retrieved context
pub const SYSTEM_PROMPT: &str = "You are an assistant that summarizes documents and answers \
questions about them. Answer truthfully using only the context below, which comes from the \
uploaded document. If the context does not contain the answer, say that you don't know.";

/// Instructions for rewriting a follow-up into a standalone question
pub const CONDENSE_PROMPT: &str = "Given the conversation so far and a follow-up question, \
rephrase the follow-up question to be a standalone question in its original language. \
Reply with the standalone question only.";

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Chunks retrieved per question
    pub top_k: usize,
    /// Deadline for embedding the query and for the condense call
    pub request_timeout: Duration,
    /// Longest wait for the answer to start, and between two answer fragments
    pub generation_timeout: Duration,
    /// Rewrite follow-ups into standalone questions before retrieval
    pub condense_question: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            top_k: 4,
            request_timeout: Duration::from_secs(120),
            generation_timeout: Duration::from_secs(120),
            condense_question: true,
        }
    }
}

impl SessionSettings {
    pub fn from_config(config: &RagConfig) -> Self {
        Self {
            top_k: config.top_k,
            request_timeout: config.request_timeout(),
            generation_timeout: config.request_timeout(),
            condense_question: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No document yet
    Idle,
    /// Index attached, no question answered yet
    Ingested,
    /// `turn` questions answered so far
    Answering { turn: usize },
}

/// History plus the index the session answers from
#[derive(Clone, Default)]
pub struct ConversationState {
    history: Vec<ChatMessage>,
    index: Option<Arc<dyn VectorStore>>,
}

impl fmt::Debug for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversationState")
            .field("history", &self.history)
            .field("index", &self.index.as_ref().map(|_| "VectorStore"))
            .finish()
    }
}

impl ConversationState {
    /// `(role, message)` pairs, oldest first
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Completed question/answer exchanges
    pub fn turn_count(&self) -> usize {
        self.history.iter().filter(|m| m.role == Role::Assistant).count()
    }

    pub fn index(&self) -> Option<&Arc<dyn VectorStore>> {
        self.index.as_ref()
    }
}

/// An answer and the chunks it was grounded on
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    pub answer: String,
    /// Retrieved chunks in rank order
    pub supporting_chunks: Vec<Chunk>,
}

impl QueryResult {
    /// `(source_i, excerpt text)` for each supporting chunk
    pub fn excerpts(&self) -> impl Iterator<Item = (String, &str)> + '_ {
        self.supporting_chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| (format!("source_{}", i), chunk.text.as_str()))
    }

    /// Answer followed by the names of its sources
    pub fn render(&self) -> String {
        if self.supporting_chunks.is_empty() {
            return format!("{}\nNo sources found", self.answer);
        }
        let names: Vec<String> = self.excerpts().map(|(name, _)| name).collect();
        format!("{}\nSources: {}", self.answer, names.join(", "))
    }
}

impl fmt::Display for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

// ============================================================================
// Session
// ============================================================================

pub struct Session {
    id: Uuid,
    state: SessionState,
    conversation: ConversationState,
    embedder: Arc<dyn EmbeddingProvider>,
    model: Arc<dyn ChatModel>,
    settings: SessionSettings,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("turns", &self.conversation.turn_count())
            .field("embedder", &self.embedder.name())
            .field("model", &self.model.name())
            .finish()
    }
}

impl Session {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn ChatModel>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            conversation: ConversationState::default(),
            embedder,
            model,
            settings,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn conversation(&self) -> &ConversationState {
        &self.conversation
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Answer from an already built index (e.g. one loaded from disk)
    pub fn attach_index(&mut self, index: Arc<dyn VectorStore>) {
        self.conversation.index = Some(index);
        if self.state == SessionState::Idle {
            self.state = SessionState::Ingested;
        }
    }

    /// Load, chunk, embed and index one document into this session's index.
    ///
    /// Returns the number of chunks added. On error the session is untouched.
    pub async fn ingest(
        &mut self,
        path: &Path,
        loader: DocumentLoader,
        chunker: TextChunker,
    ) -> Result<usize> {
        let index: Arc<dyn VectorStore> = match &self.conversation.index {
            Some(index) => Arc::clone(index),
            None => Arc::new(VectorIndex::new()),
        };

        let ingestor = Ingestor::new(loader, chunker, Arc::clone(&self.embedder), Arc::clone(&index));
        let chunks = match ingestor.ingest_file(path).await? {
            FileOutcome::Indexed { chunks } => chunks,
            FileOutcome::Unchanged => 0,
        };

        tracing::info!("Session {}: ingested {:?} ({} chunks)", self.id, path, chunks);
        self.attach_index(index);
        Ok(chunks)
    }

    /// Answer `question`, waiting for the whole answer
    pub async fn ask(&mut self, question: &str) -> Result<QueryResult> {
        self.ask_streaming(question).await?.complete().await
    }

    /// Retrieve and start generating; the answer arrives through the returned stream
    pub async fn ask_streaming(&mut self, question: &str) -> Result<PendingAnswer<'_>> {
        let index = match (&self.state, &self.conversation.index) {
            (SessionState::Idle, _) | (_, None) => return Err(RagError::SessionNotReady),
            (_, Some(index)) => Arc::clone(index),
        };
        let hash = query_hash(question);

        let standalone = if self.settings.condense_question && !self.conversation.history.is_empty() {
            self.condense(question).await?
        } else {
            question.to_string()
        };

        let retriever = Retriever::new(
            Arc::clone(&self.embedder),
            index,
            self.settings.request_timeout,
        );
        let chunks = retriever.retrieve(&standalone, self.settings.top_k).await?;

        let messages = build_prompt(&self.conversation.history, &chunks, question);
        let timeout = self.settings.generation_timeout;
        let fragments = tokio::time::timeout(timeout, self.model.stream(&messages))
            .await
            .map_err(|_| RagError::timeout(format!("generation for query {}", hash), timeout))??;

        Ok(PendingAnswer {
            question: question.to_string(),
            chunks,
            fragments,
            answer: String::new(),
            idle: Box::pin(tokio::time::sleep(timeout)),
            idle_timeout: timeout,
            query_hash: hash,
            status: AnswerStatus::Streaming,
            session: self,
        })
    }

    /// Rewrite a follow-up question using the history
    async fn condense(&self, question: &str) -> Result<String> {
        let transcript = self
            .conversation
            .history
            .iter()
            .map(|m| match m.role {
                Role::User => format!("Human: {}", m.content),
                Role::Assistant => format!("Assistant: {}", m.content),
                Role::System => format!("System: {}", m.content),
            })
            .collect::<Vec<_>>()
            .join("\n");

        let messages = [
            ChatMessage::system(CONDENSE_PROMPT),
            ChatMessage::user(format!(
                "Chat history:\n{}\n\nFollow-up question: {}",
                transcript, question
            )),
        ];

        let timeout = self.settings.request_timeout;
        let rewritten = tokio::time::timeout(timeout, self.model.complete(&messages))
            .await
            .map_err(|_| {
                RagError::timeout(format!("condensing query {}", query_hash(question)), timeout)
            })??;

        let rewritten = rewritten.trim();
        if rewritten.is_empty() {
            return Ok(question.to_string());
        }
        tracing::debug!("Condensed query {} into a standalone question", query_hash(question));
        Ok(rewritten.to_string())
    }

    fn commit(&mut self, question: String, answer: String) {
        self.conversation.history.push(ChatMessage::user(question));
        self.conversation.history.push(ChatMessage::assistant(answer));
        self.state = SessionState::Answering {
            turn: self.conversation.turn_count(),
        };
    }
}

/// System prompt with context, then the history, then the question
fn build_prompt(history: &[ChatMessage], chunks: &[Chunk], question: &str) -> Vec<ChatMessage> {
    let context = if chunks.is_empty() {
        "(no matching excerpts)".to_string()
    } else {
        chunks
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    };

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(format!(
        "{}\n\nContext:\n{}",
        SYSTEM_PROMPT, context
    )));
    messages.extend(history.iter().cloned());
    messages.push(ChatMessage::user(question));
    messages
}

// ============================================================================
// PendingAnswer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AnswerStatus {
    Streaming,
    Completed,
    Failed,
}

/// An answer being generated.
///
/// Yields text fragments as they arrive. When the model finishes, the
/// exchange is appended to the session; on an error, an idle timeout, or if
/// this is dropped first, nothing is appended. Not restartable.
pub struct PendingAnswer<'s> {
    session: &'s mut Session,
    question: String,
    chunks: Vec<Chunk>,
    fragments: TextStream,
    answer: String,
    idle: Pin<Box<Sleep>>,
    idle_timeout: Duration,
    query_hash: String,
    status: AnswerStatus,
}

impl fmt::Debug for PendingAnswer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingAnswer")
            .field("query_hash", &self.query_hash)
            .field("status", &self.status)
            .field("received", &self.answer.len())
            .finish()
    }
}

impl PendingAnswer<'_> {
    /// Chunks the answer is grounded on, in rank order
    pub fn supporting_chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Text received so far
    pub fn partial_answer(&self) -> &str {
        &self.answer
    }

    pub fn is_complete(&self) -> bool {
        self.status == AnswerStatus::Completed
    }

    /// Drain the remaining fragments into a `QueryResult`
    pub async fn complete(mut self) -> Result<QueryResult> {
        while let Some(fragment) = self.next().await {
            fragment?;
        }

        if self.status != AnswerStatus::Completed {
            return Err(RagError::Generation {
                query_hash: self.query_hash,
                reason: "answer stream ended without completing".to_string(),
            });
        }

        Ok(QueryResult {
            answer: self.answer,
            supporting_chunks: self.chunks,
        })
    }
}

impl Stream for PendingAnswer<'_> {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.status != AnswerStatus::Streaming {
            return Poll::Ready(None);
        }

        match this.fragments.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(fragment))) => {
                this.answer.push_str(&fragment);
                let deadline = Instant::now() + this.idle_timeout;
                this.idle.as_mut().reset(deadline);
                Poll::Ready(Some(Ok(fragment)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.status = AnswerStatus::Failed;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.status = AnswerStatus::Completed;
                let question = std::mem::take(&mut this.question);
                this.session.commit(question, this.answer.clone());
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.idle.as_mut().poll(cx).is_ready() {
                    this.status = AnswerStatus::Failed;
                    return Poll::Ready(Some(Err(RagError::timeout(
                        format!("generation for query {}", this.query_hash),
                        this.idle_timeout,
                    ))));
                }
                Poll::Pending
            }
        }
    }
}

// ============================================================================
// SessionStore
// ============================================================================

/// Live sessions keyed by id
#[derive(Default)]
pub struct SessionStore {
    sessions: RwLock<HashMap<Uuid, Arc<Mutex<Session>>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session; returns its id
    pub async fn insert(&self, session: Session) -> Uuid {
        let id = session.id();
        self.sessions
            .write()
            .await
            .insert(id, Arc::new(Mutex::new(session)));
        tracing::debug!("Session {} opened", id);
        id
    }

    pub async fn get(&self, id: &Uuid) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// End a session
    pub async fn remove(&self, id: &Uuid) -> Option<Arc<Mutex<Session>>> {
        let removed = self.sessions.write().await.remove(id);
        if removed.is_some() {
            tracing::debug!("Session {} closed", id);
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// ============================================================================
// Tests
// ============================================================================
