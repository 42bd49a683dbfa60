//! Ingestion pipeline: load → chunk → embed → index
//!
//! A file is indexed all-or-nothing: its chunks are embedded first and added
//! to the store in one call. In a batch, a failing file is logged and
//! reported, and the remaining files still go through.
//!
//! Manifest rows are staged, not written, until `commit_manifest` is called
//! after the index has been persisted. A run that dies before persisting
//! leaves the manifest untouched, so the next run ingests those files again.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::collector::Collection;
use crate::config::RagConfig;
use crate::embedding::EmbeddingProvider;
use crate::error::{EmbedTarget, RagError, Result};
use crate::extractor::{source_id, DocumentLoader, LoaderKind};

use super::chunker::{ChunkConfig, TextChunker};
use super::store::{content_hash, IngestManifest};
use super::vector::{Chunk, IndexEntry, VectorStore};

/// Texts per embedding request
pub const DEFAULT_BATCH_SIZE: usize = 32;

// ============================================================================
// Types
// ============================================================================

/// What happened to one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    /// Chunks were added to the index
    Indexed { chunks: usize },
    /// Same content already recorded in the manifest
    Unchanged,
}

/// Summary of a batch ingestion
#[derive(Debug, Default)]
pub struct IngestReport {
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: Vec<(PathBuf, RagError)>,
    pub chunks_added: usize,
}

impl IngestReport {
    pub fn failure_count(&self) -> usize {
        self.failed.len()
    }

    /// Files considered, whatever their fate
    pub fn total(&self) -> usize {
        self.succeeded + self.skipped + self.failed.len()
    }

    fn record(&mut self, path: &Path, result: Result<FileOutcome>) {
        match result {
            Ok(FileOutcome::Indexed { chunks }) => {
                self.succeeded += 1;
                self.chunks_added += chunks;
            }
            Ok(FileOutcome::Unchanged) => self.skipped += 1,
            Err(e) => self.fail(path, e),
        }
    }

    fn fail(&mut self, path: &Path, error: RagError) {
        tracing::warn!("Failed to ingest {:?}: {}", path, error);
        self.failed.push((path.to_path_buf(), error));
    }
}

/// Manifest row waiting for its index to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
struct StagedRecord {
    source: String,
    sha256: String,
    chunk_count: usize,
}

// ============================================================================
// Ingestor
// ============================================================================

pub struct Ingestor {
    loader: DocumentLoader,
    chunker: TextChunker,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
    manifest: Option<Arc<IngestManifest>>,
    staged: Mutex<Vec<StagedRecord>>,
    force: bool,
    batch_size: usize,
}

impl Ingestor {
    pub fn new(
        loader: DocumentLoader,
        chunker: TextChunker,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            loader,
            chunker,
            embedder,
            store,
            manifest: None,
            staged: Mutex::new(Vec::new()),
            force: false,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Loader and chunker settings taken from `config`
    pub fn from_config(
        config: &RagConfig,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Result<Self> {
        let chunker = TextChunker::new(ChunkConfig {
            max_size: config.chunk_size,
            overlap: config.chunk_overlap,
        })?;
        Ok(Self::new(
            DocumentLoader::from_config(config),
            chunker,
            embedder,
            store,
        ))
    }

    /// Skip files whose content the manifest already has, and stage new ones
    pub fn with_manifest(mut self, manifest: Arc<IngestManifest>) -> Self {
        self.manifest = Some(manifest);
        self
    }

    /// Re-ingest even when the manifest says the content is unchanged
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Ingest one file; errors abort this file only
    pub async fn ingest_file(&self, path: &Path) -> Result<FileOutcome> {
        let kind = LoaderKind::from_path(path)?;
        self.loader.check_file(path).await?;
        let source = source_id(path);

        let digest = match &self.manifest {
            Some(manifest) => {
                let bytes = tokio::fs::read(path)
                    .await
                    .map_err(|e| RagError::load(path, e))?;
                let digest = content_hash(&bytes);
                if !self.force
                    && (self.is_staged(&source, &digest)? || manifest.is_current(&source, &digest)?)
                {
                    tracing::info!("Unchanged, skipping: {}", source);
                    return Ok(FileOutcome::Unchanged);
                }
                Some(digest)
            }
            None => None,
        };

        let documents = self.loader.load_as(path, kind).await?;
        let pieces: Vec<Chunk> = self.chunker.chunk_source(&source, &documents).collect();
        tracing::info!(
            "{}: {} document(s), {} chunk(s)",
            source,
            documents.len(),
            pieces.len()
        );

        let entries = self.embed_chunks(&source, pieces).await?;
        let added = self.store.add(entries).await?;

        if let Some(digest) = digest {
            let mut staged = self.lock_staged()?;
            staged.retain(|r| r.source != source);
            staged.push(StagedRecord {
                source,
                sha256: digest,
                chunk_count: added,
            });
        }

        Ok(FileOutcome::Indexed { chunks: added })
    }

    /// Ingest several files, continuing past failures
    pub async fn ingest_paths(&self, paths: &[PathBuf]) -> IngestReport {
        let mut report = IngestReport::default();
        for (i, path) in paths.iter().enumerate() {
            tracing::info!("[{}/{}] {:?}", i + 1, paths.len(), path);
            let result = self.ingest_file(path).await;
            report.record(path, result);
        }
        report
    }

    /// Ingest a directory walk; unsupported and oversized files are reported as failures
    pub async fn ingest_collection(&self, collection: Collection) -> IngestReport {
        let paths: Vec<PathBuf> = collection.files.into_iter().map(|f| f.path).collect();
        let mut report = self.ingest_paths(&paths).await;

        for path in collection.unsupported {
            let extension = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_string();
            let error = RagError::UnsupportedFormat {
                path: path.clone(),
                extension,
            };
            report.fail(&path, error);
        }

        for (path, size) in collection.oversized {
            let error = RagError::load(
                &path,
                format!(
                    "{} bytes exceeds the {} byte limit",
                    size,
                    self.loader.max_bytes()
                ),
            );
            report.fail(&path, error);
        }

        report
    }

    /// Write the manifest rows of every file indexed since the last commit.
    ///
    /// Call only once the index holding those files has been persisted.
    pub fn commit_manifest(&self) -> Result<usize> {
        let Some(manifest) = &self.manifest else {
            return Ok(0);
        };

        let staged = std::mem::take(&mut *self.lock_staged()?);
        for record in &staged {
            manifest.record(&record.source, &record.sha256, record.chunk_count)?;
        }
        Ok(staged.len())
    }

    fn lock_staged(&self) -> Result<MutexGuard<'_, Vec<StagedRecord>>> {
        self.staged
            .lock()
            .map_err(|e| RagError::persistence(format!("staged manifest lock poisoned: {}", e)))
    }

    fn is_staged(&self, source: &str, sha256: &str) -> Result<bool> {
        Ok(self
            .lock_staged()?
            .iter()
            .any(|r| r.source == source && r.sha256 == sha256))
    }

    /// Embed in batches; vector `i` belongs to chunk `i`
    async fn embed_chunks(&self, source: &str, pieces: Vec<Chunk>) -> Result<Vec<IndexEntry>> {
        let mut entries = Vec::with_capacity(pieces.len());
        let batches = pieces.len().div_ceil(self.batch_size);

        for (b, batch) in pieces.chunks(self.batch_size).enumerate() {
            tracing::info!("Embedding batch {}/{} ({})", b + 1, batches, source);

            let offset = b * self.batch_size;
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self
                .embedder
                .embed_batch(&texts)
                .await
                .map_err(|e| shift_item(e, offset))?;

            if vectors.len() != batch.len() {
                return Err(RagError::Embedding {
                    target: EmbedTarget::Item(offset + vectors.len().min(batch.len())),
                    reason: format!("expected {} vectors, got {}", batch.len(), vectors.len()),
                });
            }

            entries.extend(
                vectors
                    .into_iter()
                    .zip(batch.iter().cloned())
                    .map(|(vector, chunk)| IndexEntry { vector, chunk }),
            );
        }

        Ok(entries)
    }
}

/// Batch-relative item index → chunk index within the file
fn shift_item(err: RagError, offset: usize) -> RagError {
    match err {
        RagError::Embedding {
            target: EmbedTarget::Item(i),
            reason,
        } => RagError::Embedding {
            target: EmbedTarget::Item(offset + i),
            reason,
        },
        other => other,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::FileCollector;
    use crate::embedding::HashEmbedding;
    use crate::knowledge::index::VectorIndex;
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    fn ingestor(store: Arc<VectorIndex>, max_size: usize, overlap: usize) -> Ingestor {
        Ingestor::new(
            DocumentLoader::default(),
            TextChunker::new(ChunkConfig { max_size, overlap }).unwrap(),
            Arc::new(HashEmbedding::default()),
            store,
        )
    }

    #[tokio::test]
    async fn test_ingest_file_chunks_and_indexes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("long.txt");
        std::fs::write(&path, "word ".repeat(1000)).unwrap();

        let store = Arc::new(VectorIndex::new());
        let outcome = ingestor(store.clone(), 2000, 200)
            .with_batch_size(2)
            .ingest_file(&path)
            .await
            .unwrap();

        assert_eq!(outcome, FileOutcome::Indexed { chunks: 3 });
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_batch_continues_past_failures() {
        let dir = TempDir::new().unwrap();
        let good = dir.path().join("good.txt");
        let bad = dir.path().join("bad.xyz");
        let missing = dir.path().join("missing.txt");
        std::fs::write(&good, "some text").unwrap();
        std::fs::write(&bad, "ignored").unwrap();

        let store = Arc::new(VectorIndex::new());
        let report = ingestor(store.clone(), 100, 10)
            .ingest_paths(&[bad.clone(), good, missing.clone()])
            .await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.chunks_added, 1);
        assert_eq!(report.failure_count(), 2);
        assert_eq!(report.failed[0].0, bad);
        assert!(matches!(report.failed[0].1, RagError::UnsupportedFormat { .. }));
        assert!(matches!(report.failed[1].1, RagError::Load { .. }));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_collection_reports_unsupported_and_oversized() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::write(dir.path().join("b.xyz"), "beta").unwrap();
        std::fs::write(dir.path().join("c.txt"), "x".repeat(64)).unwrap();

        let collection = FileCollector::new(crate::collector::CollectorConfig {
            max_file_size: 32,
            ..Default::default()
        })
        .collect_directory(dir.path())
        .unwrap();

        let store = Arc::new(VectorIndex::new());
        let report = ingestor(store.clone(), 100, 10)
            .ingest_collection(collection)
            .await;

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failure_count(), 2);
        assert!(report
            .failed
            .iter()
            .any(|(p, e)| p.ends_with("b.xyz") && matches!(e, RagError::UnsupportedFormat { .. })));
        assert!(report
            .failed
            .iter()
            .any(|(p, e)| p.ends_with("c.txt") && matches!(e, RagError::Load { .. })));
        assert_eq!(report.total(), 3);
    }

    #[tokio::test]
    async fn test_manifest_skips_unchanged_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, "first version").unwrap();

        let manifest = Arc::new(IngestManifest::open_in(&dir.path().join("db")).unwrap());
        let store = Arc::new(VectorIndex::new());
        let pipeline = ingestor(store.clone(), 100, 10).with_manifest(manifest.clone());

        let report = pipeline.ingest_paths(&[path.clone()]).await;
        assert_eq!((report.succeeded, report.skipped), (1, 0));
        assert_eq!(pipeline.commit_manifest().unwrap(), 1);

        let report = pipeline.ingest_paths(&[path.clone()]).await;
        assert_eq!((report.succeeded, report.skipped), (0, 1));
        assert_eq!(store.len().await, 1);

        std::fs::write(&path, "second version").unwrap();
        let report = pipeline.ingest_paths(&[path.clone()]).await;
        assert_eq!((report.succeeded, report.skipped), (1, 0));
        assert_eq!(store.len().await, 2);
        pipeline.commit_manifest().unwrap();

        let forced = pipeline.force(true);
        let report = forced.ingest_paths(&[path.clone()]).await;
        assert_eq!(report.succeeded, 1);
        forced.commit_manifest().unwrap();
        assert_eq!(manifest.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_uncommitted_run_is_ingested_again() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, "the invoice is due friday").unwrap();
        let manifest = Arc::new(IngestManifest::open_in(&dir.path().join("db")).unwrap());

        // first run indexes but never gets to persist
        let first = ingestor(Arc::new(VectorIndex::new()), 100, 10).with_manifest(manifest.clone());
        let outcome = first.ingest_file(&path).await.unwrap();
        assert_eq!(outcome, FileOutcome::Indexed { chunks: 1 });
        drop(first);
        assert!(manifest.list().unwrap().is_empty());

        let store = Arc::new(VectorIndex::new());
        let second = ingestor(store.clone(), 100, 10).with_manifest(manifest.clone());
        let outcome = second.ingest_file(&path).await.unwrap();
        assert_eq!(outcome, FileOutcome::Indexed { chunks: 1 });
        assert_eq!(store.len().await, 1);

        assert_eq!(second.commit_manifest().unwrap(), 1);
        assert!(manifest.is_current(&source_id(&path), &content_hash(b"the invoice is due friday")).unwrap());
    }

    #[tokio::test]
    async fn test_staged_file_is_not_indexed_twice() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, "same content").unwrap();
        let manifest = Arc::new(IngestManifest::open_in(&dir.path().join("db")).unwrap());

        let store = Arc::new(VectorIndex::new());
        let pipeline = ingestor(store.clone(), 100, 10).with_manifest(manifest);
        let report = pipeline.ingest_paths(&[path.clone(), path.clone()]).await;

        assert_eq!((report.succeeded, report.skipped), (1, 1));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_commit_without_manifest_is_noop() {
        let pipeline = ingestor(Arc::new(VectorIndex::new()), 100, 10);
        assert_eq!(pipeline.commit_manifest().unwrap(), 0);
    }

    /// Fails on any text containing "poison"
    struct Picky;

    #[async_trait]
    impl EmbeddingProvider for Picky {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains("poison") {
                return Err(RagError::Embedding {
                    target: EmbedTarget::Item(0),
                    reason: "rejected".to_string(),
                });
            }
            Ok(vec![1.0, 0.0])
        }

        fn dimension(&self) -> Option<usize> {
            Some(2)
        }

        fn name(&self) -> &str {
            "picky"
        }
    }

    #[tokio::test]
    async fn test_embedding_failure_names_chunk_and_leaves_index_unchanged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("doc.txt");
        // chunks: "aaaabbbb", "ccccdddd", "poison"
        std::fs::write(&path, "aaaabbbbccccddddpoison").unwrap();

        let store = Arc::new(VectorIndex::new());
        let ingestor = Ingestor::new(
            DocumentLoader::new(1024, Duration::from_secs(5)),
            TextChunker::new(ChunkConfig {
                max_size: 8,
                overlap: 0,
            })
            .unwrap(),
            Arc::new(Picky),
            store.clone(),
        )
        .with_batch_size(1);

        let err = ingestor.ingest_file(&path).await.unwrap_err();
        match err {
            RagError::Embedding { target, .. } => assert_eq!(target, EmbedTarget::Item(2)),
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(store.is_empty().await);
    }
}
