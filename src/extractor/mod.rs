//! Document loading
//!
//! Turns a source file into `(text, metadata)` documents.
//! - Plain text / Markdown: read directly (Markdown markup stripped)
//! - PDF: one document per page (pdf-extract)
//! - CSV: one document per row
//! - Word / PowerPoint: text runs pulled out of the OOXML archive

pub mod office;
pub mod pdf;
pub mod tabular;
pub mod text;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::RagConfig;
use crate::error::{RagError, Result};

// ============================================================================
// Loader Kind
// ============================================================================

/// Supported document formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoaderKind {
    PlainText,
    Markdown,
    Pdf,
    Csv,
    /// .docx
    Word,
    /// .pptx
    PowerPoint,
}

impl LoaderKind {
    /// Format for a file extension (case-insensitive)
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "txt" | "text" => Some(LoaderKind::PlainText),
            "md" | "markdown" => Some(LoaderKind::Markdown),
            "pdf" => Some(LoaderKind::Pdf),
            "csv" => Some(LoaderKind::Csv),
            "docx" => Some(LoaderKind::Word),
            "pptx" => Some(LoaderKind::PowerPoint),
            _ => None,
        }
    }

    /// Format for a declared MIME type (parameters such as `; charset=` ignored)
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match essence.as_str() {
            "text/plain" => Some(LoaderKind::PlainText),
            "text/markdown" | "text/x-markdown" => Some(LoaderKind::Markdown),
            "application/pdf" => Some(LoaderKind::Pdf),
            "text/csv" => Some(LoaderKind::Csv),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(LoaderKind::Word)
            }
            "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
                Some(LoaderKind::PowerPoint)
            }
            _ => None,
        }
    }

    /// Format for a path, or `UnsupportedFormat`
    pub fn from_path(path: &Path) -> Result<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        Self::from_extension(ext).ok_or_else(|| RagError::UnsupportedFormat {
            path: path.to_path_buf(),
            extension: ext.to_string(),
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            LoaderKind::PlainText => "TXT",
            LoaderKind::Markdown => "MD",
            LoaderKind::Pdf => "PDF",
            LoaderKind::Csv => "CSV",
            LoaderKind::Word => "DOCX",
            LoaderKind::PowerPoint => "PPTX",
        }
    }

    /// Blocking load; run on the blocking pool
    fn load_blocking(self, path: &Path) -> Result<Vec<LoadedDocument>> {
        match self {
            LoaderKind::PlainText => text::load_plain(path),
            LoaderKind::Markdown => text::load_markdown(path),
            LoaderKind::Pdf => pdf::load(path),
            LoaderKind::Csv => tabular::load(path),
            LoaderKind::Word => office::load_docx(path),
            LoaderKind::PowerPoint => office::load_pptx(path),
        }
    }
}

// ============================================================================
// Loaded Document
// ============================================================================

/// Text of one page / row / slide plus where it came from
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDocument {
    pub text: String,
    /// Always contains `source`; `page` or `row` where applicable
    pub metadata: BTreeMap<String, String>,
}

impl LoadedDocument {
    pub(crate) fn new(path: &Path, text: String) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("source".to_string(), source_id(path));
        Self { text, metadata }
    }

    pub(crate) fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Identifier recorded as `source` for a file
pub fn source_id(path: &Path) -> String {
    path.display().to_string()
}

// ============================================================================
// Document Loader
// ============================================================================

/// Size- and time-bounded loader
#[derive(Debug, Clone)]
pub struct DocumentLoader {
    /// Largest accepted file in bytes
    max_bytes: u64,
    timeout: Duration,
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self::new(20 * 1024 * 1024, Duration::from_secs(180))
    }
}

impl DocumentLoader {
    pub fn new(max_bytes: u64, timeout: Duration) -> Self {
        Self { max_bytes, timeout }
    }

    pub fn from_config(config: &RagConfig) -> Self {
        Self::new(config.max_upload_bytes(), config.upload_timeout())
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Load `path`, choosing the format by extension
    pub async fn load(&self, path: &Path) -> Result<Vec<LoadedDocument>> {
        let kind = LoaderKind::from_path(path)?;
        self.load_as(path, kind).await
    }

    /// Size of `path` in bytes, or `LoadError` if it is missing or over the limit
    pub async fn check_file(&self, path: &Path) -> Result<u64> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| RagError::load(path, e))?;

        if !meta.is_file() {
            return Err(RagError::load(path, "not a regular file"));
        }
        if meta.len() > self.max_bytes {
            return Err(RagError::load(
                path,
                format!("{} bytes exceeds the {} byte limit", meta.len(), self.max_bytes),
            ));
        }
        Ok(meta.len())
    }

    /// Load `path` with an explicit format (e.g. from a declared MIME type)
    pub async fn load_as(&self, path: &Path, kind: LoaderKind) -> Result<Vec<LoadedDocument>> {
        self.check_file(path).await?;

        // parsing is CPU bound
        let owned: PathBuf = path.to_path_buf();
        let task = tokio::task::spawn_blocking(move || kind.load_blocking(&owned));

        let documents = match tokio::time::timeout(self.timeout, task).await {
            Err(_) => {
                return Err(RagError::timeout(
                    format!("loading {}", path.display()),
                    self.timeout,
                ))
            }
            Ok(Err(join_err)) => return Err(RagError::load(path, join_err)),
            Ok(Ok(result)) => result?,
        };

        tracing::debug!(
            "Loaded {:?} as {}: {} document(s)",
            path,
            kind.label(),
            documents.len()
        );
        Ok(documents)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(LoaderKind::from_extension("txt"), Some(LoaderKind::PlainText));
        assert_eq!(LoaderKind::from_extension("PDF"), Some(LoaderKind::Pdf));
        assert_eq!(LoaderKind::from_extension("md"), Some(LoaderKind::Markdown));
        assert_eq!(LoaderKind::from_extension("csv"), Some(LoaderKind::Csv));
        assert_eq!(LoaderKind::from_extension("docx"), Some(LoaderKind::Word));
        assert_eq!(LoaderKind::from_extension("pptx"), Some(LoaderKind::PowerPoint));
        assert_eq!(LoaderKind::from_extension("doc"), None);
        assert_eq!(LoaderKind::from_extension("xyz"), None);
    }

    #[test]
    fn test_kind_from_mime() {
        assert_eq!(
            LoaderKind::from_mime("text/plain; charset=utf-8"),
            Some(LoaderKind::PlainText)
        );
        assert_eq!(LoaderKind::from_mime("application/pdf"), Some(LoaderKind::Pdf));
        assert_eq!(LoaderKind::from_mime("image/png"), None);
    }

    #[test]
    fn test_kind_from_path_unsupported() {
        let err = LoaderKind::from_path(Path::new("/data/archive.xyz")).unwrap_err();
        match err {
            RagError::UnsupportedFormat { path, extension } => {
                assert_eq!(path, PathBuf::from("/data/archive.xyz"));
                assert_eq!(extension, "xyz");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert!(matches!(
            LoaderKind::from_path(Path::new("Makefile")),
            Err(RagError::UnsupportedFormat { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_plain_text() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "hello world").unwrap();

        let docs = DocumentLoader::default().load(&path).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text, "hello world");
        assert_eq!(docs[0].metadata["source"], source_id(&path));
    }

    #[tokio::test]
    async fn test_load_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.xyz");
        std::fs::write(&path, "whatever").unwrap();

        let err = DocumentLoader::default().load(&path).await.unwrap_err();
        assert!(matches!(err, RagError::UnsupportedFormat { .. }));
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.txt");

        let err = DocumentLoader::default().load(&path).await.unwrap_err();
        assert!(matches!(err, RagError::Load { path: ref p, .. } if p == &path));
    }

    #[tokio::test]
    async fn test_load_too_large() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.txt");
        std::fs::write(&path, "x".repeat(2048)).unwrap();

        let loader = DocumentLoader::new(1024, Duration::from_secs(5));
        let err = loader.load(&path).await.unwrap_err();
        assert!(matches!(err, RagError::Load { .. }));
        assert!(err.to_string().contains("limit"));
    }

    #[tokio::test]
    async fn test_load_as_declared_kind() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("upload.bin");
        std::fs::write(&path, "# Title\n\nBody").unwrap();

        let kind = LoaderKind::from_mime("text/markdown").unwrap();
        let docs = DocumentLoader::default().load_as(&path, kind).await.unwrap();
        assert_eq!(docs[0].text, "Title\n\nBody");
    }
}
