//! File collection
//!
//! Walks a directory (respecting .gitignore) and sorts what it finds into
//! loadable files, files with no loader, and files over the size limit.
//! Nothing is dropped silently; the ingestion report names every file.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use ignore::WalkBuilder;

use crate::config::RagConfig;
use crate::error::{RagError, Result};
use crate::extractor::LoaderKind;

// ============================================================================
// Collected File
// ============================================================================

/// A file with a known loader
#[derive(Debug, Clone)]
pub struct CollectedFile {
    pub path: PathBuf,
    pub kind: LoaderKind,
    /// Size in bytes
    pub size: u64,
    pub modified_at: Option<SystemTime>,
}

/// Result of a directory walk
#[derive(Debug, Clone, Default)]
pub struct Collection {
    /// Loadable files, sorted by path
    pub files: Vec<CollectedFile>,
    /// Files whose extension matches no loader
    pub unsupported: Vec<PathBuf>,
    /// `(path, size)` of files over the size limit
    pub oversized: Vec<(PathBuf, u64)>,
}

impl Collection {
    /// Number of files seen, whatever their fate
    pub fn total(&self) -> usize {
        self.files.len() + self.unsupported.len() + self.oversized.len()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

// ============================================================================
// File Collector
// ============================================================================

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    pub respect_gitignore: bool,
    pub include_hidden: bool,
    /// Largest accepted file (bytes, 0 = no limit)
    pub max_file_size: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            respect_gitignore: true,
            include_hidden: false,
            max_file_size: 20 * 1024 * 1024, // 20MB
        }
    }
}

impl CollectorConfig {
    pub fn from_config(config: &RagConfig) -> Self {
        Self {
            max_file_size: config.max_upload_bytes(),
            ..Self::default()
        }
    }
}

pub struct FileCollector {
    config: CollectorConfig,
}

impl FileCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(CollectorConfig::default())
    }

    /// Recursively collect `path`
    pub fn collect_directory(&self, path: &Path) -> Result<Collection> {
        let abs_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| RagError::load(path, e))?
                .join(path)
        };

        if !abs_path.is_dir() {
            return Err(RagError::load(&abs_path, "not a directory"));
        }

        let walker = WalkBuilder::new(&abs_path)
            .hidden(!self.config.include_hidden)
            .git_ignore(self.config.respect_gitignore)
            .git_global(self.config.respect_gitignore)
            .git_exclude(self.config.respect_gitignore)
            .require_git(false)
            .build();

        let mut collection = Collection::default();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Failed to read entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }

            let file_path = entry.path().to_path_buf();

            let kind = match LoaderKind::from_path(&file_path) {
                Ok(kind) => kind,
                Err(_) => {
                    tracing::debug!("No loader for {:?}", file_path);
                    collection.unsupported.push(file_path);
                    continue;
                }
            };

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("Failed to read metadata of {:?}: {}", file_path, e);
                    continue;
                }
            };

            if self.config.max_file_size > 0 && metadata.len() > self.config.max_file_size {
                tracing::debug!("Large file: {:?} ({} bytes)", file_path, metadata.len());
                collection.oversized.push((file_path, metadata.len()));
                continue;
            }

            collection.files.push(CollectedFile {
                path: file_path,
                kind,
                size: metadata.len(),
                modified_at: metadata.modified().ok(),
            });
        }

        collection.files.sort_by(|a, b| a.path.cmp(&b.path));
        collection.unsupported.sort();
        collection.oversized.sort();

        tracing::info!(
            "Collected {} files from {:?} ({} unsupported, {} too large)",
            collection.files.len(),
            abs_path,
            collection.unsupported.len(),
            collection.oversized.len()
        );
        Ok(collection)
    }
}

// ============================================================================
// Tests
// ============================================================================
