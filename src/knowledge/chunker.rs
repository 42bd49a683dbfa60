//! Text Chunking Module
//!
//! Splits document text into bounded, overlapping character windows.
//! Consecutive chunks share exactly `overlap` characters, so dropping that
//! prefix from every chunk after the first gives back the original text.

use crate::error::{RagError, Result};
use crate::extractor::LoadedDocument;

use super::vector::Chunk;

// ============================================================================
// Chunk Configuration
// ============================================================================

/// Chunking settings (character counts, not bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    /// Maximum chunk length
    pub max_size: usize,
    /// Characters repeated at the start of the next chunk
    pub overlap: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_size: 2000,
            overlap: 200,
        }
    }
}

impl ChunkConfig {
    fn validate(&self) -> Result<()> {
        if self.overlap >= self.max_size {
            return Err(RagError::InvalidConfig(format!(
                "overlap ({}) must be smaller than max_size ({})",
                self.overlap, self.max_size
            )));
        }
        Ok(())
    }
}

// ============================================================================
// TextChunker
// ============================================================================

/// Fixed-window chunker
#[derive(Debug, Clone)]
pub struct TextChunker {
    config: ChunkConfig,
}

impl TextChunker {
    /// Fails with `InvalidConfig` when `overlap >= max_size`
    pub fn new(config: ChunkConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> ChunkConfig {
        self.config
    }

    /// Lazily split `text`. Every call starts over from the beginning.
    pub fn split<'a>(&self, text: &'a str) -> Chunks<'a> {
        Chunks {
            text,
            start: 0,
            max_size: self.config.max_size,
            step: self.config.max_size - self.config.overlap,
            done: text.is_empty(),
        }
    }

    /// Chunk every document loaded from one source.
    ///
    /// `sequence_index` keeps counting across documents (pages, rows) so it
    /// is unique per source.
    pub fn chunk_source<'a>(
        &'a self,
        source_id: &'a str,
        documents: &'a [LoadedDocument],
    ) -> impl Iterator<Item = Chunk> + 'a {
        documents
            .iter()
            .flat_map(move |doc| self.split(&doc.text).map(move |text| (text, doc)))
            .enumerate()
            .map(move |(sequence_index, (text, doc))| Chunk {
                text: text.to_string(),
                source_id: source_id.to_string(),
                sequence_index,
                origin_metadata: doc.metadata.clone(),
            })
    }
}

// ============================================================================
// Chunks iterator
// ============================================================================

/// Iterator over the windows of one text, borrowing slices of it
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    text: &'a str,
    /// byte offset of the next window
    start: usize,
    max_size: usize,
    step: usize,
    done: bool,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.done {
            return None;
        }

        let rest = &self.text[self.start..];
        let end = byte_offset_of_char(rest, self.max_size);
        let chunk = &rest[..end];

        if end == rest.len() {
            self.done = true;
        } else {
            // step < max_size, so the next start lies inside this chunk
            self.start += byte_offset_of_char(rest, self.step);
        }

        Some(chunk)
    }
}

impl std::iter::FusedIterator for Chunks<'_> {}

/// Byte offset of the `n`-th char of `s`, or `s.len()` if it has fewer chars
#[inline]
fn byte_offset_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

// ============================================================================
// Tests
// ============================================================================
