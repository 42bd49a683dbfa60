//! Ingest Manifest - rusqlite record of ingested sources
//!
//! One row per source file: content hash, chunk count, time of ingestion.
//! Lets a repeated `ingest` skip files whose content has not changed.
//! Location: `<db_path>/manifest.db`

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{RagError, Result};

/// File name inside `db_path`
pub const MANIFEST_FILE: &str = "manifest.db";

// ============================================================================
// Types
// ============================================================================

/// A recorded source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestEntry {
    pub source: String,
    /// Hex SHA-256 of the file contents
    pub sha256: String,
    pub chunk_count: usize,
    pub ingested_at: DateTime<Utc>,
}

// ============================================================================
// IngestManifest
// ============================================================================

pub struct IngestManifest {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl IngestManifest {
    /// Open (or create) the manifest database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RagError::persistence(format!("create {:?}: {}", parent, e)))?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| RagError::persistence(format!("open {:?}: {}", path, e)))?;

        let manifest = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: path.to_path_buf(),
        };

        manifest.initialize()?;
        Ok(manifest)
    }

    /// Open `manifest.db` inside the index directory
    pub fn open_in(db_dir: &Path) -> Result<Self> {
        Self::open(&db_dir.join(MANIFEST_FILE))
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RagError::persistence(format!("manifest lock poisoned: {}", e)))
    }

    fn initialize(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS sources (
                source TEXT PRIMARY KEY,
                sha256 TEXT NOT NULL,
                chunk_count INTEGER NOT NULL,
                ingested_at TEXT NOT NULL
            )",
            [],
        )
        .map_err(RagError::persistence)?;
        Ok(())
    }

    /// Record (or re-record) a source after a successful ingestion
    pub fn record(&self, source: &str, sha256: &str, chunk_count: usize) -> Result<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();

        conn.execute(
            "INSERT OR REPLACE INTO sources (source, sha256, chunk_count, ingested_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![source, sha256, chunk_count as i64, now],
        )
        .map_err(RagError::persistence)?;

        tracing::debug!("Recorded {} ({} chunks)", source, chunk_count);
        Ok(())
    }

    /// Entry for `source`, if recorded
    pub fn get(&self, source: &str) -> Result<Option<ManifestEntry>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT source, sha256, chunk_count, ingested_at FROM sources WHERE source = ?1",
            params![source],
            row_to_entry,
        )
        .optional()
        .map_err(RagError::persistence)
    }

    /// Whether `source` was ingested with exactly this content
    pub fn is_current(&self, source: &str, sha256: &str) -> Result<bool> {
        Ok(self
            .get(source)?
            .map(|entry| entry.sha256 == sha256)
            .unwrap_or(false))
    }

    /// All entries, most recent first
    pub fn list(&self) -> Result<Vec<ManifestEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT source, sha256, chunk_count, ingested_at FROM sources
                 ORDER BY ingested_at DESC, source ASC",
            )
            .map_err(RagError::persistence)?;

        let entries = stmt
            .query_map([], row_to_entry)
            .map_err(RagError::persistence)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(RagError::persistence)?;

        Ok(entries)
    }

    /// Forget every entry; returns how many there were
    pub fn clear(&self) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM sources", [])
            .map_err(RagError::persistence)
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManifestEntry> {
    Ok(ManifestEntry {
        source: row.get(0)?,
        sha256: row.get(1)?,
        chunk_count: row.get::<_, i64>(2)? as usize,
        ingested_at: parse_datetime(row.get::<_, String>(3)?),
    })
}

/// RFC3339 string to `DateTime<Utc>`
fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Hex SHA-256 of a byte slice
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_manifest() -> (TempDir, IngestManifest) {
        let dir = TempDir::new().unwrap();
        let manifest = IngestManifest::open_in(&dir.path().join("db")).unwrap();
        (dir, manifest)
    }

    #[test]
    fn test_record_and_get() {
        let (_dir, manifest) = create_test_manifest();
        manifest.record("a.txt", "abc123", 3).unwrap();

        let entry = manifest.get("a.txt").unwrap().unwrap();
        assert_eq!(entry.source, "a.txt");
        assert_eq!(entry.sha256, "abc123");
        assert_eq!(entry.chunk_count, 3);
        assert!(manifest.get("b.txt").unwrap().is_none());
    }

    #[test]
    fn test_is_current() {
        let (_dir, manifest) = create_test_manifest();
        manifest.record("a.txt", "v1", 1).unwrap();

        assert!(manifest.is_current("a.txt", "v1").unwrap());
        assert!(!manifest.is_current("a.txt", "v2").unwrap());
        assert!(!manifest.is_current("missing.txt", "v1").unwrap());

        manifest.record("a.txt", "v2", 4).unwrap();
        assert!(manifest.is_current("a.txt", "v2").unwrap());
        assert_eq!(manifest.list().unwrap().len(), 1);
    }

    #[test]
    fn test_list_and_clear() {
        let (_dir, manifest) = create_test_manifest();
        manifest.record("a.txt", "1", 1).unwrap();
        manifest.record("b.pdf", "2", 5).unwrap();

        assert_eq!(manifest.list().unwrap().len(), 2);
        assert_eq!(manifest.clear().unwrap(), 2);
        assert!(manifest.list().unwrap().is_empty());
    }

    #[test]
    fn test_reopen_keeps_entries() {
        let dir = TempDir::new().unwrap();
        {
            let manifest = IngestManifest::open_in(dir.path()).unwrap();
            manifest.record("a.txt", "1", 2).unwrap();
        }
        let manifest = IngestManifest::open_in(dir.path()).unwrap();
        assert_eq!(manifest.get("a.txt").unwrap().unwrap().chunk_count, 2);
    }

    #[test]
    fn test_content_hash() {
        assert_eq!(
            content_hash(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
