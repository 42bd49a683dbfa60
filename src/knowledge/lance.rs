//! LanceDB persistence for the vector index
//!
//! Layout under `db_path`:
//! - `index.json`  - header (format version, dimension, entry count)
//! - `index.lance` - LanceDB table `chunks`, one row per entry, `seq` = insertion order
//!
//! ref: https://lancedb.github.io/lancedb/

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatch, RecordBatchIterator,
    StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};

use super::vector::{Chunk, IndexEntry};

/// Table name inside the LanceDB directory
const TABLE_NAME: &str = "chunks";
const HEADER_FILE: &str = "index.json";
const LANCE_DIR: &str = "index.lance";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct IndexHeader {
    format_version: u32,
    dimension: Option<usize>,
    entries: usize,
}

/// Whether `dir` holds a persisted index
pub fn index_exists(dir: &Path) -> bool {
    dir.join(HEADER_FILE).is_file()
}

// ============================================================================
// Save
// ============================================================================

/// Replace whatever index is stored in `dir` with `entries`
pub async fn save_index(dir: &Path, dimension: Option<usize>, entries: &[IndexEntry]) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| RagError::persistence(format!("create {:?}: {}", dir, e)))?;

    // header goes last; without it the directory reads as "no index"
    let header_path = dir.join(HEADER_FILE);
    if header_path.exists() {
        tokio::fs::remove_file(&header_path)
            .await
            .map_err(|e| RagError::persistence(format!("remove {:?}: {}", header_path, e)))?;
    }

    let lance_path = dir.join(LANCE_DIR);
    if lance_path.exists() {
        tokio::fs::remove_dir_all(&lance_path)
            .await
            .map_err(|e| RagError::persistence(format!("remove {:?}: {}", lance_path, e)))?;
    }

    let dimension = match (dimension, entries.is_empty()) {
        (Some(dim), false) => {
            let db = connect(&lance_path).await?;
            let batch = entries_to_batch(entries, dim)?;
            let schema = batch.schema();
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            db.create_table(TABLE_NAME, batches)
                .execute()
                .await
                .map_err(|e| RagError::persistence(format!("create table: {}", e)))?;
            Some(dim)
        }
        (dim, _) => dim,
    };

    let header = IndexHeader {
        format_version: FORMAT_VERSION,
        dimension,
        entries: entries.len(),
    };
    let json = serde_json::to_string_pretty(&header).map_err(RagError::persistence)?;
    tokio::fs::write(&header_path, json)
        .await
        .map_err(|e| RagError::persistence(format!("write {:?}: {}", header_path, e)))?;

    tracing::info!("Persisted {} index entries to {:?}", entries.len(), dir);
    Ok(())
}

// ============================================================================
// Load
// ============================================================================

/// Read every entry stored in `dir`, in insertion order
pub async fn load_index(dir: &Path) -> Result<(Option<usize>, Vec<IndexEntry>)> {
    let header_path = dir.join(HEADER_FILE);
    if !header_path.is_file() {
        return Err(RagError::IndexNotFound(dir.to_path_buf()));
    }

    let raw = tokio::fs::read_to_string(&header_path)
        .await
        .map_err(|e| RagError::persistence(format!("read {:?}: {}", header_path, e)))?;
    let header: IndexHeader = serde_json::from_str(&raw)
        .map_err(|e| RagError::persistence(format!("parse {:?}: {}", header_path, e)))?;

    if header.format_version != FORMAT_VERSION {
        return Err(RagError::persistence(format!(
            "unsupported index format version {}",
            header.format_version
        )));
    }

    if header.entries == 0 {
        return Ok((header.dimension, vec![]));
    }

    let dimension = header
        .dimension
        .ok_or_else(|| RagError::persistence("header has entries but no dimension"))?;

    let db = connect(&dir.join(LANCE_DIR)).await?;
    let table = db
        .open_table(TABLE_NAME)
        .execute()
        .await
        .map_err(|e| RagError::persistence(format!("open table: {}", e)))?;

    let batches: Vec<RecordBatch> = table
        .query()
        .limit(header.entries)
        .execute()
        .await
        .map_err(|e| RagError::persistence(format!("scan table: {}", e)))?
        .try_collect()
        .await
        .map_err(|e| RagError::persistence(format!("read rows: {}", e)))?;

    let mut rows: Vec<(i64, IndexEntry)> = Vec::with_capacity(header.entries);
    for batch in &batches {
        rows.extend(batch_to_entries(batch, dimension)?);
    }

    if rows.len() != header.entries {
        return Err(RagError::persistence(format!(
            "header lists {} entries, table has {}",
            header.entries,
            rows.len()
        )));
    }

    rows.sort_by_key(|(seq, _)| *seq);
    let entries = rows.into_iter().map(|(_, entry)| entry).collect();

    tracing::info!("Loaded {} index entries from {:?}", header.entries, dir);
    Ok((Some(dimension), entries))
}

// ============================================================================
// Arrow conversion
// ============================================================================

async fn connect(path: &Path) -> Result<Connection> {
    let path_str = path
        .to_str()
        .ok_or_else(|| RagError::persistence(format!("non UTF-8 path {:?}", path)))?;

    lancedb::connect(path_str)
        .execute()
        .await
        .map_err(|e| RagError::persistence(format!("connect {:?}: {}", path, e)))
}

fn create_schema(dimension: i32) -> Schema {
    Schema::new(vec![
        Field::new("seq", DataType::Int64, false),
        Field::new("source_id", DataType::Utf8, false),
        Field::new("sequence_index", DataType::Int64, false),
        Field::new("text", DataType::Utf8, false),
        Field::new("metadata", DataType::Utf8, false),
        Field::new(
            "vector",
            DataType::FixedSizeList(
                Arc::new(Field::new("item", DataType::Float32, true)),
                dimension,
            ),
            false,
        ),
    ])
}

fn entries_to_batch(entries: &[IndexEntry], dimension: usize) -> Result<RecordBatch> {
    let dim = i32::try_from(dimension)
        .map_err(|_| RagError::persistence(format!("dimension {} too large", dimension)))?;

    let seqs: Vec<i64> = (0..entries.len() as i64).collect();
    let sources: Vec<&str> = entries.iter().map(|e| e.chunk.source_id.as_str()).collect();
    let sequence_indices: Vec<i64> = entries
        .iter()
        .map(|e| e.chunk.sequence_index as i64)
        .collect();
    let texts: Vec<&str> = entries.iter().map(|e| e.chunk.text.as_str()).collect();
    let metadata = entries
        .iter()
        .map(|e| serde_json::to_string(&e.chunk.origin_metadata))
        .collect::<std::result::Result<Vec<String>, _>>()
        .map_err(RagError::persistence)?;

    let flat: Vec<f32> = entries
        .iter()
        .flat_map(|e| e.vector.iter().copied())
        .collect();
    let values = Float32Array::from(flat);
    let field = Arc::new(Field::new("item", DataType::Float32, true));
    let vectors = FixedSizeListArray::try_new(field, dim, Arc::new(values) as Arc<dyn Array>, None)
        .map_err(|e| RagError::persistence(format!("vector column: {}", e)))?;

    RecordBatch::try_new(
        Arc::new(create_schema(dim)),
        vec![
            Arc::new(Int64Array::from(seqs)),
            Arc::new(StringArray::from(sources)),
            Arc::new(Int64Array::from(sequence_indices)),
            Arc::new(StringArray::from(texts)),
            Arc::new(StringArray::from(metadata)),
            Arc::new(vectors),
        ],
    )
    .map_err(|e| RagError::persistence(format!("record batch: {}", e)))
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| RagError::persistence(format!("missing or mistyped column '{}'", name)))
}

fn batch_to_entries(batch: &RecordBatch, dimension: usize) -> Result<Vec<(i64, IndexEntry)>> {
    let seqs = column::<Int64Array>(batch, "seq")?;
    let sources = column::<StringArray>(batch, "source_id")?;
    let sequence_indices = column::<Int64Array>(batch, "sequence_index")?;
    let texts = column::<StringArray>(batch, "text")?;
    let metadata = column::<StringArray>(batch, "metadata")?;
    let vectors = column::<FixedSizeListArray>(batch, "vector")?;

    let mut rows = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let values = vectors.value(i);
        let floats = values
            .as_any()
            .downcast_ref::<Float32Array>()
            .ok_or_else(|| RagError::persistence("vector column is not Float32"))?;
        let vector = floats.values().to_vec();
        if vector.len() != dimension {
            return Err(RagError::DimensionMismatch {
                expected: dimension,
                actual: vector.len(),
            });
        }

        let origin_metadata: BTreeMap<String, String> = serde_json::from_str(metadata.value(i))
            .map_err(|e| RagError::persistence(format!("row {} metadata: {}", i, e)))?;

        rows.push((
            seqs.value(i),
            IndexEntry {
                vector,
                chunk: Chunk {
                    text: texts.value(i).to_string(),
                    source_id: sources.value(i).to_string(),
                    sequence_index: sequence_indices.value(i) as usize,
                    origin_metadata,
                },
            },
        ));
    }

    Ok(rows)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge::index::VectorIndex;
    use crate::knowledge::vector::VectorStore;
    use tempfile::TempDir;

    fn create_test_entry(i: usize) -> IndexEntry {
        let mut meta = BTreeMap::new();
        meta.insert("source".to_string(), "notes.txt".to_string());
        meta.insert("row".to_string(), i.to_string());
        IndexEntry {
            // every third entry repeats a vector, so ties must survive the trip
            vector: vec![(i % 3) as f32 + 0.5, 1.0, 0.0],
            chunk: Chunk {
                text: format!("chunk {} – ünïcode ✓", i),
                source_id: "notes.txt".to_string(),
                sequence_index: i,
                origin_metadata: meta,
            },
        }
    }

    #[tokio::test]
    async fn test_round_trip_preserves_query_results() {
        let temp_dir = TempDir::new().unwrap();
        let index = VectorIndex::new();
        index
            .add((0..12).map(create_test_entry).collect())
            .await
            .unwrap();

        index.persist(temp_dir.path()).await.unwrap();
        let loaded = VectorIndex::load(temp_dir.path()).await.unwrap();

        assert_eq!(loaded.len().await, 12);
        assert_eq!(loaded.dimension().await, Some(3));
        assert_eq!(loaded.snapshot().await, index.snapshot().await);

        for query in [vec![1.0, 1.0, 0.0], vec![0.5, 1.0, 0.0], vec![-1.0, 0.2, 0.3]] {
            for k in [1, 3, 12] {
                let before = index.query(&query, k).await.unwrap();
                let after = loaded.query(&query, k).await.unwrap();
                assert_eq!(before, after);
            }
        }
    }

    #[tokio::test]
    async fn test_persist_overwrites_previous() {
        let temp_dir = TempDir::new().unwrap();

        let index = VectorIndex::new();
        index.add(vec![create_test_entry(0)]).await.unwrap();
        index.persist(temp_dir.path()).await.unwrap();

        index.add(vec![create_test_entry(1)]).await.unwrap();
        index.persist(temp_dir.path()).await.unwrap();

        let loaded = VectorIndex::load(temp_dir.path()).await.unwrap();
        assert_eq!(loaded.len().await, 2);
    }

    #[tokio::test]
    async fn test_empty_index_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        VectorIndex::new().persist(temp_dir.path()).await.unwrap();

        assert!(index_exists(temp_dir.path()));
        let loaded = VectorIndex::load(temp_dir.path()).await.unwrap();
        assert!(loaded.is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_index() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");

        let err = VectorIndex::load(&missing).await.unwrap_err();
        assert!(matches!(err, RagError::IndexNotFound(ref p) if p == &missing));

        let fresh = VectorIndex::load_or_new(&missing).await.unwrap();
        assert!(fresh.is_empty().await);
    }

    #[test]
    fn test_batch_conversion_round_trip() {
        let entries: Vec<IndexEntry> = (0..4).map(create_test_entry).collect();
        let batch = entries_to_batch(&entries, 3).unwrap();
        assert_eq!(batch.num_rows(), 4);

        let rows = batch_to_entries(&batch, 3).unwrap();
        let decoded: Vec<IndexEntry> = rows.into_iter().map(|(_, e)| e).collect();
        assert_eq!(decoded, entries);
    }
}
