//! CSV loading: one document per data row

use std::path::Path;

use crate::error::{RagError, Result};

use super::LoadedDocument;

/// Each row becomes `header: value` lines, tagged with its 0-based `row`
pub fn load(path: &Path) -> Result<Vec<LoadedDocument>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|e| RagError::load(path, e))?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| RagError::load(path, e))?
        .iter()
        .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
        .collect();

    let mut documents = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.map_err(|e| RagError::load(path, format!("row {}: {}", row, e)))?;

        let text = record
            .iter()
            .enumerate()
            .map(|(i, value)| {
                let header = headers.get(i).map(String::as_str).unwrap_or("");
                format!("{}: {}", header, value.trim())
            })
            .collect::<Vec<_>>()
            .join("\n");

        documents.push(LoadedDocument::new(path, text).with("row", row));
    }

    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_rows_become_documents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("people.csv");
        std::fs::write(&path, "name,city\nAda,London\nGrace, Arlington\n").unwrap();

        let docs = load(&path).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].text, "name: Ada\ncity: London");
        assert_eq!(docs[1].text, "name: Grace\ncity: Arlington");
        assert_eq!(docs[0].metadata["row"], "0");
        assert_eq!(docs[1].metadata["row"], "1");
    }

    #[test]
    fn test_header_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.csv");
        std::fs::write(&path, "a,b\n").unwrap();

        assert!(load(&path).unwrap().is_empty());
    }
}
