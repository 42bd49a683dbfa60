//! Word (.docx) and PowerPoint (.pptx) loading
//!
//! Both are zip archives of XML parts. Text lives in `<w:t>` runs
//! (`word/document.xml`) or `<a:t>` runs (`ppt/slides/slideN.xml`);
//! paragraphs end at `</w:p>` / `</a:p>`.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use regex::{Captures, Regex};
use zip::ZipArchive;

use crate::error::{RagError, Result};

use super::LoadedDocument;

/// Whole document body as one document
pub fn load_docx(path: &Path) -> Result<Vec<LoadedDocument>> {
    let mut archive = open_archive(path)?;
    let xml = read_entry(&mut archive, "word/document.xml", path)?;
    let text = xml_to_text(&xml, "w").map_err(|e| RagError::load(path, e))?;

    Ok(vec![LoadedDocument::new(path, text)])
}

/// One document per slide, tagged with the slide number as `page`
pub fn load_pptx(path: &Path) -> Result<Vec<LoadedDocument>> {
    let mut archive = open_archive(path)?;

    let slide_name = Regex::new(r"^ppt/slides/slide(\d+)\.xml$").map_err(|e| RagError::load(path, e))?;
    let mut slides: Vec<(usize, String)> = archive
        .file_names()
        .filter_map(|name| {
            let number = slide_name.captures(name)?.get(1)?.as_str().parse().ok()?;
            Some((number, name.to_string()))
        })
        .collect();
    // slide10 sorts after slide9
    slides.sort_by_key(|(number, _)| *number);

    if slides.is_empty() {
        return Err(RagError::load(path, "no slides found"));
    }

    let mut documents = Vec::with_capacity(slides.len());
    for (number, name) in slides {
        let xml = read_entry(&mut archive, &name, path)?;
        let text = xml_to_text(&xml, "a").map_err(|e| RagError::load(path, e))?;
        documents.push(LoadedDocument::new(path, text).with("page", number));
    }

    Ok(documents)
}

// ============================================================================
// Helper Functions
// ============================================================================

fn open_archive(path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(path).map_err(|e| RagError::load(path, e))?;
    ZipArchive::new(file).map_err(|e| RagError::load(path, format!("not an OOXML archive: {}", e)))
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str, path: &Path) -> Result<String> {
    let mut entry = archive
        .by_name(name)
        .map_err(|e| RagError::load(path, format!("{}: {}", name, e)))?;

    let mut xml = String::new();
    entry
        .read_to_string(&mut xml)
        .map_err(|e| RagError::load(path, format!("{}: {}", name, e)))?;
    Ok(xml)
}

/// Plain text of the runs under namespace prefix `ns`, one line per paragraph
fn xml_to_text(xml: &str, ns: &str) -> std::result::Result<String, regex::Error> {
    let run = Regex::new(&format!(
        r"<{ns}:t(?:\s[^>]*)?>([^<]*)</{ns}:t>|<{ns}:tab\s*/>|<{ns}:br\b[^>]*>",
        ns = ns
    ))?;
    let paragraph_end = format!("</{}:p>", ns);

    let mut lines = Vec::new();
    for paragraph in xml.split(paragraph_end.as_str()) {
        let mut line = String::new();
        for caps in run.captures_iter(paragraph) {
            match caps.get(1) {
                Some(text) => line.push_str(&decode_entities(text.as_str())),
                None if caps[0].contains(":tab") => line.push('\t'),
                None => line.push('\n'),
            }
        }

        let line = line.trim_end();
        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }

    Ok(lines.join("\n"))
}

/// Resolve the predefined XML entities and numeric character references
fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }

    let Ok(reference) = Regex::new(r"&(#x[0-9a-fA-F]+|#[0-9]+|lt|gt|quot|apos|amp);") else {
        return text.to_string();
    };

    reference
        .replace_all(text, |caps: &Captures| {
            let name = &caps[1];
            let decoded = match name {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                _ => name
                    .strip_prefix("#x")
                    .map(|hex| u32::from_str_radix(hex, 16))
                    .unwrap_or_else(|| name[1..].parse())
                    .ok()
                    .and_then(char::from_u32),
            };
            decoded.map(String::from).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_archive(path: &Path, parts: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, body) in parts {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    fn slide(text: &str) -> String {
        format!(
            r#"<p:sld><p:txBody><a:p><a:r><a:rPr lang="en-US"/><a:t>{}</a:t></a:r></a:p></p:txBody></p:sld>"#,
            text
        )
    }

    #[test]
    fn test_docx_paragraphs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.docx");
        let body = r#"<w:document><w:body>
            <w:p><w:pPr><w:tabs><w:tab w:val="left" w:pos="720"/></w:tabs></w:pPr>
              <w:r><w:t>Quarterly</w:t></w:r><w:r><w:t xml:space="preserve"> report</w:t></w:r></w:p>
            <w:p><w:r><w:t>Revenue</w:t></w:r><w:r><w:tab/><w:t>&lt;up&gt; &amp; right</w:t></w:r></w:p>
            <w:p></w:p>
        </w:body></w:document>"#;
        write_archive(&path, &[("word/document.xml", body)]);

        let docs = load_docx(&path).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].text, "Quarterly report\nRevenue\t<up> & right");
        assert!(!docs[0].metadata.contains_key("page"));
    }

    #[test]
    fn test_pptx_slides_in_numeric_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deck.pptx");
        let s1 = slide("Intro");
        let s2 = slide("Middle");
        let s10 = slide("Finale");
        write_archive(
            &path,
            &[
                ("ppt/slides/slide10.xml", s10.as_str()),
                ("ppt/slides/slide2.xml", s2.as_str()),
                ("ppt/slides/slide1.xml", s1.as_str()),
                ("ppt/slides/_rels/slide1.xml.rels", "<Relationships/>"),
            ],
        );

        let docs = load_pptx(&path).unwrap();
        let texts: Vec<&str> = docs.iter().map(|d| d.text.as_str()).collect();
        assert_eq!(texts, vec!["Intro", "Middle", "Finale"]);
        assert_eq!(docs[2].metadata["page"], "10");
    }

    #[test]
    fn test_not_a_zip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake.docx");
        std::fs::write(&path, "plain text pretending").unwrap();

        assert!(matches!(load_docx(&path), Err(RagError::Load { .. })));
    }

    #[test]
    fn test_missing_document_part() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.docx");
        write_archive(&path, &[("docProps/core.xml", "<cp/>")]);

        assert!(matches!(load_docx(&path), Err(RagError::Load { .. })));
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("a &amp;amp; b"), "a &amp; b");
        assert_eq!(decode_entities("&#65;&#x42;"), "AB");
        assert_eq!(decode_entities("&bogus;"), "&bogus;");
    }
}
