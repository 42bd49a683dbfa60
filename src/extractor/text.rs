//! Plain text and Markdown loading

use std::path::Path;

use pulldown_cmark::{Event, Parser, TagEnd};

use crate::error::{RagError, Result};

use super::LoadedDocument;

/// Read a UTF-8 text file as a single document
pub fn load_plain(path: &Path) -> Result<Vec<LoadedDocument>> {
    let text = read_utf8(path)?;
    Ok(vec![LoadedDocument::new(path, text)])
}

/// Read a Markdown file, keeping the prose and dropping the markup
pub fn load_markdown(path: &Path) -> Result<Vec<LoadedDocument>> {
    let text = read_utf8(path)?;
    Ok(vec![LoadedDocument::new(path, strip_markdown(&text))])
}

fn read_utf8(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| RagError::load(path, e))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| RagError::load(path, format!("not valid UTF-8: {}", e)))?;

    Ok(match text.strip_prefix('\u{feff}') {
        Some(stripped) => stripped.to_string(),
        None => text,
    })
}

/// Markdown to plain text.
///
/// Walks the parsed document and keeps text, inline code, code blocks and
/// line breaks. Anything that is not markup (`2 * 3`, `#` inside a fence)
/// is kept as written.
pub fn strip_markdown(markdown: &str) -> String {
    let mut text = String::with_capacity(markdown.len());

    for event in Parser::new(markdown) {
        match event {
            Event::Text(t) | Event::Code(t) => text.push_str(&t),
            Event::SoftBreak | Event::HardBreak => text.push('\n'),
            Event::End(TagEnd::Item) => end_block(&mut text, 1),
            Event::End(TagEnd::Paragraph | TagEnd::Heading(_) | TagEnd::CodeBlock) => {
                end_block(&mut text, 2)
            }
            _ => {}
        }
    }

    text.trim().to_string()
}

/// Make `text` end with exactly `newlines` line breaks (or more, if it already does)
fn end_block(text: &mut String, newlines: usize) {
    if text.is_empty() {
        return;
    }
    let trailing = text.chars().rev().take_while(|c| *c == '\n').count();
    for _ in trailing..newlines {
        text.push('\n');
    }
}

// ============================================================================
// Tests
// ============================================================================
