//! Multimodal PDF parser.
//!
//! Turns raw document bytes into a sequence of typed [`ContentBlock`]s with
//! page provenance. Three kinds are produced:
//!
//! - **Text** — contiguous prose lines from a page.
//! - **Table** — runs of column-aligned lines, re-serialized as
//!   markdown-style `| a | b |` rows so downstream chunking and embedding
//!   work on plain text.
//! - **Image** — JPEG XObjects extracted to the image directory; the block
//!   carries the relative file path plus a positional description that serves
//!   as the embeddable text.
//!
//! Failure policy: an unreadable document is a [`ParseError`] and nothing is
//! indexed; a single page that fails text extraction is skipped and recorded
//! in [`ParsedDocument::skipped_pages`], because partial evidence beats total
//! failure for large documents.

use std::path::Path;

use lopdf::{Dictionary, Object, Stream};
use tracing::{debug, warn};

use crate::error::ParseError;
use crate::models::{BlockKind, ContentBlock, ParsedDocument};

/// Minimum column-aligned lines in a row for a table block.
const TABLE_MIN_LINES: usize = 2;

/// Parse document bytes into content blocks, writing extracted images under
/// `image_dir`. Blocks are ordered page-ascending, text/tables before images
/// within a page.
pub fn parse_document(
    bytes: &[u8],
    document_id: &str,
    image_dir: &Path,
) -> Result<ParsedDocument, ParseError> {
    if !bytes.starts_with(b"%PDF") {
        return Err(ParseError::UnsupportedFormat(
            "expected a PDF (missing %PDF header)".to_string(),
        ));
    }

    let doc = lopdf::Document::load_mem(bytes)
        .map_err(|e| ParseError::Unreadable(e.to_string()))?;

    let pages = doc.get_pages();
    if pages.is_empty() {
        return Err(ParseError::Unreadable("document has no pages".to_string()));
    }
    let page_count = pages.len() as u32;

    std::fs::create_dir_all(image_dir)?;

    // Prefer pdf-extract's layout-aware by-pages extraction; fall back to
    // lopdf's page-at-a-time extraction, which lets us skip a bad page
    // without aborting the document.
    let page_texts = pdf_extract::extract_text_from_mem_by_pages(bytes).ok();
    let mut skipped_pages = Vec::new();

    let mut blocks = Vec::new();
    let mut image_paths = Vec::new();

    for (&page_no, &page_id) in pages.iter() {
        let text = match &page_texts {
            Some(texts) => texts.get(page_no as usize - 1).cloned(),
            None => None,
        };
        let text = match text {
            Some(t) => t,
            None => match doc.extract_text(&[page_no]) {
                Ok(t) => t,
                Err(e) => {
                    warn!(page = page_no, error = %e, "skipping unparsable page");
                    skipped_pages.push(page_no);
                    String::new()
                }
            },
        };

        let mut index_on_page: u32 = 0;

        for (kind, content) in segment_page_text(&text) {
            blocks.push(ContentBlock {
                kind,
                page: page_no,
                index_on_page,
                content,
                image_path: None,
            });
            index_on_page += 1;
        }

        for path in extract_page_images(&doc, page_id, page_no, document_id, image_dir) {
            blocks.push(ContentBlock {
                kind: BlockKind::Image,
                page: page_no,
                index_on_page,
                content: format!("Image {} on page {}", index_on_page + 1, page_no),
                image_path: Some(path.clone()),
            });
            image_paths.push(path);
            index_on_page += 1;
        }
    }

    debug!(
        pages = page_count,
        blocks = blocks.len(),
        images = image_paths.len(),
        skipped = skipped_pages.len(),
        "parsed document"
    );

    Ok(ParsedDocument {
        blocks,
        page_count,
        skipped_pages,
        image_paths,
    })
}

/// Split one page's text into alternating Text and Table blocks.
///
/// A line is "tabular" when it has two or more cells separated by tabs or
/// runs of 2+ spaces. [`TABLE_MIN_LINES`] or more consecutive tabular lines
/// form a Table block; everything else accumulates into Text blocks split on
/// blank lines.
pub(crate) fn segment_page_text(text: &str) -> Vec<(BlockKind, String)> {
    let mut out = Vec::new();
    let mut prose: Vec<&str> = Vec::new();
    let mut tabular: Vec<Vec<String>> = Vec::new();

    let flush_prose = |buf: &mut Vec<&str>, out: &mut Vec<(BlockKind, String)>| {
        let joined = buf.join("\n");
        let trimmed = joined.trim();
        if !trimmed.is_empty() {
            out.push((BlockKind::Text, trimmed.to_string()));
        }
        buf.clear();
    };

    let flush_table = |rows: &mut Vec<Vec<String>>, out: &mut Vec<(BlockKind, String)>| {
        if rows.len() >= TABLE_MIN_LINES {
            let serialized = rows
                .iter()
                .map(|cells| format!("| {} |", cells.join(" | ")))
                .collect::<Vec<_>>()
                .join("\n");
            out.push((BlockKind::Table, serialized));
        } else {
            // Too short to be a table; fold back into prose order.
            for cells in rows.iter() {
                let line = cells.join(" ");
                if !line.is_empty() {
                    out.push((BlockKind::Text, line));
                }
            }
        }
        rows.clear();
    };

    for line in text.lines() {
        match split_cells(line) {
            Some(cells) => {
                flush_prose(&mut prose, &mut out);
                tabular.push(cells);
            }
            None => {
                flush_table(&mut tabular, &mut out);
                if line.trim().is_empty() {
                    flush_prose(&mut prose, &mut out);
                } else {
                    prose.push(line);
                }
            }
        }
    }
    flush_table(&mut tabular, &mut out);
    flush_prose(&mut prose, &mut out);

    out
}

/// Split a line into table cells, or `None` if it does not look tabular.
fn split_cells(line: &str) -> Option<Vec<String>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let cells: Vec<String> = if trimmed.contains('\t') {
        trimmed
            .split('\t')
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    } else {
        trimmed
            .split("  ")
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect()
    };

    if cells.len() >= 2 {
        Some(cells)
    } else {
        None
    }
}

/// Extract JPEG image XObjects from one page, writing each to `image_dir`.
///
/// Only DCTDecode streams are written (their content is a ready JPEG file).
/// Other encodings and unwritable files are skipped with a warning; image
/// loss never fails the page.
fn extract_page_images(
    doc: &lopdf::Document,
    page_id: lopdf::ObjectId,
    page_no: u32,
    document_id: &str,
    image_dir: &Path,
) -> Vec<String> {
    let mut paths = Vec::new();

    let page_dict = match doc.get_dictionary(page_id) {
        Ok(d) => d,
        Err(_) => return paths,
    };
    let resources = match page_dict
        .get(b"Resources")
        .ok()
        .and_then(|o| resolve_dict(doc, o))
    {
        Some(d) => d,
        None => return paths,
    };
    let xobjects = match resources
        .get(b"XObject")
        .ok()
        .and_then(|o| resolve_dict(doc, o))
    {
        Some(d) => d,
        None => return paths,
    };

    let mut n = 0u32;
    for (_name, value) in xobjects.iter() {
        let stream = match resolve_stream(doc, value) {
            Some(s) => s,
            None => continue,
        };
        if !is_jpeg_image(&stream.dict) {
            continue;
        }

        n += 1;
        let filename = format!("{}_p{}_{}.jpg", document_id, page_no, n);
        let path = image_dir.join(&filename);
        match std::fs::write(&path, &stream.content) {
            Ok(()) => paths.push(filename),
            Err(e) => {
                warn!(page = page_no, file = %path.display(), error = %e,
                    "failed to write extracted image, skipping");
            }
        }
    }

    paths
}

fn resolve_dict<'a>(doc: &'a lopdf::Document, obj: &'a Object) -> Option<&'a Dictionary> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok()?.as_dict().ok(),
        Object::Dictionary(d) => Some(d),
        _ => None,
    }
}

fn resolve_stream<'a>(doc: &'a lopdf::Document, obj: &'a Object) -> Option<&'a Stream> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok()?.as_stream().ok(),
        Object::Stream(s) => Some(s),
        _ => None,
    }
}

/// True for an image XObject whose (single) filter is DCTDecode.
fn is_jpeg_image(dict: &Dictionary) -> bool {
    let is_image = matches!(dict.get(b"Subtype"), Ok(Object::Name(n)) if n.as_slice() == b"Image");
    if !is_image {
        return false;
    }
    match dict.get(b"Filter") {
        Ok(Object::Name(n)) => n.as_slice() == b"DCTDecode",
        Ok(Object::Array(filters)) => {
            filters.len() == 1
                && matches!(&filters[0], Object::Name(n) if n.as_slice() == b"DCTDecode")
        }
        _ => false,
    }
}
