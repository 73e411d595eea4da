//! Kind-aware chunker.
//!
//! Splits parsed [`ContentBlock`]s into retrieval-sized [`Chunk`]s while
//! preserving page and kind provenance:
//!
//! - Text blocks use a sliding window of `target_chars` with `overlap_chars`
//!   carried between consecutive chunks, so a fact spanning a split point
//!   stays retrievable from at least one chunk. Splits prefer whitespace
//!   boundaries.
//! - Tables at or under `table_max_rows` rows stay one chunk; larger tables
//!   split by row groups, never mid-row and never by column.
//! - Image blocks become exactly one chunk whose embeddable text is the
//!   generated description, with the image path carried as side data.
//!
//! Chunk ids are deterministic (`{document_id}:{position}`) and each chunk
//! carries a SHA-256 hash of its text, so identical input reproduces
//! byte-identical chunks.

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::config::ChunkingConfig;
use crate::models::{BlockKind, Chunk, ContentBlock};

/// Chunk all blocks of a document in order. Blocks with empty content are
/// skipped (chunk-level recovery, never an ingestion failure).
pub fn chunk_blocks(
    document_id: &str,
    blocks: &[ContentBlock],
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut position: i64 = 0;

    for block in blocks {
        if block.content.trim().is_empty() {
            warn!(
                page = block.page,
                kind = block.kind.as_str(),
                "skipping empty content block"
            );
            continue;
        }

        let pieces: Vec<String> = match block.kind {
            BlockKind::Text => split_text(&block.content, config.target_chars, config.overlap_chars),
            BlockKind::Table => split_table(&block.content, config.table_max_rows),
            BlockKind::Image => vec![block.content.trim().to_string()],
        };

        for piece in pieces {
            if piece.is_empty() {
                continue;
            }
            chunks.push(make_chunk(document_id, position, block, piece));
            position += 1;
        }
    }

    chunks
}

fn make_chunk(document_id: &str, position: i64, block: &ContentBlock, content: String) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: format!("{}:{}", document_id, position),
        document_id: document_id.to_string(),
        kind: block.kind,
        page: block.page,
        position,
        content,
        image_path: block.image_path.clone(),
        hash,
    }
}

/// Sliding-window split with overlap, preferring whitespace boundaries.
fn split_text(text: &str, target_chars: usize, overlap_chars: usize) -> Vec<String> {
    let text = text.trim();
    if text.len() <= target_chars {
        return vec![text.to_string()];
    }

    let mut pieces = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let remaining = &text[start..];
        if remaining.len() <= target_chars {
            pieces.push(remaining.trim().to_string());
            break;
        }

        let window = floor_char_boundary(remaining, target_chars);
        // Break at the last whitespace inside the window when one exists.
        let cut = remaining[..window]
            .rfind(char::is_whitespace)
            .filter(|&pos| pos > 0)
            .unwrap_or(window);

        pieces.push(remaining[..cut].trim().to_string());

        // Step forward keeping `overlap_chars` of context, at a boundary.
        let step = cut.saturating_sub(overlap_chars).max(1);
        let step = ceil_char_boundary(remaining, step);
        start += step;
    }

    pieces.retain(|p| !p.is_empty());
    pieces
}

/// Split a serialized table into row groups of at most `max_rows` lines.
fn split_table(table: &str, max_rows: usize) -> Vec<String> {
    let rows: Vec<&str> = table.lines().filter(|l| !l.trim().is_empty()).collect();
    if rows.len() <= max_rows {
        return vec![rows.join("\n")];
    }

    rows.chunks(max_rows)
        .map(|group| group.join("\n"))
        .collect()
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_block(page: u32, content: &str) -> ContentBlock {
        ContentBlock {
            kind: BlockKind::Text,
            page,
            index_on_page: 0,
            content: content.to_string(),
            image_path: None,
        }
    }

    fn table_block(rows: usize) -> ContentBlock {
        let content = (0..rows)
            .map(|i| format!("| row {} | value {} |", i, i * 10))
            .collect::<Vec<_>>()
            .join("\n");
        ContentBlock {
            kind: BlockKind::Table,
            page: 2,
            index_on_page: 0,
            content,
            image_path: None,
        }
    }

    fn cfg(target: usize, overlap: usize, table_rows: usize) -> ChunkingConfig {
        ChunkingConfig {
            target_chars: target,
            overlap_chars: overlap,
            table_max_rows: table_rows,
        }
    }

    #[test]
    fn small_text_single_chunk() {
        let chunks = chunk_blocks("d1", &[text_block(1, "Hello, world!")], &cfg(700, 80, 20));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "d1:0");
        assert_eq!(chunks[0].page, 1);
        assert_eq!(chunks[0].content, "Hello, world!");
    }

    #[test]
    fn long_text_splits_with_overlap() {
        let words = (0..200).map(|i| format!("word{}", i)).collect::<Vec<_>>();
        let text = words.join(" ");
        let chunks = chunk_blocks("d1", &[text_block(1, &text)], &cfg(120, 30, 20));
        assert!(chunks.len() > 1);
        // Overlap: each chunk after the first must share a word with its
        // predecessor's tail.
        for pair in chunks.windows(2) {
            let tail_word = pair[0].content.split_whitespace().last().unwrap();
            assert!(
                pair[1].content.contains(tail_word),
                "no overlap between consecutive chunks"
            );
        }
        // No split may eat content: every word remains findable somewhere.
        for w in &words {
            assert!(chunks.iter().any(|c| c.content.contains(w.as_str())));
        }
    }

    #[test]
    fn chunking_is_deterministic() {
        let blocks = vec![
            text_block(1, &"lorem ipsum dolor sit amet ".repeat(40)),
            table_block(7),
        ];
        let a = chunk_blocks("d1", &blocks, &cfg(200, 40, 20));
        let b = chunk_blocks("d1", &blocks, &cfg(200, 40, 20));
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.id, y.id);
            assert_eq!(x.content, y.content);
            assert_eq!(x.hash, y.hash);
            assert_eq!(x.position, y.position);
        }
    }

    #[test]
    fn small_table_single_chunk() {
        let chunks = chunk_blocks("d1", &[table_block(5)], &cfg(700, 80, 20));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, BlockKind::Table);
        assert_eq!(chunks[0].content.lines().count(), 5);
    }

    #[test]
    fn oversized_table_splits_by_row_groups() {
        // 50 rows with a 20-row threshold must yield ceil(50/20) = 3 chunks.
        let chunks = chunk_blocks("d1", &[table_block(50)], &cfg(700, 80, 20));
        assert_eq!(chunks.len(), 3);
        let row_counts: Vec<usize> = chunks.iter().map(|c| c.content.lines().count()).collect();
        assert_eq!(row_counts, vec![20, 20, 10]);
        // Never mid-row: every line is a complete serialized row.
        for c in &chunks {
            for line in c.content.lines() {
                assert!(line.starts_with("| row "));
                assert!(line.ends_with(" |"));
            }
        }
    }

    #[test]
    fn image_block_single_chunk_with_side_data() {
        let block = ContentBlock {
            kind: BlockKind::Image,
            page: 4,
            index_on_page: 2,
            content: "Image 3 on page 4".to_string(),
            image_path: Some("d1_p4_1.jpg".to_string()),
        };
        let chunks = chunk_blocks("d1", &[block], &cfg(700, 80, 20));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].kind, BlockKind::Image);
        assert_eq!(chunks[0].content, "Image 3 on page 4");
        assert_eq!(chunks[0].image_path.as_deref(), Some("d1_p4_1.jpg"));
    }

    #[test]
    fn empty_blocks_are_skipped() {
        let blocks = vec![text_block(1, "   "), text_block(1, "real content")];
        let chunks = chunk_blocks("d1", &blocks, &cfg(700, 80, 20));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content, "real content");
        assert_eq!(chunks[0].position, 0);
    }

    #[test]
    fn positions_are_contiguous_across_blocks() {
        let blocks = vec![
            text_block(1, &"alpha beta gamma ".repeat(30)),
            table_block(45),
            text_block(3, "closing remarks"),
        ];
        let chunks = chunk_blocks("d1", &blocks, &cfg(100, 20, 20));
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.position, i as i64);
            assert_eq!(c.id, format!("d1:{}", i));
        }
    }

    #[test]
    fn multibyte_text_splits_on_char_boundaries() {
        let text = "héllo wörld ünïcode ".repeat(30);
        let chunks = chunk_blocks("d1", &[text_block(1, &text)], &cfg(50, 10, 20));
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(!c.content.is_empty());
        }
    }
}
