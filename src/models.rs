//! Core data models used throughout docqa.
//!
//! These types represent the documents, content blocks, chunks, and answers
//! that flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// Lifecycle state of an ingested document.
///
/// A document is `Pending` while its ingestion is in flight, `Ready` once
/// every chunk is searchable, and `Failed` if any ingestion stage aborted.
/// Queries are only served against `Ready` documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStatus {
    Pending,
    Ready,
    Failed,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Pending => "pending",
            IngestStatus::Ready => "ready",
            IngestStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(IngestStatus::Pending),
            "ready" => Some(IngestStatus::Ready),
            "failed" => Some(IngestStatus::Failed),
            _ => None,
        }
    }
}

/// Kind of an extracted content unit.
///
/// Closed variant: every downstream stage matches exhaustively on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    Text,
    Table,
    Image,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Text => "text",
            BlockKind::Table => "table",
            BlockKind::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(BlockKind::Text),
            "table" => Some(BlockKind::Table),
            "image" => Some(BlockKind::Image),
            _ => None,
        }
    }
}

/// One atomic unit extracted by the parser, never mutated afterwards.
///
/// For `Image` blocks, `content` holds the generated description used for
/// embedding and `image_path` the relative path of the extracted file.
/// For `Table` blocks, `content` is the markdown-style row serialization.
#[derive(Debug, Clone)]
pub struct ContentBlock {
    pub kind: BlockKind,
    /// 1-based page number the unit was extracted from.
    pub page: u32,
    /// Order of the unit within its page.
    pub index_on_page: u32,
    pub content: String,
    pub image_path: Option<String>,
}

/// Parser output for one document.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub blocks: Vec<ContentBlock>,
    pub page_count: u32,
    /// Pages that failed text extraction and were skipped.
    pub skipped_pages: Vec<u32>,
    /// All image files written during parsing, for failure cleanup.
    pub image_paths: Vec<String>,
}

/// A retrieval unit derived from one content block.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Deterministic id: `{document_id}:{position}`.
    pub id: String,
    pub document_id: String,
    pub kind: BlockKind,
    pub page: u32,
    /// Global chunk ordinal within the document; breaks score ties.
    pub position: i64,
    /// Text the chunk is embedded from. Never empty.
    pub content: String,
    pub image_path: Option<String>,
    /// SHA-256 of `content`, for staleness detection.
    pub hash: String,
}

/// Document row as stored in SQLite.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: String,
    pub filename: String,
    pub page_count: u32,
    pub status: IngestStatus,
    /// Embedding model the index was built with; pinned at ingestion and
    /// checked at query time.
    pub embedding_model: Option<String>,
    pub created_at: i64,
}

/// One ranked evidence item returned by the retriever. Ephemeral.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    /// Cosine similarity against the query embedding.
    pub score: f32,
}

/// A (page, kind) provenance reference emitted with an answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub page: u32,
    pub content_type: BlockKind,
}

/// Final synthesized response for one query.
///
/// The fallback shape has `grounded = false`, the fixed refusal text, and
/// empty citations and images.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub citations: Vec<Citation>,
    pub images: Vec<String>,
    pub grounded: bool,
}

/// Fixed text returned when the relevance gate rejects the evidence.
pub const FALLBACK_ANSWER: &str =
    "The document does not contain enough evidence to answer this question.";

impl Answer {
    /// The fallback-protocol response: no citations, no images, not grounded.
    pub fn fallback() -> Self {
        Answer {
            text: FALLBACK_ANSWER.to_string(),
            citations: Vec::new(),
            images: Vec::new(),
            grounded: false,
        }
    }
}

/// Summary of one completed ingestion.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub document_id: String,
    pub page_count: u32,
    pub chunk_count: usize,
    pub skipped_pages: Vec<u32>,
    pub unembeddable_chunks: usize,
    pub images_extracted: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for s in [
            IngestStatus::Pending,
            IngestStatus::Ready,
            IngestStatus::Failed,
        ] {
            assert_eq!(IngestStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(IngestStatus::parse("bogus"), None);
    }

    #[test]
    fn kind_roundtrip() {
        for k in [BlockKind::Text, BlockKind::Table, BlockKind::Image] {
            assert_eq!(BlockKind::parse(k.as_str()), Some(k));
        }
        assert_eq!(BlockKind::parse(""), None);
    }

    #[test]
    fn fallback_shape_is_empty() {
        let a = Answer::fallback();
        assert!(!a.grounded);
        assert!(a.citations.is_empty());
        assert!(a.images.is_empty());
        assert_eq!(a.text, FALLBACK_ANSWER);
    }

    #[test]
    fn citation_serializes_with_lowercase_kind() {
        let c = Citation {
            page: 3,
            content_type: BlockKind::Text,
        };
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, r#"{"page":3,"content_type":"text"}"#);
    }
}
