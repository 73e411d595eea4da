//! Error taxonomy for the ingestion and query pipelines.
//!
//! Block- and chunk-level problems are recovered locally (skip, continue) by
//! the stage that hits them and never appear here. Everything in this module
//! is an operation-level failure surfaced to the caller with an actionable
//! category. Insufficient evidence is deliberately absent: the relevance gate
//! answers with [`crate::models::Answer::fallback`], not an error.

use thiserror::Error;

/// Document-level parsing failure. Non-retryable.
#[derive(Debug, Error)]
pub enum ParseError {
    /// Bytes are not a PDF at all.
    #[error("unsupported document format: {0}")]
    UnsupportedFormat(String),
    /// PDF structure could not be read.
    #[error("unreadable document: {0}")]
    Unreadable(String),
    #[error("i/o error during parsing: {0}")]
    Io(#[from] std::io::Error),
}

/// Embedding provider failure.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// Rate limit, server error, or network failure. Worth retrying.
    #[error("transient embedding failure: {0}")]
    Transient(String),
    /// Provider rejected the request; retrying will not help.
    #[error("permanent embedding failure: {0}")]
    Permanent(String),
    /// Provider is misconfigured (missing key, model, or dims).
    #[error("embedding configuration error: {0}")]
    Config(String),
}

impl EmbedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbedError::Transient(_))
    }
}

/// Vector index / storage failure.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    /// Another ingestion currently holds the write claim for this document.
    #[error("ingestion already in progress for document {0}")]
    IngestInProgress(String),
    #[error("document not found: {0}")]
    NotFound(String),
}

/// Generation provider failure during synthesis.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("transient generation failure: {0}")]
    Transient(String),
    #[error("permanent generation failure: {0}")]
    Permanent(String),
    #[error("generation configuration error: {0}")]
    Config(String),
}

impl GenerationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GenerationError::Transient(_))
    }
}

/// Analysis agent failure. Never converted into a fabricated answer.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Generation(#[from] GenerationError),
    /// The provider returned something that is not a valid verdict.
    #[error("malformed agent verdict: {0}")]
    MalformedVerdict(String),
}

/// Ingestion failure, tagged with the stage that aborted.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("parse stage failed: {0}")]
    Parse(#[from] ParseError),
    #[error("embedding stage failed: {0}")]
    Embedding(#[from] EmbedError),
    #[error("index stage failed: {0}")]
    Index(#[from] IndexError),
    #[error("ingestion exceeded the {0}s ceiling")]
    Timeout(u64),
}

/// Query failure. Distinguishes "system error" from the fallback answer,
/// which is returned as a successful [`crate::models::Answer`].
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("document {id} is not ready (status: {status})")]
    NotReady { id: String, status: String },
    /// Index embeddings and query embedder use different configurations.
    /// Fatal: mixing spaces silently degrades ranking.
    #[error("embedding model mismatch: index built with {indexed}, query uses {current}")]
    RetrievalMismatch { indexed: String, current: String },
    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbedError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("answer synthesis failed: {0}")]
    Agent(#[from] AgentError),
    #[error("query exceeded the {0}s ceiling")]
    Timeout(u64),
}
