//! Deterministic document-scoped retrieval.
//!
//! Embeds the query text with the same provider configuration the index was
//! built with and runs a top-k cosine search over that document's chunks.
//! No randomness and no caching: a re-query after re-ingestion reflects the
//! updated index immediately.

use sqlx::SqlitePool;
use tracing::debug;

use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::QueryError;
use crate::index;
use crate::models::{IngestStatus, RetrievedChunk};

/// Retrieve the top `k` evidence chunks for a query against one document.
///
/// Fails when the document is missing or not `ready`, or when the index was
/// built with a different embedding model than the provider in hand —
/// mixing embedding spaces would silently degrade ranking, so it is a hard
/// error instead.
pub async fn retrieve(
    pool: &SqlitePool,
    provider: &dyn EmbeddingProvider,
    document_id: &str,
    query: &str,
    k: usize,
) -> Result<Vec<RetrievedChunk>, QueryError> {
    let doc = index::get_document(pool, document_id)
        .await?
        .ok_or_else(|| QueryError::NotFound(document_id.to_string()))?;

    if doc.status != IngestStatus::Ready {
        return Err(QueryError::NotReady {
            id: document_id.to_string(),
            status: doc.status.as_str().to_string(),
        });
    }

    let indexed_model = doc.embedding_model.unwrap_or_default();
    if indexed_model != provider.model_name() {
        return Err(QueryError::RetrievalMismatch {
            indexed: indexed_model,
            current: provider.model_name().to_string(),
        });
    }

    let query_vec = embed_query(provider, query).await?;
    let results = index::query_chunks(pool, document_id, &query_vec, k).await?;

    debug!(
        document_id,
        k,
        returned = results.len(),
        "retrieval complete"
    );
    Ok(results)
}
