//! Per-document vector index over SQLite.
//!
//! Owns the `documents`, `chunks`, and `chunk_vectors` tables. Ingestion is
//! atomic per document: chunks and vectors land in one transaction, and the
//! document only flips to `ready` afterwards, so a caller can never observe a
//! half-indexed document. Queries are scoped strictly to one document id.
//!
//! Concurrency: the `pending` status row doubles as the per-document write
//! claim. [`claim_document`] atomically takes the claim and rejects a second
//! concurrent ingestion of the same id; claims for different documents never
//! interfere.

use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::IndexError;
use crate::models::{BlockKind, Chunk, DocumentRecord, IngestStatus, RetrievedChunk};

/// Atomically claim exclusive ingestion rights for a document id.
///
/// Inserts the document row as `pending`, or flips an existing `ready` /
/// `failed` row back to `pending` for re-ingestion. Fails with
/// [`IndexError::IngestInProgress`] when another ingestion currently holds
/// the claim.
pub async fn claim_document(
    pool: &SqlitePool,
    document_id: &str,
    filename: &str,
) -> Result<(), IndexError> {
    let now = chrono::Utc::now().timestamp();

    let result = sqlx::query(
        r#"
        INSERT INTO documents (id, filename, page_count, status, embedding_model, created_at)
        VALUES (?, ?, 0, 'pending', NULL, ?)
        ON CONFLICT(id) DO UPDATE SET
            filename = excluded.filename,
            status = 'pending',
            embedding_model = NULL
        WHERE documents.status != 'pending'
        "#,
    )
    .bind(document_id)
    .bind(filename)
    .bind(now)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(IndexError::IngestInProgress(document_id.to_string()));
    }

    debug!(document_id, "claimed document for ingestion");
    Ok(())
}

/// Flip a claimed document to `ready`, recording page count and the
/// embedding model its vectors were produced with.
pub async fn mark_ready(
    pool: &SqlitePool,
    document_id: &str,
    page_count: u32,
    embedding_model: &str,
) -> Result<(), IndexError> {
    sqlx::query(
        "UPDATE documents SET status = 'ready', page_count = ?, embedding_model = ? WHERE id = ?",
    )
    .bind(page_count as i64)
    .bind(embedding_model)
    .bind(document_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Flip a claimed document to `failed`, releasing the write claim.
pub async fn mark_failed(pool: &SqlitePool, document_id: &str) -> Result<(), IndexError> {
    sqlx::query("UPDATE documents SET status = 'failed' WHERE id = ?")
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Replace all index entries for a document in one transaction.
///
/// Either every chunk becomes searchable or none does; previous entries for
/// the document are removed as part of the same transaction so re-ingestion
/// is atomic too.
pub async fn upsert_chunks(
    pool: &SqlitePool,
    document_id: &str,
    entries: &[(Chunk, Vec<f32>)],
) -> Result<(), IndexError> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for (chunk, vector) in entries {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, document_id, kind, page, position, content, image_path, hash)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.kind.as_str())
        .bind(chunk.page as i64)
        .bind(chunk.position)
        .bind(&chunk.content)
        .bind(&chunk.image_path)
        .bind(&chunk.hash)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO chunk_vectors (chunk_id, document_id, embedding) VALUES (?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(vec_to_blob(vector))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;

    info!(document_id, chunks = entries.len(), "indexed document chunks");
    Ok(())
}

/// Document-scoped nearest-neighbor query.
///
/// Loads the document's vectors, scores them by cosine similarity in Rust,
/// and returns the top `k`. Ordering is deterministic: score descending,
/// then page ascending, then position ascending.
pub async fn query_chunks(
    pool: &SqlitePool,
    document_id: &str,
    query_vec: &[f32],
    k: usize,
) -> Result<Vec<RetrievedChunk>, IndexError> {
    let rows = sqlx::query(
        r#"
        SELECT c.id, c.document_id, c.kind, c.page, c.position, c.content,
               c.image_path, c.hash, cv.embedding
        FROM chunks c
        JOIN chunk_vectors cv ON cv.chunk_id = c.id
        WHERE c.document_id = ?
        "#,
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    let mut scored: Vec<RetrievedChunk> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let score = cosine_similarity(query_vec, &blob_to_vec(&blob));
            RetrievedChunk {
                chunk: row_to_chunk(row),
                score,
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.chunk.page.cmp(&b.chunk.page))
            .then(a.chunk.position.cmp(&b.chunk.position))
    });
    scored.truncate(k);

    Ok(scored)
}

/// Fetch a document record, or `None` if never ingested.
pub async fn get_document(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Option<DocumentRecord>, IndexError> {
    let row = sqlx::query(
        "SELECT id, filename, page_count, status, embedding_model, created_at FROM documents WHERE id = ?",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|row| {
        let status: String = row.get("status");
        let page_count: i64 = row.get("page_count");
        DocumentRecord {
            id: row.get("id"),
            filename: row.get("filename"),
            page_count: page_count as u32,
            status: IngestStatus::parse(&status).unwrap_or(IngestStatus::Failed),
            embedding_model: row.get("embedding_model"),
            created_at: row.get("created_at"),
        }
    }))
}

/// Relative image paths currently indexed for a document.
pub async fn list_image_paths(
    pool: &SqlitePool,
    document_id: &str,
) -> Result<Vec<String>, IndexError> {
    let rows = sqlx::query(
        "SELECT image_path FROM chunks WHERE document_id = ? AND image_path IS NOT NULL",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(|r| r.get("image_path")).collect())
}

/// Remove a document and all of its index entries in one transaction.
///
/// Returns [`IndexError::NotFound`] for unknown ids.
pub async fn delete_document(pool: &SqlitePool, document_id: &str) -> Result<(), IndexError> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    let result = sqlx::query("DELETE FROM documents WHERE id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Err(IndexError::NotFound(document_id.to_string()));
    }

    tx.commit().await?;
    info!(document_id, "deleted document");
    Ok(())
}

/// Number of indexed chunks for a document.
pub async fn count_chunks(pool: &SqlitePool, document_id: &str) -> Result<i64, IndexError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .fetch_one(pool)
        .await?;
    Ok(count)
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Chunk {
    let kind: String = row.get("kind");
    let page: i64 = row.get("page");
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        kind: BlockKind::parse(&kind).unwrap_or(BlockKind::Text),
        page: page as u32,
        position: row.get("position"),
        content: row.get("content"),
        image_path: row.get("image_path"),
        hash: row.get("hash"),
    }
}
