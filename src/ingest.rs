//! Ingestion pipeline: parse, chunk, embed, index.
//!
//! One document moves through the stages strictly in order; different
//! documents may ingest concurrently. Exclusivity per document id is enforced
//! by the index's write claim, so a second ingestion of the same id fails
//! fast instead of racing.
//!
//! Failure semantics: any stage error marks the document `failed`, removes
//! image files written during parsing, and leaves no partially searchable
//! index (chunk writes are transactional). The whole pipeline runs under a
//! wall-clock ceiling from `[limits] ingest_timeout_secs`.

use std::path::Path;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::chunker::chunk_blocks;
use crate::config::{Config, EmbeddingConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::{EmbedError, IngestError, ParseError};
use crate::index;
use crate::models::{Chunk, IngestReport};
use crate::parse::parse_document;

/// Ingest one document end to end.
///
/// Claims the document id, runs the staged pipeline under the configured
/// timeout, and flips the document to `ready` on success or `failed` on any
/// error. Returns [`crate::error::IndexError::IngestInProgress`] (via
/// [`IngestError::Index`]) without touching state when another ingestion of
/// the same id is in flight.
pub async fn run_ingest(
    pool: &SqlitePool,
    config: &Config,
    embedder: Arc<dyn EmbeddingProvider>,
    bytes: Vec<u8>,
    document_id: &str,
    filename: &str,
) -> Result<IngestReport, IngestError> {
    index::claim_document(pool, document_id, filename).await?;

    let ceiling = config.limits.ingest_timeout_secs;
    let outcome = tokio::time::timeout(
        std::time::Duration::from_secs(ceiling),
        ingest_pipeline(pool, config, embedder, bytes, document_id),
    )
    .await;

    match outcome {
        Ok(Ok(report)) => {
            info!(
                document_id,
                pages = report.page_count,
                chunks = report.chunk_count,
                images = report.images_extracted,
                "ingestion complete"
            );
            Ok(report)
        }
        Ok(Err(e)) => {
            release_failed(pool, document_id).await;
            Err(e)
        }
        Err(_) => {
            release_failed(pool, document_id).await;
            // The pipeline future was dropped, so its image bookkeeping is
            // gone; sweep by filename prefix instead.
            sweep_images(&config.storage.image_dir, document_id);
            Err(IngestError::Timeout(ceiling))
        }
    }
}

async fn ingest_pipeline(
    pool: &SqlitePool,
    config: &Config,
    embedder: Arc<dyn EmbeddingProvider>,
    bytes: Vec<u8>,
    document_id: &str,
) -> Result<IngestReport, IngestError> {
    // Parsing is CPU-bound and must not stall the runtime.
    let image_dir = config.storage.image_dir.clone();
    let doc_id = document_id.to_string();
    let parsed = tokio::task::spawn_blocking(move || parse_document(&bytes, &doc_id, &image_dir))
        .await
        .map_err(|e| ParseError::Unreadable(format!("parser task failed: {}", e)))??;

    if !parsed.skipped_pages.is_empty() {
        warn!(
            document_id,
            skipped = ?parsed.skipped_pages,
            "pages skipped during extraction"
        );
    }

    let chunks = chunk_blocks(document_id, &parsed.blocks, &config.chunking);

    let (embeddable, skipped): (Vec<Chunk>, Vec<Chunk>) = chunks
        .into_iter()
        .partition(|c| is_embeddable(c, config.embedding.max_embed_chars));
    for chunk in &skipped {
        warn!(chunk_id = %chunk.id, chars = chunk.content.chars().count(), "chunk not embeddable, skipped");
    }
    let mut unembeddable_chunks = skipped.len();

    let entries: Vec<(Chunk, Vec<f32>)> = if embeddable.is_empty() {
        Vec::new()
    } else {
        match embed_chunks(&embeddable, embedder.clone(), &config.embedding).await {
            Ok(slots) => {
                let mut entries = Vec::with_capacity(slots.len());
                for (chunk, slot) in embeddable.into_iter().zip(slots) {
                    match slot {
                        Some(vector) => entries.push((chunk, vector)),
                        None => {
                            warn!(chunk_id = %chunk.id, "chunk rejected by embedding provider, skipped");
                            unembeddable_chunks += 1;
                        }
                    }
                }
                entries
            }
            Err(e) => {
                cleanup_images(&config.storage.image_dir, &parsed.image_paths);
                return Err(e.into());
            }
        }
    };

    let chunk_count = entries.len();
    if let Err(e) = index::upsert_chunks(pool, document_id, &entries).await {
        cleanup_images(&config.storage.image_dir, &parsed.image_paths);
        return Err(e.into());
    }
    index::mark_ready(pool, document_id, parsed.page_count, embedder.model_name()).await?;

    Ok(IngestReport {
        document_id: document_id.to_string(),
        page_count: parsed.page_count,
        chunk_count,
        skipped_pages: parsed.skipped_pages,
        unembeddable_chunks,
        images_extracted: parsed.image_paths.len(),
    })
}

/// Embed chunks in batches, at most `embedding.concurrency` batches in
/// flight at once. A waiting batch holds no provider connection, so excess
/// work queues instead of piling requests onto the backend. Results come
/// back in chunk order regardless of completion order; a `None` slot marks
/// a chunk the provider permanently rejected.
async fn embed_chunks(
    chunks: &[Chunk],
    embedder: Arc<dyn EmbeddingProvider>,
    config: &EmbeddingConfig,
) -> Result<Vec<Option<Vec<f32>>>, EmbedError> {
    let batch_size = config.batch_size.max(1);
    let semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
    let mut tasks: JoinSet<Result<(usize, Vec<Option<Vec<f32>>>), EmbedError>> = JoinSet::new();

    let batches: Vec<Vec<String>> = chunks
        .chunks(batch_size)
        .map(|batch| batch.iter().map(|c| c.content.clone()).collect())
        .collect();
    let batch_count = batches.len();

    for (idx, texts) in batches.into_iter().enumerate() {
        let embedder = embedder.clone();
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| EmbedError::Permanent("embedding scheduler closed".to_string()))?;
            let slots = embed_batch_salvaging(embedder.as_ref(), &texts).await?;
            Ok((idx, slots))
        });
    }

    let mut vectors: Vec<Option<Vec<Option<Vec<f32>>>>> = vec![None; batch_count];
    while let Some(joined) = tasks.join_next().await {
        let (idx, slots) =
            joined.map_err(|e| EmbedError::Permanent(format!("embedding task failed: {}", e)))??;
        vectors[idx] = Some(slots);
    }

    let mut out = Vec::with_capacity(chunks.len());
    for slot in vectors {
        match slot {
            Some(batch) => out.extend(batch),
            None => {
                return Err(EmbedError::Permanent(
                    "embedding batch produced no result".to_string(),
                ))
            }
        }
    }

    if out.len() != chunks.len() {
        return Err(EmbedError::Permanent(format!(
            "embedding count mismatch: {} chunks, {} slots",
            chunks.len(),
            out.len()
        )));
    }
    Ok(out)
}

/// Embed one batch; on a permanent rejection, re-embed text by text so
/// blame lands on the offending chunk instead of the whole document. A
/// rejected text yields a `None` slot. Transient (retry-exhausted) and
/// configuration errors still abort.
async fn embed_batch_salvaging(
    embedder: &dyn EmbeddingProvider,
    texts: &[String],
) -> Result<Vec<Option<Vec<f32>>>, EmbedError> {
    match embedder.embed_batch(texts).await {
        Ok(batch_vectors) => Ok(batch_vectors.into_iter().map(Some).collect()),
        Err(EmbedError::Permanent(reason)) => {
            warn!(error = %reason, "embedding batch rejected, retrying text by text");
            let mut slots = Vec::with_capacity(texts.len());
            for text in texts {
                match embedder.embed_batch(std::slice::from_ref(text)).await {
                    Ok(mut vectors) => slots.push(vectors.pop()),
                    Err(EmbedError::Permanent(_)) => slots.push(None),
                    Err(other) => return Err(other),
                }
            }
            Ok(slots)
        }
        Err(other) => Err(other),
    }
}

fn is_embeddable(chunk: &Chunk, max_chars: usize) -> bool {
    let trimmed = chunk.content.trim();
    !trimmed.is_empty() && chunk.content.chars().count() <= max_chars
}

/// Best-effort rollback of state the pipeline wrote before failing.
async fn release_failed(pool: &SqlitePool, document_id: &str) {
    if let Err(e) = index::mark_failed(pool, document_id).await {
        warn!(document_id, error = %e, "could not mark document failed");
    }
}

fn cleanup_images(image_dir: &Path, image_paths: &[String]) {
    for rel in image_paths {
        let path = image_dir.join(rel);
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "could not remove extracted image");
        }
    }
}

/// Remove every extracted image belonging to a document, found by filename
/// prefix. Used when the exact path list is no longer available.
fn sweep_images(image_dir: &Path, document_id: &str) {
    let prefix = format!("{}_", document_id);
    let entries = match std::fs::read_dir(image_dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(&prefix) {
            let path = entry.path();
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "could not remove extracted image");
            }
        }
    }
}
