//! Query pipeline: retrieve evidence, then synthesize a grounded answer.
//!
//! The two stages run sequentially — the agent only ever sees evidence from
//! the retrieval pass of the same query. The whole pipeline runs under the
//! `[limits] query_timeout_secs` ceiling; a hung provider call surfaces as
//! [`QueryError::Timeout`] instead of blocking the caller.

use sqlx::SqlitePool;
use tracing::info;

use crate::agent::{self, GenerationProvider};
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::QueryError;
use crate::models::Answer;
use crate::retrieve;

/// Answer one question against one ingested document.
///
/// `top_k` overrides the configured retrieval depth when given. An
/// insufficient-evidence outcome is a successful [`Answer::fallback`], not
/// an error; errors here mean the pipeline itself failed.
pub async fn run_query(
    pool: &SqlitePool,
    config: &Config,
    embedder: &dyn EmbeddingProvider,
    generator: &dyn GenerationProvider,
    document_id: &str,
    question: &str,
    top_k: Option<usize>,
) -> Result<Answer, QueryError> {
    let k = top_k.unwrap_or(config.retrieval.top_k);
    let ceiling = config.limits.query_timeout_secs;

    let answer = tokio::time::timeout(
        std::time::Duration::from_secs(ceiling),
        query_pipeline(pool, embedder, generator, document_id, question, k),
    )
    .await
    .map_err(|_| QueryError::Timeout(ceiling))??;

    info!(
        document_id,
        grounded = answer.grounded,
        citations = answer.citations.len(),
        "query complete"
    );
    Ok(answer)
}

async fn query_pipeline(
    pool: &SqlitePool,
    embedder: &dyn EmbeddingProvider,
    generator: &dyn GenerationProvider,
    document_id: &str,
    question: &str,
    k: usize,
) -> Result<Answer, QueryError> {
    let evidence = retrieve::retrieve(pool, embedder, document_id, question, k).await?;
    let answer = agent::analyze(question, &evidence, generator).await?;
    Ok(answer)
}
