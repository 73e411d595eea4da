//! # docqa CLI
//!
//! The `docqa` binary is the primary interface for the document QA pipeline.
//! It provides commands for database initialization, document ingestion,
//! question answering, status inspection, and document removal.
//!
//! ## Usage
//!
//! ```bash
//! docqa --config ./config/docqa.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `docqa init` | Create the SQLite database and run schema migrations |
//! | `docqa ingest <file>` | Parse, chunk, embed, and index a PDF document |
//! | `docqa ask <doc-id> "<question>"` | Answer a question against one document |
//! | `docqa status <doc-id>` | Show ingestion state and chunk count |
//! | `docqa delete <doc-id>` | Remove a document's index entries and images |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! docqa init --config ./config/docqa.toml
//!
//! # Ingest a report (prints the document id)
//! docqa ingest ./reports/q3.pdf
//!
//! # Re-ingest under an explicit id
//! docqa ingest ./reports/q3.pdf --id q3-report
//!
//! # Ask with a deeper evidence window
//! docqa ask q3-report "What was total revenue?" --top-k 8
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sha2::{Digest, Sha256};
use tracing_subscriber::EnvFilter;

use docqa::{agent, config, db, embedding, index, ingest, migrate, query};

/// docqa CLI — a local-first multimodal document question-answering pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/docqa.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "docqa",
    about = "docqa — multimodal document question answering with grounded citations",
    version,
    long_about = "docqa ingests PDF documents (text, tables, and embedded images) into a \
    per-document vector index backed by SQLite, and answers natural-language questions \
    against a single document at a time. Answers carry page-level citations; when the \
    retrieved evidence is insufficient the system refuses instead of fabricating."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/docqa.toml`. Database, storage, chunking,
    /// retrieval, and provider settings are read from this file.
    #[arg(long, global = true, default_value = "./config/docqa.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables
    /// (documents, chunks, chunk_vectors). Idempotent — running it
    /// multiple times is safe.
    Init,

    /// Ingest a PDF document.
    ///
    /// Parses the file into text, table, and image blocks, chunks them,
    /// embeds every chunk, and indexes the result. Re-running with the same
    /// id replaces the previous index entries atomically.
    Ingest {
        /// Path to the PDF file.
        file: PathBuf,

        /// Document id. Defaults to a digest of the file contents, so
        /// re-ingesting the same bytes reuses the same id.
        #[arg(long)]
        id: Option<String>,
    },

    /// Ask a question against one ingested document.
    ///
    /// Retrieves the top-k most relevant chunks, gates on evidence
    /// sufficiency, and prints the answer with page-level citations.
    /// Requires embedding and generation providers to be configured.
    Ask {
        /// Document id (as printed by `ingest`).
        doc_id: String,

        /// The question to answer.
        question: String,

        /// Number of evidence chunks to retrieve (overrides config).
        #[arg(long, value_parser = parse_top_k)]
        top_k: Option<usize>,
    },

    /// Show a document's ingestion state.
    ///
    /// Prints status, page count, indexed chunk count, and the embedding
    /// model the index was built with.
    Status {
        /// Document id.
        doc_id: String,
    },

    /// Remove a document from the index.
    ///
    /// Deletes the document row, its chunks and vectors, and any image
    /// files extracted during ingestion.
    Delete {
        /// Document id.
        doc_id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { file, id } => {
            let bytes = std::fs::read(&file)
                .map_err(|e| anyhow::anyhow!("cannot read {}: {}", file.display(), e))?;
            let document_id = id.unwrap_or_else(|| content_id(&bytes));
            let filename = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.display().to_string());

            let pool = db::connect(&cfg).await?;
            migrate::run_migrations(&pool).await?;
            let embedder: Arc<dyn embedding::EmbeddingProvider> =
                embedding::create_embedder(&cfg.embedding)?.into();

            let report =
                ingest::run_ingest(&pool, &cfg, embedder, bytes, &document_id, &filename).await?;

            println!("Ingested {} as {}", filename, report.document_id);
            println!(
                "  {} pages, {} chunks indexed, {} images extracted",
                report.page_count, report.chunk_count, report.images_extracted
            );
            if !report.skipped_pages.is_empty() {
                println!("  skipped pages: {:?}", report.skipped_pages);
            }
            if report.unembeddable_chunks > 0 {
                println!("  {} chunks not embeddable, skipped", report.unembeddable_chunks);
            }
        }
        Commands::Ask {
            doc_id,
            question,
            top_k,
        } => {
            let pool = db::connect(&cfg).await?;
            let embedder = embedding::create_embedder(&cfg.embedding)?;
            let generator = agent::create_generator(&cfg.generation)?;

            let answer = query::run_query(
                &pool,
                &cfg,
                embedder.as_ref(),
                generator.as_ref(),
                &doc_id,
                &question,
                top_k,
            )
            .await?;

            println!("{}", answer.text);
            if !answer.citations.is_empty() {
                println!();
                println!("Citations:");
                for c in &answer.citations {
                    println!("  page {} ({})", c.page, c.content_type.as_str());
                }
            }
            if !answer.images.is_empty() {
                println!();
                println!("Images:");
                for path in &answer.images {
                    println!("  {}", cfg.storage.image_dir.join(path).display());
                }
            }
        }
        Commands::Status { doc_id } => {
            let pool = db::connect(&cfg).await?;
            match index::get_document(&pool, &doc_id).await? {
                Some(doc) => {
                    let chunks = index::count_chunks(&pool, &doc_id).await?;
                    println!("Document {}", doc.id);
                    println!("  file:   {}", doc.filename);
                    println!("  status: {}", doc.status.as_str());
                    println!("  pages:  {}", doc.page_count);
                    println!("  chunks: {}", chunks);
                    if let Some(model) = &doc.embedding_model {
                        println!("  model:  {}", model);
                    }
                }
                None => {
                    println!("Document not found: {}", doc_id);
                }
            }
        }
        Commands::Delete { doc_id } => {
            let pool = db::connect(&cfg).await?;
            let image_paths = index::list_image_paths(&pool, &doc_id).await?;
            index::delete_document(&pool, &doc_id).await?;
            for rel in &image_paths {
                let path = cfg.storage.image_dir.join(rel);
                if let Err(e) = std::fs::remove_file(&path) {
                    eprintln!("warning: could not remove {}: {}", path.display(), e);
                }
            }
            println!("Deleted document {} ({} images removed)", doc_id, image_paths.len());
        }
    }

    Ok(())
}

fn parse_top_k(s: &str) -> Result<usize, String> {
    let k: usize = s.parse().map_err(|e| format!("{}", e))?;
    if k == 0 {
        return Err("must be >= 1".to_string());
    }
    Ok(k)
}

/// Deterministic document id from file contents.
fn content_id(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex_prefix(&digest, 16)
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut s = String::with_capacity(chars);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
        if s.len() >= chars {
            break;
        }
    }
    s.truncate(chars);
    s
}
