//! # docqa
//!
//! A local-first multimodal document question-answering pipeline.
//!
//! docqa ingests PDF documents — text, tables, and embedded images — into a
//! per-document vector index backed by SQLite, and answers natural-language
//! questions against a single document at a time. An analysis agent gates
//! every answer on retrieved evidence: responses carry page-level citations,
//! and when the evidence is insufficient the system refuses with a fixed
//! fallback instead of fabricating.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌──────────┐   ┌───────────┐
//! │  Parser   │──▶│ Chunker │──▶│ Embedder │──▶│  SQLite    │
//! │ PDF+imgs  │   │ by kind │   │ batched  │   │ vec index  │
//! └──────────┘   └─────────┘   └──────────┘   └─────┬─────┘
//!                                                   │
//!                              ┌────────────────────┤
//!                              ▼                    ▼
//!                        ┌───────────┐       ┌───────────┐
//!                        │ Retriever  │──────▶│   Agent    │
//!                        │ top-k cos  │       │ gate+cite  │
//!                        └───────────┘       └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docqa init                              # create database
//! docqa ingest report.pdf                 # parse, chunk, embed, index
//! docqa ask <doc-id> "What was Q3 revenue?"
//! docqa status <doc-id>                   # ingestion state and chunk count
//! docqa delete <doc-id>                   # remove index entries and images
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`parse`] | PDF parsing into content blocks |
//! | [`chunker`] | Kind-specific chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Per-document vector index |
//! | [`retrieve`] | Document-scoped top-k retrieval |
//! | [`agent`] | Relevance gate and answer synthesis |
//! | [`ingest`] | Ingestion pipeline orchestration |
//! | [`query`] | Query pipeline orchestration |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod agent;
pub mod chunker;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod index;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod parse;
pub mod query;
pub mod retrieve;
