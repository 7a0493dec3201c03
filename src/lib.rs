//! # lexrag
//!
//! Grounded question answering over Berlin legal text.
//!
//! lexrag ingests scraped statutes and regulations, normalizes and chunks
//! them along their legal structure, embeds the chunks into a vector index,
//! and answers questions with a language model that may only cite the
//! passages it was given. Every answer is traceable to its sources.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────────┐   ┌──────────────┐
//! │ Scraper feed│──▶│ Normalize → Chunk →  │──▶│    SQLite     │
//! │ JSON / JSONL│   │ Embed (batched)      │   │ docs+vectors  │
//! └─────────────┘   └──────────────────────┘   └──────┬───────┘
//!                                                     │
//!                      ┌──────────────────────────────┘
//!                      ▼
//!              ┌──────────────┐   ┌───────────────┐
//!   question ─▶│  Retriever   │──▶│  Synthesizer  │──▶ cited Answer
//!              └──────────────┘   └───────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! lexrag init                              # create database
//! lexrag ingest ./data/raw                 # ingest scraper output
//! lexrag query "Welche Abstandsflächen gelten in Berlin?"
//! lexrag health
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite metadata store and vector index |
//! | [`embedding`] | Embedding providers (hashing, OpenAI, Ollama, fastembed) |
//! | [`generation`] | Language models (extractive, OpenAI, Ollama) |
//! | [`http`] | Provider HTTP error classification |
//! | [`retry`] | Timeouts and exponential backoff |
//! | [`embedder`] | Batched, bounded-concurrency embedding |
//! | [`retriever`] | Query embedding, search and hit resolution |
//! | [`synthesizer`] | Prompting and citation grounding |
//! | [`pipeline`] | Ingestion and query orchestration |
//! | [`feed`] | Scraper record reader |
//! | [`ingest`], [`search`], [`health`], [`reindex`], [`stats`] | CLI commands |
//!
//! Runtime-independent logic (models, normalizer, chunker, ranking,
//! prompts, in-memory backends) lives in the `lexrag-core` crate.

pub mod config;
pub mod db;
pub mod embedder;
pub mod embedding;
pub mod feed;
pub mod generation;
pub mod health;
pub mod http;
pub mod ingest;
pub mod migrate;
pub mod pipeline;
pub mod reindex;
pub mod retriever;
pub mod retry;
pub mod search;
pub mod sqlite_store;
pub mod stats;
pub mod synthesizer;

pub use lexrag_core::{models, RagError};
