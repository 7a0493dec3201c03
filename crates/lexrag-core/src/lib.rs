//! # lexrag Core
//!
//! Runtime-free logic for lexrag: the error taxonomy, data models, text
//! normalization, chunking, the embedding and language-model traits, the
//! metadata-store and vector-index abstractions, ranking, and grounded
//! prompt construction.
//!
//! This crate contains no tokio, sqlx, HTTP clients or filesystem I/O. The
//! `lexrag` application crate supplies concrete providers and storage and
//! drives everything through [`store::DocumentStore`],
//! [`store::VectorIndex`], [`embedding::EmbeddingProvider`] and
//! [`generation::LanguageModel`].

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod generation;
pub mod models;
pub mod normalize;
pub mod prompt;
pub mod search;
pub mod store;

pub use error::{RagError, Result};
