//! # star-search
//!
//! Local search over a user's starred GitHub repositories by meaning, by
//! keyword, or by a rank fusion of both.
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────┐        ┌──────────────────────┐
//!        │  SourceProvider  │        │  EmbeddingProvider   │
//!        │ (GitHub stars)   │        │ (Ollama / OpenAI)    │
//!        └────────┬─────────┘        └──────────┬───────────┘
//!                 │ snapshot                     │ embed(text)
//!                 ▼                              │
//!        ┌──────────────────┐                    │
//!        │   Sync Engine    │◄───────────────────┤
//!        │ digest diff,     │                    │
//!        │ pending retries  │                    │
//!        └────────┬─────────┘                    │
//!                 │ upsert / delete              │
//!                 ▼                              │
//!  ┌──────────────────────────────────────┐      │
//!  │                Store                 │      │
//!  │  records (redb) ─┬─ vectors (redb)   │      │
//!  │                  └─ text (tantivy)   │      │
//!  └──────────────────┬───────────────────┘      │
//!                     │                          │
//!                     ▼                          │
//!        ┌──────────────────────────┐            │
//!        │      Search Engine       │◄───────────┘
//!        │ semantic │ keyword │ RRF │
//!        └──────────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! - [`config`] - Environment-based configuration
//! - [`error`] - Error taxonomy shared by the engines
//! - [`models`] - Records, search hits, sync summaries and request/response types
//! - [`store`] - Record store plus vector and text indexes, with crash recovery
//! - [`search::vector`] - Cosine-similarity vector index persisted in redb
//! - [`search::bm25`] - BM25 text index powered by tantivy
//! - [`search::hybrid`] - Reciprocal Rank Fusion with deterministic tie-breaking
//! - [`search::engine`] - Query validation and the three search modes
//! - [`sync`] - Incremental sync against a source snapshot
//! - [`llm`] - Embedding provider trait and HTTP implementation
//! - [`source`] - Source provider trait and GitHub starred-list client
//! - [`api`] - Axum HTTP handlers
//! - [`state`] - Shared application state

pub mod api;
pub mod config;
pub mod error;
pub mod llm;
pub mod models;
pub mod search;
pub mod source;
pub mod state;
pub mod store;
pub mod sync;

pub use error::{Error, Result};
