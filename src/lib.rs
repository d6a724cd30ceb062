//! # MarkdownKeeper
//!
//! **A background indexing and hybrid retrieval service for Markdown trees.**
//!
//! MarkdownKeeper keeps a queryable SQLite representation of a tree of
//! Markdown files continuously synchronized with the filesystem and answers
//! hybrid semantic/lexical queries from LLM agents over a JSON-RPC HTTP API
//! and a CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌─────────────┐   ┌──────────┐
//! │   Watcher   │──▶│ Event Queue │──▶│   Ingest    │──▶│  SQLite   │
//! │ notify/poll │   │  (durable)  │   │ parse+embed │   │  index    │
//! └─────────────┘   └─────────────┘   └─────────────┘   └────┬─────┘
//!                                                            │
//!                                        ┌───────────────────┤
//!                                        ▼                   ▼
//!                                   ┌──────────┐       ┌──────────┐
//!                                   │   CLI    │       │ JSON-RPC │
//!                                   │(mdkeeper)│       │   HTTP   │
//!                                   └──────────┘       └──────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. A **watcher backend** ([`watcher`]) observes the configured roots via
//!    OS notifications or polling and appends file events to the durable
//!    **event queue** ([`queue`]).
//! 2. The single-threaded queue consumer coalesces per-path bursts, then
//!    hands each effective event to the **ingestor** ([`ingest`]).
//! 3. The **parser** ([`parser`]) turns raw Markdown into a structured
//!    [`models::ParsedDocument`]: frontmatter, headings, links, chunks,
//!    concepts, token estimate, content hash.
//! 4. The **store** ([`store`]) transactionally upserts the document, its
//!    structure, and fresh embeddings, and flushes the query cache.
//! 5. The **retriever** ([`search`]) serves hybrid queries combining
//!    document vectors, chunk vectors, lexical overlap, concept matches,
//!    and recency, with TTL-cached results and token-budgeted delivery.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with defaults |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy with stable kind tags |
//! | [`db`] / [`migrate`] | SQLite pool (WAL, FK) and idempotent schema |
//! | [`parser`] | Pure Markdown → `ParsedDocument` |
//! | [`store`] | Transactional index mutators and readers |
//! | [`queue`] | Durable event queue: coalesce, debounce, retry, replay |
//! | [`ingest`] | File event processing against the store |
//! | [`watcher`] | Notify and polling producers, `auto` selection |
//! | [`embedding`] | Model and hash embedding backends |
//! | [`vector_index`] | Brute-force vector index with sidecar persistence |
//! | [`search`] | Hybrid retrieval with query cache |
//! | [`get`] | Document retrieval with section and token budgeting |
//! | [`links`] | Internal/external link validation with rate limiting |
//! | [`embed_cmd`] | Embedding regeneration and coverage commands |
//! | [`eval`] | Retrieval precision evaluation and latency benchmark |
//! | [`indexer`] | Static Markdown index file generation |
//! | [`metadata`] | Frontmatter schema enforcement and auto-fill |
//! | [`stats`] | System statistics and health report rendering |
//! | [`server`] | JSON-RPC 2.0 HTTP API (Axum) |

pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod error;
pub mod eval;
pub mod get;
pub mod indexer;
pub mod ingest;
pub mod links;
pub mod metadata;
pub mod migrate;
pub mod models;
pub mod parser;
pub mod queue;
pub mod search;
pub mod server;
pub mod stats;
pub mod store;
pub mod vector_index;
pub mod watcher;
