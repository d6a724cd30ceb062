//! Core data models for the indexing and retrieval pipeline.
//!
//! The data lifecycle is:
//!
//! ```text
//! Watcher → EventRecord → ingest → parse() → ParsedDocument → Store
//!                                                  ↓
//!                                          embed() → vectors
//!                                                  ↓
//!                                          search() → SearchResult
//! ```
//!
//! - A **[`ParsedDocument`]** is the pure output of the Markdown parser,
//!   before any storage.
//! - A **[`DocumentRecord`]** is the stored metadata row; [`DocumentDetail`]
//!   adds headings, links, tags, concepts, and (optionally budgeted) content.
//! - An **[`EventRecord`]** is one durable entry in the file-event queue.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// CLI output rendering mode, shared by every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// A frontmatter value. Frontmatter is dynamically typed in source files;
/// `tags` and `concepts` are normalized to `List` regardless of input shape.
#[derive(Debug, Clone, PartialEq)]
pub enum FrontmatterValue {
    Str(String),
    List(Vec<String>),
    Int(i64),
    Bool(bool),
}

impl FrontmatterValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FrontmatterValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Vec<String> {
        match self {
            FrontmatterValue::List(items) => items.clone(),
            FrontmatterValue::Str(s) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    }
}

pub type Frontmatter = BTreeMap<String, FrontmatterValue>;

/// One ATX heading, in document order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedHeading {
    /// Heading level, 1–6.
    pub level: u8,
    pub text: String,
    /// Slug anchor: lowercased, non-alphanumerics collapsed to `-`.
    pub anchor: String,
    /// Dense 0-based position within the document.
    pub ordinal: i64,
}

/// One link occurrence (inline `[text](target)` or autolink).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLink {
    pub target: String,
    /// True iff the target carries a URI scheme (`^[a-z][a-z0-9+.-]*://`).
    pub is_external: bool,
}

/// A paragraph-bounded chunk of at most 120 words, carrying the slash-joined
/// path of its enclosing headings.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedChunk {
    pub ordinal: i64,
    pub heading_path: String,
    pub content: String,
    /// Whitespace-separated word count of `content`.
    pub token_count: i64,
}

/// Structured output of [`crate::parser::parse`]. Pure data: parsing the same
/// text twice yields identical values.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub title: String,
    pub summary: String,
    pub category: Option<String>,
    pub body: String,
    pub token_estimate: i64,
    /// Hex SHA-256 over the full raw input text.
    pub content_hash: String,
    pub frontmatter: Frontmatter,
    pub tags: Vec<String>,
    pub concepts: Vec<String>,
    pub headings: Vec<ParsedHeading>,
    pub links: Vec<ParsedLink>,
    pub chunks: Vec<ParsedChunk>,
}

/// Stored document metadata, as returned by list and search operations.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentRecord {
    pub id: i64,
    pub path: String,
    pub title: String,
    pub summary: String,
    pub category: String,
    pub token_estimate: i64,
    pub updated_at: String,
}

/// Heading row within a [`DocumentDetail`].
#[derive(Debug, Clone, Serialize)]
pub struct HeadingDetail {
    pub level: i64,
    pub text: String,
    pub anchor: String,
    pub ordinal: i64,
}

/// Link row within a [`DocumentDetail`].
#[derive(Debug, Clone, Serialize)]
pub struct LinkDetail {
    pub target: String,
    pub is_external: bool,
    pub status: String,
}

/// Full document view: metadata plus structure and optional budgeted content.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentDetail {
    #[serde(flatten)]
    pub record: DocumentRecord,
    pub headings: Vec<HeadingDetail>,
    pub links: Vec<LinkDetail>,
    pub tags: Vec<String>,
    pub concepts: Vec<String>,
    pub content: String,
}

/// A ranked search result: document metadata plus the hybrid score.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub record: DocumentRecord,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Kind of a file event flowing through the durable queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Create,
    Modify,
    Move,
    Delete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Modify => "modify",
            EventKind::Move => "move",
            EventKind::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<EventKind> {
        match s {
            "create" => Some(EventKind::Create),
            "modify" => Some(EventKind::Modify),
            "move" => Some(EventKind::Move),
            "delete" => Some(EventKind::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue lifecycle state of an [`EventRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Queued,
    InFlight,
    Done,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Queued => "queued",
            EventStatus::InFlight => "in_flight",
            EventStatus::Done => "done",
            EventStatus::Failed => "failed",
        }
    }
}

/// One durable entry in the file-event queue.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub id: i64,
    pub path: String,
    pub kind: EventKind,
    pub new_path: Option<String>,
    pub enqueued_at: String,
    pub attempt_count: i64,
    pub status: EventStatus,
    pub last_error: Option<String>,
    pub processed_at: Option<String>,
}

/// Aggregate queue health, surfaced by `stats` and `event_queue_status`.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queued: i64,
    pub in_flight: i64,
    pub failed: i64,
    pub done: i64,
    pub lag_seconds: f64,
}

/// Embedding coverage across documents and chunks.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingCoverage {
    pub documents: i64,
    pub embedded: i64,
    pub missing: i64,
    pub chunks: i64,
    pub chunk_embedded: i64,
    pub chunk_missing: i64,
    /// Active embedder backend id.
    pub backend: String,
    /// Stored vectors whose backend differs from the active one.
    pub stale: i64,
}
