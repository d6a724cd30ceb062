//! Database schema creation and migration.
//!
//! All operations are idempotent (`CREATE TABLE IF NOT EXISTS` plus additive
//! column checks), so `mdkeeper init-db` can run any number of times without
//! touching existing data.
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `documents` | One row per indexed file: metadata, body, content hash |
//! | `headings` | Ordered headings per document with slug anchors |
//! | `links` | Link occurrences with validation status |
//! | `tags` / `document_tags` | Frontmatter tags, many-to-many |
//! | `concepts` / `document_concepts` | Declared or extracted concepts |
//! | `document_chunks` | Paragraph-level chunks with heading paths |
//! | `embeddings` | Full-document vectors (JSON float arrays) |
//! | `chunk_embeddings` | Per-chunk vectors |
//! | `query_cache` | Hashed query → ordered document id list |
//! | `events` | Durable file-event queue for crash-safe replay |
//! | `file_mtimes` | Polling watcher snapshot persisted across restarts |

use anyhow::Result;
use sqlx::SqlitePool;

const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL UNIQUE,
        title TEXT,
        summary TEXT,
        category TEXT,
        content TEXT,
        content_hash TEXT,
        token_estimate INTEGER DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS headings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        document_id INTEGER NOT NULL,
        ordinal INTEGER NOT NULL,
        level INTEGER NOT NULL,
        heading_text TEXT NOT NULL,
        anchor TEXT,
        FOREIGN KEY(document_id) REFERENCES documents(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS links (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        document_id INTEGER NOT NULL,
        target TEXT NOT NULL,
        is_external INTEGER NOT NULL,
        status TEXT DEFAULT 'unknown',
        checked_at TEXT,
        FOREIGN KEY(document_id) REFERENCES documents(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_tags (
        document_id INTEGER NOT NULL,
        tag_id INTEGER NOT NULL,
        PRIMARY KEY(document_id, tag_id),
        FOREIGN KEY(document_id) REFERENCES documents(id) ON DELETE CASCADE,
        FOREIGN KEY(tag_id) REFERENCES tags(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS concepts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_concepts (
        document_id INTEGER NOT NULL,
        concept_id INTEGER NOT NULL,
        score REAL DEFAULT 1.0,
        PRIMARY KEY(document_id, concept_id),
        FOREIGN KEY(document_id) REFERENCES documents(id) ON DELETE CASCADE,
        FOREIGN KEY(concept_id) REFERENCES concepts(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS document_chunks (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        document_id INTEGER NOT NULL,
        ordinal INTEGER NOT NULL,
        heading_path TEXT,
        content TEXT NOT NULL,
        token_count INTEGER NOT NULL,
        FOREIGN KEY(document_id) REFERENCES documents(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embeddings (
        document_id INTEGER PRIMARY KEY,
        vector TEXT NOT NULL,
        dimension INTEGER NOT NULL,
        backend TEXT NOT NULL,
        generated_at TEXT NOT NULL,
        FOREIGN KEY(document_id) REFERENCES documents(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunk_embeddings (
        chunk_id INTEGER PRIMARY KEY,
        document_id INTEGER NOT NULL,
        vector TEXT NOT NULL,
        dimension INTEGER NOT NULL,
        backend TEXT NOT NULL,
        generated_at TEXT NOT NULL,
        FOREIGN KEY(chunk_id) REFERENCES document_chunks(id) ON DELETE CASCADE,
        FOREIGN KEY(document_id) REFERENCES documents(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS query_cache (
        query_hash TEXT PRIMARY KEY,
        query_text TEXT NOT NULL,
        document_ids TEXT NOT NULL,
        created_at TEXT NOT NULL,
        last_accessed TEXT NOT NULL,
        hit_count INTEGER DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        path TEXT NOT NULL,
        kind TEXT NOT NULL,
        new_path TEXT,
        enqueued_at TEXT NOT NULL,
        next_attempt_at TEXT,
        attempt_count INTEGER DEFAULT 0,
        status TEXT DEFAULT 'queued',
        last_error TEXT,
        processed_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS file_mtimes (
        path TEXT PRIMARY KEY,
        mtime INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_documents_path ON documents(path)",
    "CREATE INDEX IF NOT EXISTS idx_documents_category ON documents(category)",
    "CREATE INDEX IF NOT EXISTS idx_headings_document_id ON headings(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_links_document_id ON links(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON document_chunks(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_events_status_path ON events(status, path)",
];

/// Create all tables and indexes. Safe to call repeatedly; migrations are
/// strictly additive and never drop or rewrite existing rows.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA_STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }

    // Additive column migrations for databases created by earlier versions.
    let columns: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info('documents')")
        .fetch_all(pool)
        .await?;
    if !columns.iter().any(|c| c == "category") {
        sqlx::query("ALTER TABLE documents ADD COLUMN category TEXT")
            .execute(pool)
            .await?;
    }
    if !columns.iter().any(|c| c == "content") {
        sqlx::query("ALTER TABLE documents ADD COLUMN content TEXT")
            .execute(pool)
            .await?;
    }

    Ok(())
}
