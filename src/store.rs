//! Persistent index operations.
//!
//! The store owns every durable row: documents, headings, links, tags,
//! concepts, chunks, embeddings, and the query cache. The ingest worker is
//! the sole writer of document state; the retriever is the sole writer of
//! the query cache (which every mutation here flushes, inside the same
//! transaction, so cached results can never outlive the rows they refer to).

use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::config::Config;
use crate::embedding::{self, Embedder};
use crate::error::{KeeperError, Result};
use crate::models::{
    DocumentDetail, DocumentRecord, EmbeddingCoverage, HeadingDetail, LinkDetail, ParsedDocument,
};

/// Current UTC time as fixed-width RFC 3339 (microsecond precision, `Z`
/// suffix), so stored timestamps compare correctly as strings.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Concatenated text a document's embedding is computed over.
fn embedding_source(parsed: &ParsedDocument) -> String {
    [
        parsed.title.as_str(),
        parsed.summary.as_str(),
        parsed.body.as_str(),
        &parsed.tags.join(" "),
        &parsed.concepts.join(" "),
        parsed.category.as_deref().unwrap_or(""),
    ]
    .join(" ")
}

/// Insert or update a document and all derived rows in one transaction.
///
/// If the content hash is unchanged only `updated_at` is touched (and stale
/// embeddings regenerated when the backend changed since the last ingest).
/// Otherwise headings, links, tags, concepts, and chunks are replaced and
/// document plus chunk embeddings recomputed. Both paths flush the query
/// cache. Returns the document id.
pub async fn upsert_document(
    pool: &SqlitePool,
    config: &Config,
    path: &Path,
    parsed: &ParsedDocument,
) -> Result<i64> {
    let embedder = embedding::create_embedder(&config.embeddings)?;
    let now = now_iso();
    let path_str = path.to_string_lossy().to_string();

    let existing: Option<(i64, Option<String>)> =
        sqlx::query_as("SELECT id, content_hash FROM documents WHERE path = ?")
            .bind(&path_str)
            .fetch_optional(pool)
            .await?;

    if let Some((id, Some(hash))) = &existing {
        if *hash == parsed.content_hash {
            touch_unchanged(pool, config, embedder.as_ref(), *id, &now).await?;
            return Ok(*id);
        }
    }

    // Embed outside the transaction: the document vector plus one vector per
    // chunk, in a single batch.
    let mut texts: Vec<String> = Vec::with_capacity(parsed.chunks.len() + 1);
    texts.push(embedding_source(parsed));
    texts.extend(parsed.chunks.iter().map(|c| c.content.clone()));
    let mut vectors = embedding::embed_texts(embedder.as_ref(), &config.embeddings, &texts).await?;
    let doc_vector = vectors.remove(0);
    let chunk_vectors = vectors;

    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO documents (path, title, summary, category, content, content_hash, token_estimate, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(path) DO UPDATE SET
            title = excluded.title,
            summary = excluded.summary,
            category = excluded.category,
            content = excluded.content,
            content_hash = excluded.content_hash,
            token_estimate = excluded.token_estimate,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&path_str)
    .bind(&parsed.title)
    .bind(&parsed.summary)
    .bind(&parsed.category)
    .bind(&parsed.body)
    .bind(&parsed.content_hash)
    .bind(parsed.token_estimate)
    .bind(&now)
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    let document_id: i64 = sqlx::query_scalar("SELECT id FROM documents WHERE path = ?")
        .bind(&path_str)
        .fetch_one(&mut *tx)
        .await?;

    // Derived rows are destroyed and recreated on every content change.
    // Chunk deletion cascades to chunk_embeddings.
    sqlx::query("DELETE FROM headings WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM links WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM document_tags WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM document_concepts WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query(
        "DELETE FROM chunk_embeddings WHERE chunk_id IN (SELECT id FROM document_chunks WHERE document_id = ?)",
    )
    .bind(document_id)
    .execute(&mut *tx)
    .await?;
    sqlx::query("DELETE FROM document_chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for heading in &parsed.headings {
        sqlx::query(
            "INSERT INTO headings (document_id, ordinal, level, heading_text, anchor) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(document_id)
        .bind(heading.ordinal)
        .bind(heading.level as i64)
        .bind(&heading.text)
        .bind(&heading.anchor)
        .execute(&mut *tx)
        .await?;
    }

    for link in &parsed.links {
        sqlx::query("INSERT INTO links (document_id, target, is_external) VALUES (?, ?, ?)")
            .bind(document_id)
            .bind(&link.target)
            .bind(link.is_external as i64)
            .execute(&mut *tx)
            .await?;
    }

    for tag in &parsed.tags {
        let tag_id = get_or_create_named(&mut tx, "tags", &tag.to_lowercase()).await?;
        sqlx::query("INSERT OR IGNORE INTO document_tags (document_id, tag_id) VALUES (?, ?)")
            .bind(document_id)
            .bind(tag_id)
            .execute(&mut *tx)
            .await?;
    }

    for concept in &parsed.concepts {
        let concept_id = get_or_create_named(&mut tx, "concepts", &concept.to_lowercase()).await?;
        sqlx::query(
            "INSERT OR IGNORE INTO document_concepts (document_id, concept_id, score) VALUES (?, ?, 1.0)",
        )
        .bind(document_id)
        .bind(concept_id)
        .execute(&mut *tx)
        .await?;
    }

    for (chunk, vector) in parsed.chunks.iter().zip(chunk_vectors.iter()) {
        let chunk_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO document_chunks (document_id, ordinal, heading_path, content, token_count)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(document_id)
        .bind(chunk.ordinal)
        .bind(&chunk.heading_path)
        .bind(&chunk.content)
        .bind(chunk.token_count)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO chunk_embeddings (chunk_id, document_id, vector, dimension, backend, generated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(chunk_id)
        .bind(document_id)
        .bind(serde_json::to_string(vector)?)
        .bind(embedder.dimension() as i64)
        .bind(embedder.backend_id())
        .bind(&now)
        .execute(&mut *tx)
        .await?;
    }

    sqlx::query(
        r#"
        INSERT INTO embeddings (document_id, vector, dimension, backend, generated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(document_id) DO UPDATE SET
            vector = excluded.vector,
            dimension = excluded.dimension,
            backend = excluded.backend,
            generated_at = excluded.generated_at
        "#,
    )
    .bind(document_id)
    .bind(serde_json::to_string(&doc_vector)?)
    .bind(embedder.dimension() as i64)
    .bind(embedder.backend_id())
    .bind(&now)
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM query_cache")
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(document_id)
}

/// Unchanged-hash path: bump `updated_at`, flush the cache, and regenerate
/// embeddings only if the stored backend no longer matches the active one.
async fn touch_unchanged(
    pool: &SqlitePool,
    config: &Config,
    embedder: &dyn Embedder,
    document_id: i64,
    now: &str,
) -> Result<()> {
    let stored_backend: Option<String> =
        sqlx::query_scalar("SELECT backend FROM embeddings WHERE document_id = ?")
            .bind(document_id)
            .fetch_optional(pool)
            .await?;
    let stale = stored_backend.as_deref() != Some(embedder.backend_id());

    if stale {
        regenerate_document_embeddings(pool, config, embedder, document_id, now).await?;
    }

    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE documents SET updated_at = ? WHERE id = ?")
        .bind(now)
        .bind(document_id)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM query_cache")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}

/// Recompute the document vector and every chunk vector for one document.
pub async fn regenerate_document_embeddings(
    pool: &SqlitePool,
    config: &Config,
    embedder: &dyn Embedder,
    document_id: i64,
    now: &str,
) -> Result<()> {
    let row = sqlx::query(
        "SELECT title, summary, category, content FROM documents WHERE id = ?",
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| KeeperError::NotFound(format!("document id {document_id}")))?;

    let source = [
        row.get::<Option<String>, _>("title").unwrap_or_default(),
        row.get::<Option<String>, _>("summary").unwrap_or_default(),
        row.get::<Option<String>, _>("category").unwrap_or_default(),
        row.get::<Option<String>, _>("content").unwrap_or_default(),
    ]
    .join(" ");

    let chunks: Vec<(i64, String)> =
        sqlx::query_as("SELECT id, content FROM document_chunks WHERE document_id = ? ORDER BY ordinal ASC")
            .bind(document_id)
            .fetch_all(pool)
            .await?;

    let mut texts = vec![source];
    texts.extend(chunks.iter().map(|(_, content)| content.clone()));
    let mut vectors = embedding::embed_texts(embedder, &config.embeddings, &texts).await?;
    let doc_vector = vectors.remove(0);

    let mut tx = pool.begin().await?;
    sqlx::query(
        r#"
        INSERT INTO embeddings (document_id, vector, dimension, backend, generated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(document_id) DO UPDATE SET
            vector = excluded.vector,
            dimension = excluded.dimension,
            backend = excluded.backend,
            generated_at = excluded.generated_at
        "#,
    )
    .bind(document_id)
    .bind(serde_json::to_string(&doc_vector)?)
    .bind(embedder.dimension() as i64)
    .bind(embedder.backend_id())
    .bind(now)
    .execute(&mut *tx)
    .await?;

    for ((chunk_id, _), vector) in chunks.iter().zip(vectors.iter()) {
        sqlx::query(
            r#"
            INSERT INTO chunk_embeddings (chunk_id, document_id, vector, dimension, backend, generated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                vector = excluded.vector,
                dimension = excluded.dimension,
                backend = excluded.backend,
                generated_at = excluded.generated_at
            "#,
        )
        .bind(chunk_id)
        .bind(document_id)
        .bind(serde_json::to_string(vector)?)
        .bind(embedder.dimension() as i64)
        .bind(embedder.backend_id())
        .bind(now)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn get_or_create_named(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    table: &str,
    name: &str,
) -> Result<i64> {
    // Table names cannot be bound; restrict to the two known link tables.
    let (select, insert) = match table {
        "tags" => (
            "SELECT id FROM tags WHERE name = ?",
            "INSERT INTO tags (name) VALUES (?) RETURNING id",
        ),
        "concepts" => (
            "SELECT id FROM concepts WHERE name = ?",
            "INSERT INTO concepts (name) VALUES (?) RETURNING id",
        ),
        other => {
            return Err(KeeperError::Internal(format!(
                "unknown named table: {other}"
            )))
        }
    };

    if let Some(id) = sqlx::query_scalar::<_, i64>(select)
        .bind(name)
        .fetch_optional(&mut **tx)
        .await?
    {
        return Ok(id);
    }
    let id: i64 = sqlx::query_scalar(insert)
        .bind(name)
        .fetch_one(&mut **tx)
        .await?;
    Ok(id)
}

/// Delete a document by path, cascading to all derived rows, and flush the
/// query cache. Returns whether a row existed.
pub async fn delete_by_path(pool: &SqlitePool, path: &Path) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let deleted = sqlx::query("DELETE FROM documents WHERE path = ?")
        .bind(path.to_string_lossy().to_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();
    sqlx::query("DELETE FROM query_cache")
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(deleted > 0)
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> DocumentRecord {
    DocumentRecord {
        id: row.get("id"),
        path: row.get("path"),
        title: row.get::<Option<String>, _>("title").unwrap_or_default(),
        summary: row.get::<Option<String>, _>("summary").unwrap_or_default(),
        category: row.get::<Option<String>, _>("category").unwrap_or_default(),
        token_estimate: row.get::<Option<i64>, _>("token_estimate").unwrap_or(0),
        updated_at: row.get("updated_at"),
    }
}

const RECORD_COLUMNS: &str = "id, path, title, summary, category, token_estimate, updated_at";

pub async fn list_documents(pool: &SqlitePool) -> Result<Vec<DocumentRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {RECORD_COLUMNS} FROM documents ORDER BY updated_at DESC"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(record_from_row).collect())
}

/// Load records for the given ids, preserving the input order. Ids that no
/// longer exist are skipped.
pub async fn records_by_ids(pool: &SqlitePool, ids: &[i64]) -> Result<Vec<DocumentRecord>> {
    let mut records = Vec::with_capacity(ids.len());
    for id in ids {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM documents WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(pool)
        .await?;
        if let Some(row) = row {
            records.push(record_from_row(&row));
        }
    }
    Ok(records)
}

pub async fn find_by_concept(
    pool: &SqlitePool,
    concept: &str,
    limit: i64,
) -> Result<Vec<DocumentRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT d.id, d.path, d.title, d.summary, d.category, d.token_estimate, d.updated_at
        FROM documents d
        JOIN document_concepts dc ON dc.document_id = d.id
        JOIN concepts c ON c.id = dc.concept_id
        WHERE c.name = ?
        ORDER BY d.updated_at DESC
        LIMIT ?
        "#,
    )
    .bind(concept.trim().to_lowercase())
    .bind(limit.max(1))
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(record_from_row).collect())
}

/// Options for content assembly in [`get_document`].
#[derive(Debug, Clone, Default)]
pub struct ContentOptions {
    pub include_content: bool,
    pub max_tokens: Option<i64>,
    pub section: Option<String>,
}

/// Fetch a full document view. Content is assembled from chunks: the
/// `section` substring filters on `heading_path` (case-insensitive), then
/// `max_tokens` budgets the total, preferring whole chunks and splitting the
/// last one at a word boundary only when necessary.
pub async fn get_document(
    pool: &SqlitePool,
    document_id: i64,
    options: &ContentOptions,
) -> Result<DocumentDetail> {
    let row = sqlx::query(&format!(
        "SELECT {RECORD_COLUMNS} FROM documents WHERE id = ?"
    ))
    .bind(document_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| KeeperError::NotFound(format!("document id {document_id}")))?;
    let record = record_from_row(&row);

    let heading_rows = sqlx::query(
        "SELECT level, heading_text, anchor, ordinal FROM headings WHERE document_id = ? ORDER BY ordinal ASC",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;
    let headings = heading_rows
        .iter()
        .map(|r| HeadingDetail {
            level: r.get("level"),
            text: r.get("heading_text"),
            anchor: r.get::<Option<String>, _>("anchor").unwrap_or_default(),
            ordinal: r.get("ordinal"),
        })
        .collect();

    let link_rows = sqlx::query(
        "SELECT target, is_external, status FROM links WHERE document_id = ? ORDER BY id ASC",
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;
    let links = link_rows
        .iter()
        .map(|r| LinkDetail {
            target: r.get("target"),
            is_external: r.get::<i64, _>("is_external") != 0,
            status: r
                .get::<Option<String>, _>("status")
                .unwrap_or_else(|| "unknown".to_string()),
        })
        .collect();

    let tags: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT t.name FROM tags t
        JOIN document_tags dt ON dt.tag_id = t.id
        WHERE dt.document_id = ?
        ORDER BY t.name ASC
        "#,
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    let concepts: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT c.name FROM concepts c
        JOIN document_concepts dc ON dc.concept_id = c.id
        WHERE dc.document_id = ?
        ORDER BY c.name ASC
        "#,
    )
    .bind(document_id)
    .fetch_all(pool)
    .await?;

    let content = select_content(pool, document_id, options).await?;

    Ok(DocumentDetail {
        record,
        headings,
        links,
        tags,
        concepts,
        content,
    })
}

/// Assemble budgeted content for a document from its chunks.
pub async fn select_content(
    pool: &SqlitePool,
    document_id: i64,
    options: &ContentOptions,
) -> Result<String> {
    if !options.include_content {
        return Ok(String::new());
    }

    let rows: Vec<(String, i64)> = if let Some(section) = &options.section {
        sqlx::query_as(
            r#"
            SELECT content, token_count FROM document_chunks
            WHERE document_id = ? AND LOWER(heading_path) LIKE ?
            ORDER BY ordinal ASC
            "#,
        )
        .bind(document_id)
        .bind(format!("%{}%", section.to_lowercase()))
        .fetch_all(pool)
        .await?
    } else {
        sqlx::query_as(
            "SELECT content, token_count FROM document_chunks WHERE document_id = ? ORDER BY ordinal ASC",
        )
        .bind(document_id)
        .fetch_all(pool)
        .await?
    };

    let budget = options.max_tokens.filter(|t| *t > 0);
    let mut selected: Vec<String> = Vec::new();
    let mut used: i64 = 0;
    for (content, token_count) in rows {
        if let Some(budget) = budget {
            if used + token_count > budget {
                let remaining = budget - used;
                if remaining > 0 {
                    let partial: Vec<&str> = content
                        .split_whitespace()
                        .take(remaining as usize)
                        .collect();
                    selected.push(partial.join(" "));
                }
                break;
            }
        }
        used += token_count;
        selected.push(content);
    }

    Ok(selected.join("\n\n"))
}

// ============ Query cache ============

/// Look up a cached result set. Expired entries (older than `ttl_seconds`)
/// are evicted on access. A hit bumps `hit_count` and `last_accessed`.
pub async fn fetch_cache(
    pool: &SqlitePool,
    query_hash: &str,
    ttl_seconds: u64,
) -> Result<Option<Vec<i64>>> {
    let row = sqlx::query(
        "SELECT document_ids, created_at FROM query_cache WHERE query_hash = ?",
    )
    .bind(query_hash)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else { return Ok(None) };

    let created_at: String = row.get("created_at");
    let expired = chrono::DateTime::parse_from_rfc3339(&created_at)
        .map(|created| {
            let age = Utc::now().signed_duration_since(created.with_timezone(&Utc));
            age.num_seconds() > ttl_seconds as i64
        })
        .unwrap_or(true);

    if expired {
        sqlx::query("DELETE FROM query_cache WHERE query_hash = ?")
            .bind(query_hash)
            .execute(pool)
            .await?;
        return Ok(None);
    }

    sqlx::query(
        "UPDATE query_cache SET hit_count = hit_count + 1, last_accessed = ? WHERE query_hash = ?",
    )
    .bind(now_iso())
    .bind(query_hash)
    .execute(pool)
    .await?;

    let ids_json: String = row.get("document_ids");
    let ids: Vec<i64> = serde_json::from_str(&ids_json)?;
    Ok(Some(ids))
}

pub async fn store_cache(
    pool: &SqlitePool,
    query_hash: &str,
    query_text: &str,
    document_ids: &[i64],
) -> Result<()> {
    let now = now_iso();
    sqlx::query(
        r#"
        INSERT INTO query_cache (query_hash, query_text, document_ids, created_at, last_accessed, hit_count)
        VALUES (?, ?, ?, ?, ?, 0)
        ON CONFLICT(query_hash) DO UPDATE SET
            query_text = excluded.query_text,
            document_ids = excluded.document_ids,
            created_at = excluded.created_at,
            last_accessed = excluded.last_accessed
        "#,
    )
    .bind(query_hash)
    .bind(query_text)
    .bind(serde_json::to_string(document_ids)?)
    .bind(&now)
    .bind(&now)
    .execute(pool)
    .await?;
    Ok(())
}

// ============ Coverage and health ============

/// Embedding coverage across documents and chunks, including staleness
/// against the active backend.
pub async fn embedding_coverage(
    pool: &SqlitePool,
    active_backend: &str,
) -> Result<EmbeddingCoverage> {
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;
    let embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
        .fetch_one(pool)
        .await?;
    let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks")
        .fetch_one(pool)
        .await?;
    let chunk_embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_embeddings")
        .fetch_one(pool)
        .await?;
    let stale_docs: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM embeddings WHERE backend != ?")
            .bind(active_backend)
            .fetch_one(pool)
            .await?;
    let stale_chunks: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunk_embeddings WHERE backend != ?")
            .bind(active_backend)
            .fetch_one(pool)
            .await?;

    Ok(EmbeddingCoverage {
        documents,
        embedded,
        missing: (documents - embedded).max(0),
        chunks,
        chunk_embedded,
        chunk_missing: (chunks - chunk_embedded).max(0),
        backend: active_backend.to_string(),
        stale: stale_docs + stale_chunks,
    })
}

/// A document row with everything the retriever needs to score it.
pub struct ScoringRow {
    pub record: DocumentRecord,
    pub content: String,
    pub vector: Vec<f32>,
    pub chunk_vectors: Vec<Vec<f32>>,
    pub concepts: Vec<String>,
}

fn parse_vector(raw: Option<String>) -> Vec<f32> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

/// Load scoring rows for the given candidate ids, or for every document when
/// `candidate_ids` is `None`.
pub async fn load_scoring_rows(
    pool: &SqlitePool,
    candidate_ids: Option<&[i64]>,
) -> Result<Vec<ScoringRow>> {
    let rows = sqlx::query(&format!(
        r#"
        SELECT {RECORD_COLUMNS}, d.content, e.vector AS doc_vector
        FROM documents d
        LEFT JOIN embeddings e ON e.document_id = d.id
        "#
    ))
    .fetch_all(pool)
    .await?;

    let mut out = Vec::new();
    for row in rows {
        let record = record_from_row(&row);
        if let Some(ids) = candidate_ids {
            if !ids.contains(&record.id) {
                continue;
            }
        }

        let chunk_vectors: Vec<String> = sqlx::query_scalar(
            "SELECT vector FROM chunk_embeddings WHERE document_id = ? ORDER BY chunk_id ASC",
        )
        .bind(record.id)
        .fetch_all(pool)
        .await?;

        let concepts: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT c.name FROM concepts c
            JOIN document_concepts dc ON dc.concept_id = c.id
            WHERE dc.document_id = ?
            "#,
        )
        .bind(record.id)
        .fetch_all(pool)
        .await?;

        out.push(ScoringRow {
            content: row.get::<Option<String>, _>("content").unwrap_or_default(),
            vector: parse_vector(row.get::<Option<String>, _>("doc_vector")),
            chunk_vectors: chunk_vectors
                .into_iter()
                .map(|s| parse_vector(Some(s)))
                .collect(),
            concepts,
            record,
        });
    }
    Ok(out)
}

/// All `(document_id, vector)` pairs, for building the vector index.
pub async fn all_document_vectors(pool: &SqlitePool) -> Result<Vec<(i64, Vec<f32>)>> {
    let rows: Vec<(i64, String)> =
        sqlx::query_as("SELECT document_id, vector FROM embeddings ORDER BY document_id ASC")
            .fetch_all(pool)
            .await?;
    Ok(rows
        .into_iter()
        .map(|(id, raw)| (id, parse_vector(Some(raw))))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate, parser};
    use tempfile::TempDir;

    async fn test_pool() -> (TempDir, SqlitePool) {
        let dir = TempDir::new().unwrap();
        let pool = db::connect(&dir.path().join("index.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (dir, pool)
    }

    fn sample() -> ParsedDocument {
        parser::parse(
            "---\ntitle: Sample\ntags: infra\nconcepts: kubernetes\n---\n# Sample\n\n## Prerequisites\n\nNeed a cluster.\n\n## Steps\n\nApply the manifest.\n\nSee [other](./other.md).",
        )
    }

    #[tokio::test]
    async fn upsert_creates_all_derived_rows() {
        let (_dir, pool) = test_pool().await;
        let config = Config::default();
        let id = upsert_document(&pool, &config, Path::new("/docs/sample.md"), &sample())
            .await
            .unwrap();
        assert!(id > 0);

        let headings: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM headings")
            .fetch_one(&pool)
            .await
            .unwrap();
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_chunks")
            .fetch_one(&pool)
            .await
            .unwrap();
        let chunk_vecs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_embeddings")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(headings, 3);
        assert!(chunks > 0);
        assert_eq!(chunks, chunk_vecs);

        let coverage = embedding_coverage(&pool, "hash-v1").await.unwrap();
        assert_eq!(coverage.documents, 1);
        assert_eq!(coverage.embedded, 1);
        assert_eq!(coverage.stale, 0);
    }

    #[tokio::test]
    async fn unchanged_reingest_touches_updated_at_only() {
        let (_dir, pool) = test_pool().await;
        let config = Config::default();
        let path = Path::new("/docs/sample.md");
        let parsed = sample();

        let id1 = upsert_document(&pool, &config, path, &parsed).await.unwrap();
        let first_updated: String =
            sqlx::query_scalar("SELECT updated_at FROM documents WHERE id = ?")
                .bind(id1)
                .fetch_one(&pool)
                .await
                .unwrap();
        let chunk_generated: String =
            sqlx::query_scalar("SELECT generated_at FROM chunk_embeddings LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let id2 = upsert_document(&pool, &config, path, &parsed).await.unwrap();
        assert_eq!(id1, id2);

        let docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(docs, 1);

        let second_updated: String =
            sqlx::query_scalar("SELECT updated_at FROM documents WHERE id = ?")
                .bind(id1)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_ne!(first_updated, second_updated);

        // Embeddings were not regenerated for an unchanged document.
        let chunk_generated_after: String =
            sqlx::query_scalar("SELECT generated_at FROM chunk_embeddings LIMIT 1")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(chunk_generated, chunk_generated_after);
    }

    #[tokio::test]
    async fn delete_cascades_everywhere() {
        let (_dir, pool) = test_pool().await;
        let config = Config::default();
        let path = Path::new("/docs/sample.md");
        upsert_document(&pool, &config, path, &sample()).await.unwrap();

        assert!(delete_by_path(&pool, path).await.unwrap());
        assert!(!delete_by_path(&pool, path).await.unwrap());

        for table in [
            "documents",
            "headings",
            "links",
            "document_tags",
            "document_concepts",
            "document_chunks",
            "embeddings",
            "chunk_embeddings",
            "query_cache",
        ] {
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&pool)
                .await
                .unwrap();
            assert_eq!(count, 0, "{table} not empty after delete");
        }
    }

    #[tokio::test]
    async fn upsert_flushes_query_cache() {
        let (_dir, pool) = test_pool().await;
        let config = Config::default();
        store_cache(&pool, "abc", "query", &[1, 2]).await.unwrap();

        upsert_document(&pool, &config, Path::new("/docs/a.md"), &sample())
            .await
            .unwrap();
        let cached: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM query_cache")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(cached, 0);
    }

    #[tokio::test]
    async fn cache_hit_increments_and_expiry_evicts() {
        let (_dir, pool) = test_pool().await;
        store_cache(&pool, "h1", "q", &[5, 6]).await.unwrap();

        let hit = fetch_cache(&pool, "h1", 3600).await.unwrap();
        assert_eq!(hit, Some(vec![5, 6]));
        let hits: i64 = sqlx::query_scalar("SELECT hit_count FROM query_cache WHERE query_hash = 'h1'")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(hits, 1);

        // Age the entry beyond the TTL, then the next access evicts it.
        let old = (Utc::now() - chrono::Duration::seconds(7200)).to_rfc3339();
        sqlx::query("UPDATE query_cache SET created_at = ? WHERE query_hash = 'h1'")
            .bind(&old)
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(fetch_cache(&pool, "h1", 3600).await.unwrap(), None);
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM query_cache")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn section_filter_selects_matching_chunks() {
        let (_dir, pool) = test_pool().await;
        let config = Config::default();
        let id = upsert_document(&pool, &config, Path::new("/docs/sample.md"), &sample())
            .await
            .unwrap();

        let detail = get_document(
            &pool,
            id,
            &ContentOptions {
                include_content: true,
                max_tokens: None,
                section: Some("steps".to_string()),
            },
        )
        .await
        .unwrap();
        assert!(detail.content.contains("Apply the manifest."));
        assert!(!detail.content.contains("Need a cluster."));
    }

    #[tokio::test]
    async fn max_tokens_budget_prefers_whole_chunks() {
        let (_dir, pool) = test_pool().await;
        let config = Config::default();
        let parsed = parser::parse("first chunk here\n\nsecond chunk words\n\nthird chunk tail");
        let id = upsert_document(&pool, &config, Path::new("/docs/b.md"), &parsed)
            .await
            .unwrap();

        let detail = get_document(
            &pool,
            id,
            &ContentOptions {
                include_content: true,
                max_tokens: Some(6),
                section: None,
            },
        )
        .await
        .unwrap();
        // Two whole chunks of 3 tokens each fit exactly; the third is cut.
        assert!(detail.content.contains("first chunk here"));
        assert!(detail.content.contains("second chunk words"));
        assert!(!detail.content.contains("third"));
    }

    #[tokio::test]
    async fn concept_lookup_is_case_insensitive() {
        let (_dir, pool) = test_pool().await;
        let config = Config::default();
        upsert_document(&pool, &config, Path::new("/docs/sample.md"), &sample())
            .await
            .unwrap();

        let found = find_by_concept(&pool, "Kubernetes", 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].title, "Sample");
    }

    #[tokio::test]
    async fn get_document_missing_id_is_not_found() {
        let (_dir, pool) = test_pool().await;
        let err = get_document(&pool, 999, &ContentOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }
}
