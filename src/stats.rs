//! System statistics and health reporting.
//!
//! `stats` summarizes index size, queue health, and embedding coverage.
//! `report` surfaces actionable problems: documents missing required
//! frontmatter fields, broken links, and permanently failed events.

use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::embedding;
use crate::error::Result;
use crate::metadata;
use crate::models::{EmbeddingCoverage, OutputFormat, QueueStatus};
use crate::queue;
use crate::store;

#[derive(Debug, Serialize)]
pub struct SystemStats {
    pub documents: i64,
    pub links: i64,
    pub queue: QueueStatus,
    pub embeddings: EmbeddingCoverage,
}

pub async fn system_stats(pool: &SqlitePool, config: &Config) -> Result<SystemStats> {
    let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
        .fetch_one(pool)
        .await?;
    let links: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM links")
        .fetch_one(pool)
        .await?;
    let queue = queue::queue_status(pool).await?;
    let embedder = embedding::create_embedder(&config.embeddings)?;
    let embeddings = store::embedding_coverage(pool, embedder.backend_id()).await?;

    Ok(SystemStats {
        documents,
        links,
        queue,
        embeddings,
    })
}

pub async fn run_stats(pool: &SqlitePool, config: &Config, format: OutputFormat) -> Result<()> {
    let stats = system_stats(pool, config).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        OutputFormat::Text => {
            println!("MarkdownKeeper — System Stats");
            println!("=============================");
            println!();
            println!("  Documents:  {}", stats.documents);
            println!("  Links:      {}", stats.links);
            println!(
                "  Queue:      {} queued, {} in flight, {} failed (lag {:.1}s)",
                stats.queue.queued, stats.queue.in_flight, stats.queue.failed, stats.queue.lag_seconds
            );
            println!(
                "  Embeddings: {}/{} documents, {}/{} chunks ({})",
                stats.embeddings.embedded,
                stats.embeddings.documents,
                stats.embeddings.chunk_embedded,
                stats.embeddings.chunks,
                stats.embeddings.backend
            );
            if stats.embeddings.stale > 0 {
                println!("  Stale vectors: {}", stats.embeddings.stale);
            }
        }
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub documents: i64,
    pub missing_metadata: Vec<MetadataGap>,
    pub broken_links: i64,
    pub failed_events: i64,
    pub embeddings: EmbeddingCoverage,
}

#[derive(Debug, Serialize)]
pub struct MetadataGap {
    pub document_id: i64,
    pub path: String,
    pub missing: Vec<String>,
}

/// Check stored documents against the configured required frontmatter
/// fields via [`metadata::missing_fields`]. Presence comes from stored
/// columns; a field the store does not model counts as missing.
pub async fn health_report(pool: &SqlitePool, config: &Config) -> Result<HealthReport> {
    let rows = sqlx::query(
        "SELECT id, path, title, summary, category FROM documents ORDER BY id ASC",
    )
    .fetch_all(pool)
    .await?;

    let required = &config.metadata.required_frontmatter_fields;
    let mut missing_metadata = Vec::new();

    for row in &rows {
        let id: i64 = row.get("id");
        let title: Option<String> = row.get("title");
        let summary: Option<String> = row.get("summary");
        let category: Option<String> = row.get("category");

        let tags: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM document_tags WHERE document_id = ?")
                .bind(id)
                .fetch_one(pool)
                .await?;
        let concepts: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM document_concepts WHERE document_id = ?")
                .bind(id)
                .fetch_one(pool)
                .await?;

        let presence = metadata::FieldPresence {
            title: title
                .as_deref()
                .is_some_and(|t| !t.is_empty() && t != "Untitled"),
            summary: summary.as_deref().is_some_and(|s| !s.is_empty()),
            category: category.as_deref().is_some_and(|c| !c.is_empty()),
            tags: tags > 0,
            concepts: concepts > 0,
            extra: Default::default(),
        };
        let missing = metadata::missing_fields(&presence, required);

        if !missing.is_empty() {
            missing_metadata.push(MetadataGap {
                document_id: id,
                path: row.get("path"),
                missing,
            });
        }
    }

    let broken_links: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM links WHERE status = 'broken'")
            .fetch_one(pool)
            .await?;
    let failed_events: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE status = 'failed'")
            .fetch_one(pool)
            .await?;
    let embedder = embedding::create_embedder(&config.embeddings)?;
    let embeddings = store::embedding_coverage(pool, embedder.backend_id()).await?;

    Ok(HealthReport {
        documents: rows.len() as i64,
        missing_metadata,
        broken_links,
        failed_events,
        embeddings,
    })
}

pub async fn run_report(pool: &SqlitePool, config: &Config, format: OutputFormat) -> Result<()> {
    let report = health_report(pool, config).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        OutputFormat::Text => {
            println!("MarkdownKeeper — Health Report");
            println!("==============================");
            println!();
            println!("  Documents:      {}", report.documents);
            println!("  Broken links:   {}", report.broken_links);
            println!("  Failed events:  {}", report.failed_events);
            println!(
                "  Missing vectors: {} documents, {} chunks",
                report.embeddings.missing, report.embeddings.chunk_missing
            );
            if report.missing_metadata.is_empty() {
                println!("  Metadata:       all required fields present");
            } else {
                println!(
                    "  Metadata gaps ({} documents):",
                    report.missing_metadata.len()
                );
                for gap in &report.missing_metadata {
                    println!(
                        "    [{}] {} missing: {}",
                        gap.document_id,
                        gap.path,
                        gap.missing.join(", ")
                    );
                }
            }
        }
    }
    Ok(())
}
