//! Embedding management commands.
//!
//! `embeddings-generate` recomputes every document and chunk vector with the
//! active backend and rebuilds the sidecar vector index. `embeddings-status`
//! reports coverage and staleness (vectors generated by a different backend
//! than the active one).

use sqlx::SqlitePool;

use crate::config::Config;
use crate::embedding;
use crate::error::Result;
use crate::models::OutputFormat;
use crate::store;
use crate::vector_index::{BruteForceIndex, VectorIndex};

/// Regenerate all embeddings. Returns the number of documents updated.
pub async fn regenerate_all(pool: &SqlitePool, config: &Config) -> Result<u64> {
    let embedder = embedding::create_embedder(&config.embeddings)?;
    let now = store::now_iso();

    let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM documents ORDER BY id ASC")
        .fetch_all(pool)
        .await?;

    for id in &ids {
        store::regenerate_document_embeddings(pool, config, embedder.as_ref(), *id, &now).await?;
    }

    // Rebuild the sidecar index so candidate retrieval sees fresh vectors.
    let vectors = store::all_document_vectors(pool).await?;
    if !vectors.is_empty() {
        let mut index = BruteForceIndex::new();
        index.build(vectors);
        index.save(&BruteForceIndex::sidecar_path(&config.storage.database_path))?;
    }

    Ok(ids.len() as u64)
}

pub async fn run_generate(
    pool: &SqlitePool,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let updated = regenerate_all(pool, config).await?;
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::json!({ "updated": updated, "backend": config.embeddings.backend })
            );
        }
        OutputFormat::Text => {
            println!("Regenerated embeddings for {updated} documents");
        }
    }
    Ok(())
}

pub async fn run_status(pool: &SqlitePool, config: &Config, format: OutputFormat) -> Result<()> {
    let embedder = embedding::create_embedder(&config.embeddings)?;
    let coverage = store::embedding_coverage(pool, embedder.backend_id()).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&coverage)?);
        }
        OutputFormat::Text => {
            println!("Embedding status (backend {})", coverage.backend);
            println!(
                "  documents: {} embedded, {} missing",
                coverage.embedded, coverage.missing
            );
            println!(
                "  chunks:    {} embedded, {} missing",
                coverage.chunk_embedded, coverage.chunk_missing
            );
            if coverage.stale > 0 {
                println!(
                    "  stale:     {} vectors from another backend (run embeddings-generate)",
                    coverage.stale
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, ingest, migrate};
    use tempfile::TempDir;

    #[tokio::test]
    async fn regenerate_refreshes_backend_and_sidecar() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("index.db");
        let pool = db::connect(&db_path).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let mut config = Config::default();
        config.storage.database_path = db_path.clone();

        let file = dir.path().join("doc.md");
        std::fs::write(&file, "# Doc\n\nkubernetes content here").unwrap();
        ingest::scan_file(&pool, &config, &file).await.unwrap();

        // Simulate vectors left behind by a different backend.
        sqlx::query("UPDATE embeddings SET backend = 'model:old'")
            .execute(&pool)
            .await
            .unwrap();
        let coverage = store::embedding_coverage(&pool, "hash-v1").await.unwrap();
        assert!(coverage.stale > 0);

        let updated = regenerate_all(&pool, &config).await.unwrap();
        assert_eq!(updated, 1);
        let coverage = store::embedding_coverage(&pool, "hash-v1").await.unwrap();
        assert_eq!(coverage.stale, 0);
        assert!(BruteForceIndex::sidecar_path(&db_path).exists());
    }
}
