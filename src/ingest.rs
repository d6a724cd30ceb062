//! Event ingestion: the single consumer of the event queue.
//!
//! For `create`/`modify` the file's current bytes are read without locking,
//! parsed, and upserted. For `delete` the document is removed. A `move` is
//! the atomic pair delete-source-then-ingest-destination. Transient I/O
//! errors leave the event for retry; a file that has vanished by processing
//! time degrades to a delete.

use sqlx::SqlitePool;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{KeeperError, Result};
use crate::metadata;
use crate::models::{EventKind, EventRecord};
use crate::{parser, queue, store};

/// What an event did to the index, for watch-run summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Modified,
    Deleted,
    Noop,
}

/// Totals across a drain run.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainSummary {
    pub created: u64,
    pub modified: u64,
    pub deleted: u64,
    pub failed: u64,
}

impl DrainSummary {
    fn absorb(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::Modified => self.modified += 1,
            Outcome::Deleted => self.deleted += 1,
            Outcome::Noop => {}
        }
    }
}

/// Process one leased event against the store.
pub async fn process_event(
    pool: &SqlitePool,
    config: &Config,
    event: &EventRecord,
) -> Result<Outcome> {
    match event.kind {
        EventKind::Create | EventKind::Modify => {
            ingest_path(pool, config, Path::new(&event.path)).await
        }
        EventKind::Delete => {
            let existed = store::delete_by_path(pool, Path::new(&event.path)).await?;
            Ok(if existed { Outcome::Deleted } else { Outcome::Noop })
        }
        EventKind::Move => {
            let dst = event.new_path.as_ref().ok_or_else(|| {
                KeeperError::Invalid(format!("move event for {} has no destination", event.path))
            })?;
            store::delete_by_path(pool, Path::new(&event.path)).await?;
            ingest_path(pool, config, Path::new(dst)).await
        }
    }
}

/// Read, parse, and upsert a single file. A missing file is treated as a
/// deletion so delete-after-modify races settle on the right final state.
pub async fn ingest_path(pool: &SqlitePool, config: &Config, path: &Path) -> Result<Outcome> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let existed = store::delete_by_path(pool, path).await?;
            return Ok(if existed { Outcome::Deleted } else { Outcome::Noop });
        }
        Err(err) => {
            return Err(KeeperError::Retry(format!(
                "reading {}: {err}",
                path.display()
            )))
        }
    };

    let mut parsed = parser::parse(&text);
    if text.starts_with("---") && parsed.frontmatter.is_empty() {
        tracing::warn!(path = %path.display(), "malformed frontmatter, ingesting with empty metadata");
    }
    metadata::auto_fill(&mut parsed, path, &config.metadata);

    let missing = metadata::missing_fields(
        &metadata::FieldPresence::from_parsed(&parsed),
        &config.metadata.required_frontmatter_fields,
    );
    if !missing.is_empty() {
        tracing::warn!(path = %path.display(), missing = ?missing, "required frontmatter fields missing");
    }

    let existed: Option<i64> = sqlx::query_scalar("SELECT id FROM documents WHERE path = ?")
        .bind(path.to_string_lossy().to_string())
        .fetch_optional(pool)
        .await?;

    let id = store::upsert_document(pool, config, path, &parsed).await?;
    tracing::info!(path = %path.display(), id, "ingested");
    Ok(if existed.is_some() {
        Outcome::Modified
    } else {
        Outcome::Created
    })
}

/// Drain the queue: replay crash orphans, then lease and process events
/// until nothing more is eligible. Paths held back only by the debounce
/// window are waited out; retry backoffs are left for the next drain.
pub async fn drain(pool: &SqlitePool, config: &Config) -> Result<DrainSummary> {
    queue::replay_orphans(pool).await?;

    let debounce_ms = config.watch.debounce_ms;
    let mut summary = DrainSummary::default();

    loop {
        match queue::lease_next(pool, debounce_ms).await? {
            Some(event) => match process_event(pool, config, &event).await {
                Ok(outcome) => {
                    summary.absorb(outcome);
                    queue::complete(pool, event.id).await?;
                }
                Err(err) if matches!(err, KeeperError::Fatal(_)) => {
                    queue::retry_or_fail(pool, &event, &err.to_string()).await?;
                    return Err(err);
                }
                Err(err) => {
                    summary.failed += 1;
                    queue::retry_or_fail(pool, &event, &err.to_string()).await?;
                }
            },
            None => {
                if queue::debounce_pending(pool, debounce_ms).await? > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        (debounce_ms / 4).clamp(10, 250),
                    ))
                    .await;
                    continue;
                }
                break;
            }
        }
    }

    queue::prune(pool, queue::RETENTION_HOURS).await?;
    Ok(summary)
}

/// Convenience used by `scan-file`: index one file directly, bypassing the
/// queue. Returns the document id.
pub async fn scan_file(pool: &SqlitePool, config: &Config, path: &Path) -> Result<i64> {
    if !path.is_file() {
        return Err(KeeperError::NotFound(format!(
            "file not found: {}",
            path.display()
        )));
    }
    let canonical: PathBuf = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let text = std::fs::read_to_string(&canonical)
        .map_err(|err| KeeperError::Retry(format!("reading {}: {err}", canonical.display())))?;
    let mut parsed = parser::parse(&text);
    metadata::auto_fill(&mut parsed, &canonical, &config.metadata);
    store::upsert_document(pool, config, &canonical, &parsed).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn test_env() -> (TempDir, SqlitePool, Config) {
        let dir = TempDir::new().unwrap();
        let pool = db::connect(&dir.path().join("index.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let mut config = Config::default();
        config.watch.debounce_ms = 0;
        (dir, pool, config)
    }

    #[tokio::test]
    async fn coalesced_burst_causes_single_ingest() {
        let (dir, pool, config) = test_env().await;
        let file = dir.path().join("doc.md");
        std::fs::write(&file, "# Doc\n\nbody text").unwrap();
        let path = file.to_string_lossy().to_string();

        for _ in 0..10 {
            queue::enqueue(&pool, EventKind::Modify, &path, None).await.unwrap();
        }

        let summary = drain(&pool, &config).await.unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.modified, 0);

        // One document, one document embedding generation.
        let docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(docs, 1);
        let generated: Vec<String> = sqlx::query_scalar("SELECT generated_at FROM embeddings")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(generated.len(), 1);
    }

    #[tokio::test]
    async fn move_event_relocates_document() {
        let (dir, pool, config) = test_env().await;
        let src = dir.path().join("old.md");
        let dst = dir.path().join("new.md");
        std::fs::write(&src, "# Doc\n\nbody").unwrap();
        scan_file(&pool, &config, &src).await.unwrap();

        // Capture the indexed (canonical) path before the rename invalidates it.
        let indexed: String = sqlx::query_scalar("SELECT path FROM documents")
            .fetch_one(&pool)
            .await
            .unwrap();

        std::fs::rename(&src, &dst).unwrap();
        queue::enqueue(&pool, EventKind::Move, &indexed, Some(&dst.to_string_lossy()))
            .await
            .unwrap();

        let summary = drain(&pool, &config).await.unwrap();
        assert_eq!(summary.created, 1);

        let paths: Vec<String> = sqlx::query_scalar("SELECT path FROM documents")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("new.md"));
    }

    #[tokio::test]
    async fn missing_file_event_degrades_to_delete() {
        let (dir, pool, config) = test_env().await;
        let ghost = dir.path().join("ghost.md");
        queue::enqueue(&pool, EventKind::Modify, &ghost.to_string_lossy(), None)
            .await
            .unwrap();

        let summary = drain(&pool, &config).await.unwrap();
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.created, 0);
        let status: String = sqlx::query_scalar("SELECT status FROM events LIMIT 1")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(status, "done");
    }

    #[tokio::test]
    async fn crash_replay_reaches_same_final_state() {
        let (dir, pool, config) = test_env().await;
        let file = dir.path().join("doc.md");
        std::fs::write(&file, "# Recovered\n\nbody").unwrap();
        let path = file.to_string_lossy().to_string();

        // Three queued, one stranded in flight, as left by a crash.
        for _ in 0..3 {
            queue::enqueue(&pool, EventKind::Modify, &path, None).await.unwrap();
        }
        let id = queue::enqueue(&pool, EventKind::Modify, &path, None).await.unwrap();
        sqlx::query("UPDATE events SET status = 'in_flight' WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();

        let summary = drain(&pool, &config).await.unwrap();
        assert_eq!(summary.created, 1);
        let docs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(docs, 1);
        let pending: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM events WHERE status IN ('queued', 'in_flight')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(pending, 0);
    }
}
