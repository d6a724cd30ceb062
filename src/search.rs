//! Hybrid retrieval.
//!
//! A query is normalized, checked against the TTL query cache, and scored
//! against every candidate document:
//!
//! ```text
//! score = 0.45·cos(q, doc) + 0.30·max_i cos(q, chunk_i)
//!       + 0.20·lexical_overlap + 0.05·concept_match + freshness
//! ```
//!
//! The optional vector index narrows scoring to a candidate set of
//! `max(limit·4, 50)` documents; the full hybrid score is recomputed over
//! it, so results are identical to a brute-force pass modulo the cutoff.
//! Lexical mode uses the overlap term alone and needs no embeddings; a
//! semantic pass that produces no positive scores falls back to it, as does
//! an unavailable embedding backend.

use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::BTreeSet;

use crate::config::Config;
use crate::embedding;
use crate::error::{KeeperError, Result};
use crate::models::{OutputFormat, SearchResult};
use crate::parser;
use crate::store::{self, ContentOptions, ScoringRow};
use crate::vector_index::{BruteForceIndex, VectorIndex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Semantic,
    Lexical,
}

impl SearchMode {
    pub fn parse(s: &str) -> Option<SearchMode> {
        match s {
            "semantic" => Some(SearchMode::Semantic),
            "lexical" => Some(SearchMode::Lexical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchMode::Semantic => "semantic",
            SearchMode::Lexical => "lexical",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub mode: SearchMode,
    pub limit: i64,
    pub include_content: bool,
    pub max_tokens: Option<i64>,
    pub section: Option<String>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            mode: SearchMode::Semantic,
            limit: 10,
            include_content: false,
            max_tokens: None,
            section: None,
        }
    }
}

/// Collapse whitespace, trim, and lowercase.
pub fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `SHA-256(normalized ∥ 0x00 ∥ limit)` as lowercase hex.
pub fn query_hash(normalized: &str, limit: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update([0u8]);
    hasher.update(limit.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Execute a search. Empty queries and an empty index both yield an empty
/// result set, never an error.
pub async fn search(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    options: &SearchOptions,
) -> Result<Vec<SearchResult>> {
    let normalized = normalize_query(query);
    if normalized.is_empty() {
        return Ok(Vec::new());
    }
    let limit = options.limit.max(1);
    let hash = query_hash(&normalized, limit);

    if config.cache.enabled {
        if let Some(ids) = store::fetch_cache(pool, &hash, config.cache.ttl_seconds).await? {
            tracing::debug!(%hash, "query cache hit");
            let records = store::records_by_ids(pool, &ids).await?;
            let mut results: Vec<SearchResult> = records
                .into_iter()
                .map(|record| SearchResult {
                    record,
                    score: 0.0,
                    content: None,
                })
                .collect();
            attach_content(pool, &mut results, options).await?;
            return Ok(results);
        }
    }

    let mut results = match options.mode {
        SearchMode::Lexical => lexical_search(pool, &normalized, limit).await?,
        SearchMode::Semantic => match semantic_search(pool, config, &normalized, limit).await {
            Ok(results) => results,
            Err(KeeperError::Backend(reason)) => {
                tracing::warn!(reason, "embedding backend unavailable, lexical fallback");
                lexical_search(pool, &normalized, limit).await?
            }
            Err(err) => return Err(err),
        },
    };

    if results.is_empty() && options.mode == SearchMode::Semantic {
        results = lexical_search(pool, &normalized, limit).await?;
    }

    if config.cache.enabled {
        let ids: Vec<i64> = results.iter().map(|r| r.record.id).collect();
        store::store_cache(pool, &hash, &normalized, &ids).await?;
    }

    attach_content(pool, &mut results, options).await?;
    Ok(results)
}

async fn semantic_search(
    pool: &SqlitePool,
    config: &Config,
    normalized: &str,
    limit: i64,
) -> Result<Vec<SearchResult>> {
    let embedder = embedding::create_embedder(&config.embeddings)?;
    let query_vector = embedding::embed_text(embedder.as_ref(), &config.embeddings, normalized).await?;

    // Candidate set from the vector index; scoring recomputes everything.
    let vectors = store::all_document_vectors(pool).await?;
    let candidates: Option<Vec<i64>> = if vectors.is_empty() {
        None
    } else {
        let mut index = BruteForceIndex::new();
        index.build(vectors);
        let k = (limit * 4).max(50) as usize;
        Some(index.search(&query_vector, k).into_iter().map(|(id, _)| id).collect())
    };

    let rows = store::load_scoring_rows(pool, candidates.as_deref()).await?;
    let query_tokens: BTreeSet<String> = parser::tokenize(normalized).into_iter().collect();
    let current_year = chrono::Utc::now().format("%Y").to_string();

    let mut results: Vec<SearchResult> = rows
        .into_iter()
        .filter_map(|row| {
            let score = hybrid_score(&row, &query_vector, &query_tokens, &current_year);
            if score > 0.0 {
                Some(SearchResult {
                    record: row.record,
                    score,
                    content: None,
                })
            } else {
                None
            }
        })
        .collect();

    rank(&mut results);
    results.truncate(limit as usize);
    Ok(results)
}

async fn lexical_search(
    pool: &SqlitePool,
    normalized: &str,
    limit: i64,
) -> Result<Vec<SearchResult>> {
    let rows = store::load_scoring_rows(pool, None).await?;
    let query_tokens: BTreeSet<String> = parser::tokenize(normalized).into_iter().collect();

    let mut results: Vec<SearchResult> = rows
        .into_iter()
        .filter_map(|row| {
            let score = lexical_overlap(&row, &query_tokens);
            if score > 0.0 {
                Some(SearchResult {
                    record: row.record,
                    score,
                    content: None,
                })
            } else {
                None
            }
        })
        .collect();

    rank(&mut results);
    results.truncate(limit as usize);
    Ok(results)
}

fn rank(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.record.updated_at.cmp(&a.record.updated_at))
            .then_with(|| a.record.id.cmp(&b.record.id))
    });
}

/// Query-token overlap with the document's deduped body tokens, in `[0, 1]`.
/// Only the body counts: a token that appears in the path, title, or summary
/// but not in the body contributes nothing.
fn lexical_overlap(row: &ScoringRow, query_tokens: &BTreeSet<String>) -> f64 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let doc_tokens: BTreeSet<String> = parser::tokenize(&row.content).into_iter().collect();
    let overlap = query_tokens.intersection(&doc_tokens).count();
    overlap as f64 / query_tokens.len().max(1) as f64
}

fn hybrid_score(
    row: &ScoringRow,
    query_vector: &[f32],
    query_tokens: &BTreeSet<String>,
    current_year: &str,
) -> f64 {
    let s_vec = embedding::cosine_similarity(query_vector, &row.vector).clamp(0.0, 1.0);

    let s_chunk = row
        .chunk_vectors
        .iter()
        .map(|v| embedding::cosine_similarity(query_vector, v))
        .fold(0.0f64, f64::max)
        .clamp(0.0, 1.0);

    let s_lex = lexical_overlap(row, query_tokens);

    let s_concept = if query_tokens.iter().any(|t| row.concepts.contains(t)) {
        1.0
    } else {
        0.0
    };

    let freshness = if row.record.updated_at.starts_with(current_year) {
        0.05
    } else {
        0.0
    };

    0.45 * s_vec + 0.30 * s_chunk + 0.20 * s_lex + 0.05 * s_concept + freshness
}

async fn attach_content(
    pool: &SqlitePool,
    results: &mut [SearchResult],
    options: &SearchOptions,
) -> Result<()> {
    if !options.include_content {
        return Ok(());
    }
    let content_options = ContentOptions {
        include_content: true,
        max_tokens: options.max_tokens,
        section: options.section.clone(),
    };
    for result in results.iter_mut() {
        result.content =
            Some(store::select_content(pool, result.record.id, &content_options).await?);
    }
    Ok(())
}

/// CLI entry point for `mdkeeper query`.
pub async fn run_query(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    options: &SearchOptions,
    format: OutputFormat,
) -> Result<()> {
    let results = search(pool, config, query, options).await?;

    match format {
        OutputFormat::Json => {
            let payload = serde_json::json!({
                "query": query,
                "search_mode": options.mode.as_str(),
                "count": results.len(),
                "documents": results,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        OutputFormat::Text => {
            if results.is_empty() {
                println!("No documents matched query");
            }
            for result in &results {
                println!(
                    "[{}] {} ({}) score={:.3}",
                    result.record.id, result.record.title, result.record.path, result.score
                );
                if let Some(content) = &result.content {
                    if !content.is_empty() {
                        println!("{content}");
                    }
                }
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

    async fn test_env() -> (TempDir, SqlitePool, Config) {
        let dir = TempDir::new().unwrap();
        let pool = db::connect(&dir.path().join("index.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        (dir, pool, Config::default())
    }

    async fn index_file(
        dir: &TempDir,
        pool: &SqlitePool,
        config: &Config,
        name: &str,
        body: &str,
    ) -> i64 {
        let file = dir.path().join(name);
        std::fs::write(&file, body).unwrap();
        ingest::scan_file(pool, config, &file).await.unwrap()
    }

    #[test]
    fn normalization_collapses_whitespace() {
        assert_eq!(normalize_query("  Foo\t BAR  baz "), "foo bar baz");
    }

    #[test]
    fn query_hash_depends_on_limit() {
        let a = query_hash("kubernetes", 10);
        let b = query_hash("kubernetes", 20);
        assert_ne!(a, b);
        assert_eq!(a, query_hash("kubernetes", 10));
    }

    #[tokio::test]
    async fn indexed_document_ranks_first_with_positive_score() {
        let (dir, pool, config) = test_env().await;
        let id = index_file(&dir, &pool, &config, "a.md", "# Alpha\nkubernetes deployment guide").await;
        index_file(&dir, &pool, &config, "b.md", "# Beta\ncooking pasta at home").await;

        let results = search(&pool, &config, "kubernetes", &SearchOptions::default())
            .await
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].record.id, id);
        assert!(results[0].score > 0.0);
    }

    #[tokio::test]
    async fn scores_stay_within_bounds() {
        let (dir, pool, config) = test_env().await;
        index_file(
            &dir,
            &pool,
            &config,
            "a.md",
            "---\nconcepts: kubernetes\n---\n# Kubernetes\n\nkubernetes kubernetes kubernetes",
        )
        .await;

        let results = search(&pool, &config, "kubernetes", &SearchOptions::default())
            .await
            .unwrap();
        assert!(results[0].score > 0.0);
        assert!(results[0].score <= 1.05 + 1e-9);
    }

    #[tokio::test]
    async fn empty_index_returns_empty_not_error() {
        let (_dir, pool, config) = test_env().await;
        let results = search(&pool, &config, "anything", &SearchOptions::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn empty_query_returns_empty() {
        let (_dir, pool, config) = test_env().await;
        let results = search(&pool, &config, "   ", &SearchOptions::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn lexical_mode_matches_without_vectors() {
        let (dir, pool, config) = test_env().await;
        let id = index_file(&dir, &pool, &config, "a.md", "# Doc\n\nterraform state locking").await;

        let options = SearchOptions {
            mode: SearchMode::Lexical,
            ..Default::default()
        };
        let results = search(&pool, &config, "terraform", &options).await.unwrap();
        assert_eq!(results[0].record.id, id);
        assert!(results[0].score > 0.0 && results[0].score <= 1.0);
    }

    #[tokio::test]
    async fn path_tokens_do_not_count_as_lexical_matches() {
        let (dir, pool, config) = test_env().await;
        let sub = dir.path().join("runbooks");
        std::fs::create_dir_all(&sub).unwrap();
        let file = sub.join("deploy.md");
        std::fs::write(&file, "# Deploy\n\nship the build").unwrap();
        ingest::scan_file(&pool, &config, &file).await.unwrap();

        // "runbooks" appears only in the path, never in the body.
        let options = SearchOptions {
            mode: SearchMode::Lexical,
            ..Default::default()
        };
        let results = search(&pool, &config, "runbooks", &options).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn repeated_query_hits_cache() {
        let (dir, pool, config) = test_env().await;
        index_file(&dir, &pool, &config, "a.md", "# Alpha\nkubernetes deployment").await;

        let options = SearchOptions::default();
        let first = search(&pool, &config, "kubernetes", &options).await.unwrap();
        let second = search(&pool, &config, "kubernetes", &options).await.unwrap();

        let first_ids: Vec<i64> = first.iter().map(|r| r.record.id).collect();
        let second_ids: Vec<i64> = second.iter().map(|r| r.record.id).collect();
        assert_eq!(first_ids, second_ids);

        let hits: i64 = sqlx::query_scalar("SELECT hit_count FROM query_cache")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn reingest_invalidates_cached_results() {
        let (dir, pool, config) = test_env().await;
        index_file(&dir, &pool, &config, "a.md", "# Alpha\nkubernetes deployment").await;
        search(&pool, &config, "kubernetes", &SearchOptions::default())
            .await
            .unwrap();
        let cached: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM query_cache")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(cached, 1);

        index_file(&dir, &pool, &config, "b.md", "# Beta\nmore kubernetes notes").await;
        let cached: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM query_cache")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(cached, 0);
    }

    #[tokio::test]
    async fn section_filter_limits_returned_content() {
        let (dir, pool, config) = test_env().await;
        index_file(
            &dir,
            &pool,
            &config,
            "a.md",
            "# Guide\n\n## Prerequisites\n\nInstall kubectl first.\n\n## Steps\n\nApply the kubernetes manifest.",
        )
        .await;

        let options = SearchOptions {
            include_content: true,
            section: Some("Steps".to_string()),
            ..Default::default()
        };
        let results = search(&pool, &config, "kubernetes", &options).await.unwrap();
        let content = results[0].content.as_deref().unwrap();
        assert!(content.contains("Apply the kubernetes manifest."));
        assert!(!content.contains("Install kubectl first."));
    }
}
