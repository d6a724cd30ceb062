//! Retrieval quality evaluation and latency benchmarking.
//!
//! Both commands read a JSON case file of the form:
//!
//! ```json
//! [{"query": "kubernetes deployment", "expected_ids": [1, 3]}]
//! ```
//!
//! `embeddings-eval` reports precision@k per case and averaged;
//! `semantic-benchmark` additionally measures query latency over repeated
//! iterations (avg/p50/p95/max).

use serde::Deserialize;
use sqlx::SqlitePool;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;

use crate::config::Config;
use crate::error::{KeeperError, Result};
use crate::models::OutputFormat;
use crate::search::{self, SearchOptions};

#[derive(Debug, Deserialize)]
pub struct EvalCase {
    pub query: String,
    #[serde(default)]
    pub expected_ids: Vec<i64>,
}

fn load_cases(path: &Path) -> Result<Vec<EvalCase>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| KeeperError::NotFound(format!("{}: {e}", path.display())))?;
    let cases: Vec<EvalCase> = serde_json::from_str(&raw)
        .map_err(|e| KeeperError::Invalid(format!("case file {}: {e}", path.display())))?;
    Ok(cases)
}

/// Precision@k for every case, averaged across the file.
pub async fn evaluate_precision(
    pool: &SqlitePool,
    config: &Config,
    cases: &[EvalCase],
    k: i64,
) -> Result<(f64, Vec<serde_json::Value>)> {
    let k = k.max(1);
    let mut details = Vec::with_capacity(cases.len());
    let mut total = 0.0;

    for case in cases {
        let options = SearchOptions {
            limit: k,
            ..Default::default()
        };
        let results = search::search(pool, config, &case.query, &options).await?;
        let got: Vec<i64> = results.iter().map(|r| r.record.id).collect();
        let expected: BTreeSet<i64> = case.expected_ids.iter().copied().collect();
        let hits = got.iter().filter(|id| expected.contains(id)).count();
        let precision = hits as f64 / k as f64;
        total += precision;

        details.push(serde_json::json!({
            "query": case.query,
            "expected_ids": case.expected_ids,
            "result_ids": got,
            "precision_at_k": precision,
        }));
    }

    let average = if cases.is_empty() {
        0.0
    } else {
        total / cases.len() as f64
    };
    Ok((average, details))
}

pub async fn run_eval(
    pool: &SqlitePool,
    config: &Config,
    cases_path: &Path,
    k: i64,
    format: OutputFormat,
) -> Result<()> {
    let cases = load_cases(cases_path)?;
    let (precision, details) = evaluate_precision(pool, config, &cases, k).await?;

    match format {
        OutputFormat::Json => {
            let payload = serde_json::json!({
                "cases": cases.len(),
                "k": k.max(1),
                "precision_at_k": precision,
                "details": details,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        OutputFormat::Text => {
            println!(
                "precision@{} over {} cases: {:.3}",
                k.max(1),
                cases.len(),
                precision
            );
        }
    }
    Ok(())
}

fn percentile(sorted_ms: &[f64], fraction: f64) -> f64 {
    if sorted_ms.is_empty() {
        return 0.0;
    }
    let index = ((sorted_ms.len() - 1) as f64 * fraction).round() as usize;
    sorted_ms[index.min(sorted_ms.len() - 1)]
}

pub async fn run_benchmark(
    pool: &SqlitePool,
    config: &Config,
    cases_path: &Path,
    k: i64,
    iterations: u64,
    format: OutputFormat,
) -> Result<()> {
    let cases = load_cases(cases_path)?;
    let k = k.max(1);
    let iterations = iterations.max(1);

    // Benchmark uncached latency; the query cache would otherwise collapse
    // every iteration after the first into a lookup.
    let mut bench_config = config.clone();
    bench_config.cache.enabled = false;

    let mut latencies_ms: Vec<f64> = Vec::new();
    for _ in 0..iterations {
        for case in &cases {
            let options = SearchOptions {
                limit: k,
                ..Default::default()
            };
            let start = Instant::now();
            search::search(pool, &bench_config, &case.query, &options).await?;
            latencies_ms.push(start.elapsed().as_secs_f64() * 1000.0);
        }
    }

    let (precision, _) = evaluate_precision(pool, config, &cases, k).await?;

    latencies_ms.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let avg = if latencies_ms.is_empty() {
        0.0
    } else {
        latencies_ms.iter().sum::<f64>() / latencies_ms.len() as f64
    };
    let payload = serde_json::json!({
        "cases": cases.len(),
        "iterations": iterations,
        "k": k,
        "precision_at_k": precision,
        "latency_ms": {
            "avg": avg,
            "p50": percentile(&latencies_ms, 0.5),
            "p95": percentile(&latencies_ms, 0.95),
            "max": latencies_ms.last().copied().unwrap_or(0.0),
        },
    });

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&payload)?),
        OutputFormat::Text => {
            println!(
                "benchmark: {} cases × {} iterations, precision@{k}={:.3}",
                cases.len(),
                iterations,
                precision
            );
            println!(
                "latency ms: avg={:.2} p50={:.2} p95={:.2} max={:.2}",
                avg,
                percentile(&latencies_ms, 0.5),
                percentile(&latencies_ms, 0.95),
                latencies_ms.last().copied().unwrap_or(0.0)
            );
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
    async fn precision_reflects_expected_hits() {
        let dir = TempDir::new().unwrap();
        let pool = db::connect(&dir.path().join("index.db")).await.unwrap();
        migrate::run_migrations(&pool).await.unwrap();
        let config = Config::default();

        let file = dir.path().join("a.md");
        std::fs::write(&file, "# Alpha\nkubernetes deployment guide").unwrap();
        let id = ingest::scan_file(&pool, &config, &file).await.unwrap();

        let cases = vec![EvalCase {
            query: "kubernetes".to_string(),
            expected_ids: vec![id],
        }];
        let (precision, details) = evaluate_precision(&pool, &config, &cases, 1).await.unwrap();
        assert!((precision - 1.0).abs() < 1e-9);
        assert_eq!(details.len(), 1);
    }

    #[test]
    fn percentile_bounds() {
        let sorted = vec![1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&sorted, 0.0), 1.0);
        assert_eq!(percentile(&sorted, 1.0), 4.0);
        assert_eq!(percentile(&[], 0.5), 0.0);
    }

    #[test]
    fn malformed_case_file_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cases.json");
        std::fs::write(&path, "{oops").unwrap();
        let err = load_cases(&path).unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }
}
