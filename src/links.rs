//! Link validation.
//!
//! Internal targets resolve relative to the owning document and must exist
//! on disk; pure anchors (`#section`) are always valid. External targets are
//! probed only when requested: HEAD first with a 3 second timeout, GET
//! retried on 405, any non-2xx/3xx outcome is broken. A per-domain rate
//! limiter keeps a minimum inter-request delay to the same host.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;
use crate::models::OutputFormat;
use crate::store::now_iso;

/// Per-request timeout for external checks.
const EXTERNAL_TIMEOUT: Duration = Duration::from_secs(3);

/// Default minimum delay between requests to the same host.
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_secs(1);

/// Outcome of checking a single link.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LinkCheckResult {
    pub link_id: i64,
    pub document_path: String,
    pub target: String,
    pub status: String,
}

/// Enforces a minimum inter-request delay per host. Requests to distinct
/// hosts incur no added delay.
pub struct DomainRateLimiter {
    min_delay: Duration,
    last_request: HashMap<String, Instant>,
}

impl DomainRateLimiter {
    pub fn new(min_delay: Duration) -> Self {
        Self {
            min_delay,
            last_request: HashMap::new(),
        }
    }

    /// Wait until a request to `host` is allowed, then record it.
    pub async fn acquire(&mut self, host: &str) {
        if let Some(last) = self.last_request.get(host) {
            let elapsed = last.elapsed();
            if elapsed < self.min_delay {
                tokio::time::sleep(self.min_delay - elapsed).await;
            }
        }
        self.last_request.insert(host.to_string(), Instant::now());
    }
}

/// Check a non-external target against the filesystem, relative to the
/// document that contains it.
pub fn check_internal(document_path: &str, target: &str) -> &'static str {
    if target.starts_with('#') {
        return "ok";
    }
    let path_part = target.split('#').next().unwrap_or("").trim();
    if path_part.is_empty() {
        return "ok";
    }
    let base = Path::new(document_path)
        .parent()
        .unwrap_or_else(|| Path::new("."));
    if base.join(path_part).exists() {
        "ok"
    } else {
        "broken"
    }
}

async fn probe_external(
    client: &reqwest::Client,
    limiter: &mut DomainRateLimiter,
    target: &str,
) -> &'static str {
    let Ok(url) = reqwest::Url::parse(target) else {
        return "broken";
    };
    if !matches!(url.scheme(), "http" | "https") {
        return "broken";
    }
    let host = url.host_str().unwrap_or_default().to_string();
    limiter.acquire(&host).await;

    let head = client.head(url.clone()).send().await;
    let status = match head {
        Ok(resp) if resp.status().as_u16() == 405 => {
            limiter.acquire(&host).await;
            match client.get(url).send().await {
                Ok(resp) => resp.status(),
                Err(_) => return "broken",
            }
        }
        Ok(resp) => resp.status(),
        Err(_) => return "broken",
    };

    if (200..400).contains(&status.as_u16()) {
        "ok"
    } else {
        "broken"
    }
}

/// Validate every indexed link, persisting status and check time. External
/// links are only probed when `check_external` is set and otherwise keep
/// their current status.
pub async fn validate_links(
    pool: &SqlitePool,
    check_external: bool,
) -> Result<Vec<LinkCheckResult>> {
    let rows = sqlx::query(
        r#"
        SELECT l.id, l.target, l.is_external, d.path AS document_path
        FROM links l
        JOIN documents d ON d.id = l.document_id
        ORDER BY l.id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let client = reqwest::Client::builder()
        .timeout(EXTERNAL_TIMEOUT)
        .build()
        .map_err(|e| crate::error::KeeperError::Internal(format!("http client: {e}")))?;
    let mut limiter = DomainRateLimiter::new(DEFAULT_MIN_DELAY);

    let now = now_iso();
    let mut results = Vec::with_capacity(rows.len());

    for row in &rows {
        let link_id: i64 = row.get("id");
        let target: String = row.get("target");
        let is_external: i64 = row.get("is_external");
        let document_path: String = row.get("document_path");

        let status = if is_external != 0 {
            if !check_external {
                continue;
            }
            probe_external(&client, &mut limiter, &target).await
        } else {
            check_internal(&document_path, &target)
        };

        sqlx::query("UPDATE links SET status = ?, checked_at = ? WHERE id = ?")
            .bind(status)
            .bind(&now)
            .bind(link_id)
            .execute(pool)
            .await?;

        results.push(LinkCheckResult {
            link_id,
            document_path,
            target,
            status: status.to_string(),
        });
    }

    Ok(results)
}

/// CLI entry point for `mdkeeper check-links`. Returns whether any link is
/// broken (the caller exits nonzero in that case).
pub async fn run_check_links(
    pool: &SqlitePool,
    check_external: bool,
    format: OutputFormat,
) -> Result<bool> {
    let results = validate_links(pool, check_external).await?;
    let broken: Vec<&LinkCheckResult> = results.iter().filter(|r| r.status != "ok").collect();

    match format {
        OutputFormat::Json => {
            let payload = serde_json::json!({
                "checked": results.len(),
                "broken": broken.len(),
                "broken_links": broken,
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        OutputFormat::Text => {
            println!("Checked {} links; broken={}", results.len(), broken.len());
            for item in &broken {
                println!("- [{}] {} ({})", item.link_id, item.target, item.document_path);
            }
        }
    }

    Ok(!broken.is_empty())
}
