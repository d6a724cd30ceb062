//! Durable file-event queue.
//!
//! Producers (watcher backends) append events; a single consumer leases one
//! record at a time with the status transition `queued → in_flight →
//! (done | failed | requeued)`. The log lives in the same SQLite database as
//! the index, so a crash leaves `in_flight` orphans that are reset to
//! `queued` on restart and replayed.
//!
//! Coalescing happens at dequeue time, per path:
//!
//! - `create` + later `modify` → one `modify`
//! - `create` + later `delete` → both `done` (no-op)
//! - `modify` + later `modify` → one `modify`
//! - anything older than the most recent `delete` is dropped
//!
//! A path becomes eligible for lease only after `debounce_ms` have elapsed
//! since its most recent enqueue, which collapses editor-save bursts.
//! Failed attempts requeue with exponential backoff `min(30s, 0.5s · 2^n)`
//! up to [`MAX_ATTEMPTS`].

use chrono::{Duration, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::Result;
use crate::models::{EventKind, EventRecord, EventStatus, QueueStatus};
use crate::store::now_iso;

/// Attempts after which an event is marked `failed`.
pub const MAX_ATTEMPTS: i64 = 5;

/// Retention window for terminal records, in hours.
pub const RETENTION_HOURS: i64 = 24;

/// Append an event to the log.
pub async fn enqueue(
    pool: &SqlitePool,
    kind: EventKind,
    path: &str,
    new_path: Option<&str>,
) -> Result<i64> {
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO events (path, kind, new_path, enqueued_at, status)
        VALUES (?, ?, ?, ?, 'queued')
        RETURNING id
        "#,
    )
    .bind(path)
    .bind(kind.as_str())
    .bind(new_path)
    .bind(now_iso())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> EventRecord {
    let kind_raw: String = row.get("kind");
    let status_raw: String = row.get("status");
    EventRecord {
        id: row.get("id"),
        path: row.get("path"),
        kind: EventKind::parse(&kind_raw).unwrap_or(EventKind::Modify),
        new_path: row.get("new_path"),
        enqueued_at: row.get("enqueued_at"),
        attempt_count: row.get::<Option<i64>, _>("attempt_count").unwrap_or(0),
        status: match status_raw.as_str() {
            "in_flight" => EventStatus::InFlight,
            "done" => EventStatus::Done,
            "failed" => EventStatus::Failed,
            _ => EventStatus::Queued,
        },
        last_error: row.get("last_error"),
        processed_at: row.get("processed_at"),
    }
}

/// Fold a per-path burst into at most one effective event.
///
/// Returns the index of the record to lease, or `None` when the burst
/// cancels out entirely (a file created and deleted before it was ever
/// ingested). Every other record is superseded and marked `done`.
fn fold_burst(events: &[EventRecord]) -> Option<usize> {
    if events.is_empty() {
        return None;
    }

    let last_delete = events
        .iter()
        .rposition(|e| e.kind == EventKind::Delete);

    if let Some(ld) = last_delete {
        if ld == events.len() - 1 {
            let created_in_burst = events[..ld].iter().any(|e| e.kind == EventKind::Create);
            if created_in_burst {
                return None;
            }
            return Some(ld);
        }
    }

    // The file exists after the burst; the latest record carries the
    // effective kind (create survives alone, any later modify wins).
    Some(events.len() - 1)
}

/// Lease the next eligible event: coalesce the oldest eligible path's burst,
/// mark superseded records done, and flip the survivor to `in_flight`.
///
/// Eligibility: status `queued`, past any retry backoff, no `in_flight`
/// record for the same path, and the path's most recent enqueue older than
/// the debounce window.
pub async fn lease_next(pool: &SqlitePool, debounce_ms: u64) -> Result<Option<EventRecord>> {
    let now = now_iso();
    let cutoff = (Utc::now() - Duration::milliseconds(debounce_ms as i64))
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);

    loop {
        let path: Option<String> = sqlx::query_scalar(
            r#"
            SELECT path FROM events
            WHERE status = 'queued'
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
              AND path NOT IN (SELECT path FROM events WHERE status = 'in_flight')
            GROUP BY path
            HAVING MAX(enqueued_at) <= ?
            ORDER BY MIN(id) ASC
            LIMIT 1
            "#,
        )
        .bind(&now)
        .bind(&cutoff)
        .fetch_optional(pool)
        .await?;

        let Some(path) = path else { return Ok(None) };

        let rows = sqlx::query(
            r#"
            SELECT id, path, kind, new_path, enqueued_at, attempt_count, status, last_error, processed_at
            FROM events
            WHERE status = 'queued' AND path = ?
              AND (next_attempt_at IS NULL OR next_attempt_at <= ?)
            ORDER BY id ASC
            "#,
        )
        .bind(&path)
        .bind(&now)
        .fetch_all(pool)
        .await?;
        let events: Vec<EventRecord> = rows.iter().map(record_from_row).collect();
        if events.is_empty() {
            continue;
        }

        let effective = fold_burst(&events);

        let mut tx = pool.begin().await?;
        for (idx, event) in events.iter().enumerate() {
            if Some(idx) == effective {
                continue;
            }
            sqlx::query("UPDATE events SET status = 'done', processed_at = ? WHERE id = ?")
                .bind(&now)
                .bind(event.id)
                .execute(&mut *tx)
                .await?;
        }

        let leased = if let Some(idx) = effective {
            sqlx::query("UPDATE events SET status = 'in_flight' WHERE id = ?")
                .bind(events[idx].id)
                .execute(&mut *tx)
                .await?;
            let mut record = events[idx].clone();
            record.status = EventStatus::InFlight;
            Some(record)
        } else {
            None
        };
        tx.commit().await?;

        match leased {
            Some(record) => return Ok(Some(record)),
            // The whole burst cancelled out; look for the next path.
            None => continue,
        }
    }
}

/// Mark a leased event done.
pub async fn complete(pool: &SqlitePool, event_id: i64) -> Result<()> {
    sqlx::query("UPDATE events SET status = 'done', processed_at = ?, last_error = NULL WHERE id = ?")
        .bind(now_iso())
        .bind(event_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Requeue a failed attempt with backoff, or mark the record `failed` once
/// [`MAX_ATTEMPTS`] is reached.
pub async fn retry_or_fail(pool: &SqlitePool, event: &EventRecord, error: &str) -> Result<()> {
    let attempts = event.attempt_count + 1;
    if attempts >= MAX_ATTEMPTS {
        sqlx::query(
            "UPDATE events SET status = 'failed', attempt_count = ?, last_error = ?, processed_at = ? WHERE id = ?",
        )
        .bind(attempts)
        .bind(error)
        .bind(now_iso())
        .bind(event.id)
        .execute(pool)
        .await?;
        tracing::warn!(path = %event.path, attempts, error, "event failed permanently");
        return Ok(());
    }

    let backoff_ms = ((500u64) << attempts.min(16) as u32).min(30_000);
    let next_attempt = (Utc::now() + Duration::milliseconds(backoff_ms as i64))
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
    sqlx::query(
        "UPDATE events SET status = 'queued', attempt_count = ?, last_error = ?, next_attempt_at = ? WHERE id = ?",
    )
    .bind(attempts)
    .bind(error)
    .bind(&next_attempt)
    .bind(event.id)
    .execute(pool)
    .await?;
    tracing::debug!(path = %event.path, attempts, backoff_ms, "event requeued");
    Ok(())
}

/// Reset `in_flight` orphans to `queued` (crash recovery). Attempt counts
/// are preserved. Returns how many records were reset.
pub async fn replay_orphans(pool: &SqlitePool) -> Result<u64> {
    let reset = sqlx::query("UPDATE events SET status = 'queued' WHERE status = 'in_flight'")
        .execute(pool)
        .await?
        .rows_affected();
    if reset > 0 {
        tracing::info!(reset, "requeued orphaned in-flight events");
    }
    Ok(reset)
}

/// Delete terminal records older than the retention window.
pub async fn prune(pool: &SqlitePool, retention_hours: i64) -> Result<u64> {
    let cutoff = (Utc::now() - Duration::hours(retention_hours))
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
    let pruned = sqlx::query(
        "DELETE FROM events WHERE status IN ('done', 'failed') AND processed_at < ?",
    )
    .bind(&cutoff)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(pruned)
}

/// Count of queued events held back only by the debounce window or a retry
/// backoff that expires within it. Used by the consumer to decide whether
/// draining should wait.
pub async fn debounce_pending(pool: &SqlitePool, debounce_ms: u64) -> Result<i64> {
    let cutoff = (Utc::now() - Duration::milliseconds(debounce_ms as i64))
        .to_rfc3339_opts(chrono::SecondsFormat::Micros, true);
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM (
            SELECT path FROM events
            WHERE status = 'queued' AND (next_attempt_at IS NULL OR next_attempt_at <= enqueued_at)
            GROUP BY path
            HAVING MAX(enqueued_at) > ?
        )
        "#,
    )
    .bind(&cutoff)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Aggregate queue health.
pub async fn queue_status(pool: &SqlitePool) -> Result<QueueStatus> {
    let count_for = |status: &'static str| {
        let pool = pool.clone();
        async move {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM events WHERE status = ?")
                .bind(status)
                .fetch_one(&pool)
                .await
        }
    };

    let queued = count_for("queued").await?;
    let in_flight = count_for("in_flight").await?;
    let failed = count_for("failed").await?;
    let done = count_for("done").await?;

    let oldest: Option<String> = sqlx::query_scalar(
        "SELECT enqueued_at FROM events WHERE status = 'queued' ORDER BY enqueued_at ASC LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;
    let lag_seconds = oldest
        .and_then(|ts| chrono::DateTime::parse_from_rfc3339(&ts).ok())
        .map(|ts| {
            let age = Utc::now().signed_duration_since(ts.with_timezone(&Utc));
            (age.num_milliseconds() as f64 / 1000.0).max(0.0)
        })
        .unwrap_or(0.0);

    Ok(QueueStatus {
        queued,
        in_flight,
        failed,
        done,
        lag_seconds,
    })
}
