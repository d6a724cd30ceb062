//! Watcher backends: produce file events for the queue.
//!
//! Two interchangeable producers feed the durable event queue:
//!
//! - **Notify** subscribes to recursive OS filesystem notifications over the
//!   configured roots and translates them to queue events.
//! - **Polling** snapshots the tree every interval and diffs it against a
//!   path→mtime map kept both in memory and in the `file_mtimes` table, so a
//!   restart does not re-emit events for unchanged files.
//!
//! `auto` picks notify when the OS subscription succeeds and falls back to
//! polling. Notify runs are bounded by a duration (derived as
//! `iterations × interval` when only iterations are given); polling runs are
//! bounded by an iteration count.

use notify::event::{ModifyKind, RenameMode};
use notify::{RecursiveMode, Watcher as _};
use sqlx::SqlitePool;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{KeeperError, Result};
use crate::ingest::{self, DrainSummary};
use crate::models::EventKind;
use crate::queue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Auto,
    Notify,
    Polling,
}

impl WatchMode {
    pub fn parse(s: &str) -> Option<WatchMode> {
        match s {
            "auto" => Some(WatchMode::Auto),
            "notify" => Some(WatchMode::Notify),
            "polling" => Some(WatchMode::Polling),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub mode: WatchMode,
    pub interval_s: f64,
    pub iterations: Option<u64>,
    pub duration_s: Option<f64>,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            mode: WatchMode::Auto,
            interval_s: 1.0,
            iterations: None,
            duration_s: None,
        }
    }
}

/// Resolves on SIGINT or SIGTERM, for graceful shutdown of long-running
/// loops: stop producing, drain in-flight work, exit.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

type Snapshot = BTreeMap<PathBuf, i64>;

fn extension_matches(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    let dotted = format!(".{}", ext.to_lowercase());
    extensions.iter().any(|e| e.to_lowercase() == dotted)
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// Walk the roots collecting matching files and their mtimes.
fn take_snapshot(roots: &[String], extensions: &[String]) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for root in roots {
        let root = Path::new(root);
        if !root.exists() {
            continue;
        }
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() || is_hidden(entry.path()) {
                continue;
            }
            if !extension_matches(entry.path(), extensions) {
                continue;
            }
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let path = entry
                .path()
                .canonicalize()
                .unwrap_or_else(|_| entry.path().to_path_buf());
            snapshot.insert(path, mtime);
        }
    }
    snapshot
}

/// Synthetic events derived from two snapshots.
fn diff_snapshots(old: &Snapshot, new: &Snapshot) -> Vec<(EventKind, PathBuf)> {
    let mut events = Vec::new();
    for (path, mtime) in new {
        match old.get(path) {
            None => events.push((EventKind::Create, path.clone())),
            Some(old_mtime) if old_mtime != mtime => {
                events.push((EventKind::Modify, path.clone()))
            }
            Some(_) => {}
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            events.push((EventKind::Delete, path.clone()));
        }
    }
    events
}

async fn load_stored_mtimes(pool: &SqlitePool) -> Result<Snapshot> {
    let rows: Vec<(String, i64)> = sqlx::query_as("SELECT path, mtime FROM file_mtimes")
        .fetch_all(pool)
        .await?;
    Ok(rows
        .into_iter()
        .map(|(path, mtime)| (PathBuf::from(path), mtime))
        .collect())
}

async fn persist_mtimes(pool: &SqlitePool, old: &Snapshot, new: &Snapshot) -> Result<()> {
    for (path, mtime) in new {
        if old.get(path) != Some(mtime) {
            sqlx::query("INSERT OR REPLACE INTO file_mtimes (path, mtime) VALUES (?, ?)")
                .bind(path.to_string_lossy().to_string())
                .bind(mtime)
                .execute(pool)
                .await?;
        }
    }
    for path in old.keys() {
        if !new.contains_key(path) {
            sqlx::query("DELETE FROM file_mtimes WHERE path = ?")
                .bind(path.to_string_lossy().to_string())
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

/// Run the watcher until its stop condition, draining the queue after each
/// producer pass. Returns the backend actually used and the drain totals.
pub async fn run_watch(
    pool: &SqlitePool,
    config: &Config,
    options: &WatchOptions,
) -> Result<(&'static str, DrainSummary)> {
    match options.mode {
        WatchMode::Polling => Ok(("polling", watch_polling(pool, config, options).await?)),
        WatchMode::Notify => Ok(("notify", watch_notify(pool, config, options).await?)),
        WatchMode::Auto => match watch_notify(pool, config, options).await {
            Ok(summary) => Ok(("notify", summary)),
            Err(KeeperError::Backend(reason)) => {
                tracing::info!(reason, "notify unavailable, falling back to polling");
                Ok(("polling", watch_polling(pool, config, options).await?))
            }
            Err(err) => Err(err),
        },
    }
}

async fn watch_polling(
    pool: &SqlitePool,
    config: &Config,
    options: &WatchOptions,
) -> Result<DrainSummary> {
    let interval = Duration::from_secs_f64(options.interval_s.max(0.1));
    let mut total = DrainSummary::default();
    let mut previous = load_stored_mtimes(pool).await?;
    let mut runs: u64 = 0;

    loop {
        let snapshot = take_snapshot(&config.watch.roots, &config.watch.extensions);
        for (kind, path) in diff_snapshots(&previous, &snapshot) {
            queue::enqueue(pool, kind, &path.to_string_lossy(), None).await?;
        }
        persist_mtimes(pool, &previous, &snapshot).await?;
        previous = snapshot;

        let summary = ingest::drain(pool, config).await?;
        total.created += summary.created;
        total.modified += summary.modified;
        total.deleted += summary.deleted;
        total.failed += summary.failed;

        runs += 1;
        if let Some(iterations) = options.iterations {
            if runs >= iterations {
                return Ok(total);
            }
        }
        if let Some(duration_s) = options.duration_s {
            if runs as f64 * options.interval_s >= duration_s {
                return Ok(total);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_signal() => {
                tracing::info!("stop signal received, draining and exiting watch loop");
                let summary = ingest::drain(pool, config).await?;
                total.created += summary.created;
                total.modified += summary.modified;
                total.deleted += summary.deleted;
                return Ok(total);
            }
        }
    }
}

/// Map an OS notification to queue events. Returns `(kind, path, new_path)`.
fn translate_event(event: &notify::Event) -> Vec<(EventKind, PathBuf, Option<PathBuf>)> {
    use notify::EventKind as NK;
    match &event.kind {
        NK::Create(_) => event
            .paths
            .iter()
            .map(|p| (EventKind::Create, p.clone(), None))
            .collect(),
        NK::Remove(_) => event
            .paths
            .iter()
            .map(|p| (EventKind::Delete, p.clone(), None))
            .collect(),
        NK::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            vec![(
                EventKind::Move,
                event.paths[0].clone(),
                Some(event.paths[1].clone()),
            )]
        }
        NK::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .map(|p| (EventKind::Delete, p.clone(), None))
            .collect(),
        NK::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .map(|p| (EventKind::Create, p.clone(), None))
            .collect(),
        NK::Modify(_) => event
            .paths
            .iter()
            .map(|p| (EventKind::Modify, p.clone(), None))
            .collect(),
        _ => Vec::new(),
    }
}

async fn watch_notify(
    pool: &SqlitePool,
    config: &Config,
    options: &WatchOptions,
) -> Result<DrainSummary> {
    let (tx, rx) = std::sync::mpsc::channel::<notify::Event>();

    let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        if let Ok(event) = result {
            let _ = tx.send(event);
        }
    })
    .map_err(|e| KeeperError::Backend(format!("notify init: {e}")))?;

    for root in &config.watch.roots {
        let root = Path::new(root);
        if !root.exists() {
            continue;
        }
        watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| KeeperError::Backend(format!("notify watch {}: {e}", root.display())))?;
    }

    // Duration bound; derived from iterations when only those are given.
    let duration = options
        .duration_s
        .or_else(|| options.iterations.map(|n| n as f64 * options.interval_s));
    let deadline = duration.map(|d| tokio::time::Instant::now() + Duration::from_secs_f64(d));
    let tick = Duration::from_secs_f64(options.interval_s.clamp(0.05, 5.0));

    let mut total = DrainSummary::default();

    loop {
        let mut saw_events = false;
        while let Ok(event) = rx.try_recv() {
            for (kind, path, new_path) in translate_event(&event) {
                if is_hidden(&path) || !extension_matches(&path, &config.watch.extensions) {
                    continue;
                }
                saw_events = true;
                queue::enqueue(
                    pool,
                    kind,
                    &path.to_string_lossy(),
                    new_path.as_deref().map(|p| p.to_string_lossy()).as_deref(),
                )
                .await?;
            }
        }

        if saw_events || queue::queue_status(pool).await?.queued > 0 {
            let summary = ingest::drain(pool, config).await?;
            total.created += summary.created;
            total.modified += summary.modified;
            total.deleted += summary.deleted;
            total.failed += summary.failed;
        }

        if let Some(deadline) = deadline {
            if tokio::time::Instant::now() >= deadline {
                return Ok(total);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = shutdown_signal() => {
                tracing::info!("stop signal received, draining and exiting watch loop");
                let summary = ingest::drain(pool, config).await?;
                total.created += summary.created;
                total.modified += summary.modified;
                total.deleted += summary.deleted;
                return Ok(total);
            }
        }
    }
}
