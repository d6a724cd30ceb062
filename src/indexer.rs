//! Static Markdown index generation for `mdkeeper build-index`.
//!
//! Writes browsable index files summarizing the database: a master list of
//! every document plus by-concept and by-category groupings.

use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{KeeperError, Result};
use crate::models::DocumentRecord;
use crate::store;

fn write_index(path: &Path, lines: &[String]) -> Result<()> {
    std::fs::write(path, format!("{}\n", lines.join("\n")))
        .map_err(|e| KeeperError::Internal(format!("writing {}: {e}", path.display())))?;
    Ok(())
}

fn entry_lines(doc: &DocumentRecord, lines: &mut Vec<String>) {
    let title = if doc.title.is_empty() {
        "Untitled"
    } else {
        &doc.title
    };
    lines.push(format!("- [{}] **{}** (`{}`)", doc.id, title, doc.path));
    let summary = doc.summary.replace('\n', " ");
    let summary = summary.trim();
    if !summary.is_empty() {
        let short: String = summary.chars().take(180).collect();
        lines.push(format!("  - {short}"));
    }
}

fn generate_master(docs: &[DocumentRecord], output_dir: &Path) -> Result<PathBuf> {
    let out = output_dir.join("master.md");
    let mut lines = vec!["# MarkdownKeeper Master Index".to_string(), String::new()];
    if docs.is_empty() {
        lines.push("_No indexed documents found._".to_string());
    } else {
        for doc in docs {
            entry_lines(doc, &mut lines);
        }
    }
    write_index(&out, &lines)?;
    Ok(out)
}

async fn generate_grouped(
    pool: &SqlitePool,
    docs: &[DocumentRecord],
    output_dir: &Path,
    group: &str,
) -> Result<PathBuf> {
    let mut groups: BTreeMap<String, Vec<&DocumentRecord>> = BTreeMap::new();

    match group {
        "concept" => {
            let rows = sqlx::query(
                r#"
                SELECT c.name, dc.document_id
                FROM concepts c
                JOIN document_concepts dc ON dc.concept_id = c.id
                ORDER BY c.name ASC
                "#,
            )
            .fetch_all(pool)
            .await?;
            for row in &rows {
                let name: String = row.get("name");
                let document_id: i64 = row.get("document_id");
                if let Some(doc) = docs.iter().find(|d| d.id == document_id) {
                    groups.entry(name).or_default().push(doc);
                }
            }
        }
        "category" => {
            for doc in docs {
                let key = if doc.category.is_empty() {
                    "(uncategorized)".to_string()
                } else {
                    doc.category.clone()
                };
                groups.entry(key).or_default().push(doc);
            }
        }
        other => {
            return Err(KeeperError::Internal(format!(
                "unknown index grouping: {other}"
            )))
        }
    }

    let out = output_dir.join(format!("by-{group}.md"));
    let mut lines = vec![
        format!("# MarkdownKeeper Index by {}", capitalize(group)),
        String::new(),
    ];
    if groups.is_empty() {
        lines.push("_No indexed documents found._".to_string());
    }
    for (name, members) in &groups {
        lines.push(format!("## {name}"));
        lines.push(String::new());
        for doc in members {
            entry_lines(doc, &mut lines);
        }
        lines.push(String::new());
    }
    write_index(&out, &lines)?;
    Ok(out)
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Generate all static index files. Returns the paths written.
pub async fn generate_all_indexes(pool: &SqlitePool, output_dir: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(output_dir)
        .map_err(|e| KeeperError::Internal(format!("creating {}: {e}", output_dir.display())))?;

    let docs = store::list_documents(pool).await?;
    let mut written = vec![generate_master(&docs, output_dir)?];
    written.push(generate_grouped(pool, &docs, output_dir, "concept").await?);
    written.push(generate_grouped(pool, &docs, output_dir, "category").await?);
    Ok(written)
}
