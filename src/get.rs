//! Document retrieval for `mdkeeper get-doc`.
//!
//! Fetches the full document view from the store and renders it as text or
//! JSON. Content honors the same section filter and token budget the HTTP
//! API exposes.

use sqlx::SqlitePool;

use crate::error::Result;
use crate::models::OutputFormat;
use crate::store::{self, ContentOptions};

pub async fn run_get(
    pool: &SqlitePool,
    document_id: i64,
    options: &ContentOptions,
    format: OutputFormat,
) -> Result<()> {
    let detail = store::get_document(pool, document_id, options).await?;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
        OutputFormat::Text => {
            println!("[{}] {}", detail.record.id, detail.record.title);
            println!("Path: {}", detail.record.path);
            println!("Summary: {}", detail.record.summary);
            if !detail.record.category.is_empty() {
                println!("Category: {}", detail.record.category);
            }
            if !detail.tags.is_empty() {
                println!("Tags: {}", detail.tags.join(", "));
            }
            if !detail.concepts.is_empty() {
                println!("Concepts: {}", detail.concepts.join(", "));
            }
            println!(
                "Headings: {} Links: {}",
                detail.headings.len(),
                detail.links.len()
            );
            if options.include_content && !detail.content.is_empty() {
                println!("Content:");
                println!("{}", detail.content);
            }
        }
    }
    Ok(())
}
