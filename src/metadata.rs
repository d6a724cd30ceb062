//! Frontmatter schema enforcement and auto-fill.
//!
//! Driven by `[metadata]` configuration: `required_frontmatter_fields` lists
//! keys every document should declare, and `auto_fill_category` derives a
//! missing category from the file's parent directory name.
//!
//! [`missing_fields`] is the single required-field check. The ingest path
//! feeds it a [`FieldPresence`] built from the freshly parsed document; the
//! health report builds one from stored rows.

use std::collections::BTreeSet;
use std::path::Path;

use crate::config::MetadataConfig;
use crate::models::ParsedDocument;

/// Which schema-checkable fields a document declares.
///
/// Built from a parsed document at ingest time, or from stored columns for
/// reporting. `extra` holds frontmatter keys beyond the modeled columns;
/// the store does not retain arbitrary keys, so a stored-row view leaves it
/// empty and unmodeled required fields count as missing there.
#[derive(Debug, Clone, Default)]
pub struct FieldPresence {
    pub title: bool,
    pub summary: bool,
    pub category: bool,
    pub tags: bool,
    pub concepts: bool,
    pub extra: BTreeSet<String>,
}

impl FieldPresence {
    /// Presence as seen by the parser. A title derived from the first
    /// heading counts as present, matching how retrieval treats the
    /// document.
    pub fn from_parsed(parsed: &ParsedDocument) -> Self {
        Self {
            title: parsed.title != "Untitled",
            summary: parsed.frontmatter.contains_key("summary"),
            category: parsed.category.is_some(),
            tags: !parsed.tags.is_empty(),
            concepts: parsed.frontmatter.contains_key("concepts"),
            extra: parsed.frontmatter.keys().cloned().collect(),
        }
    }
}

/// Required fields missing from a document, sorted.
pub fn missing_fields(presence: &FieldPresence, required: &[String]) -> Vec<String> {
    let mut missing: Vec<String> = required
        .iter()
        .filter(|field| {
            let present = match field.as_str() {
                "title" => presence.title,
                "summary" => presence.summary,
                "category" => presence.category,
                "tags" => presence.tags,
                "concepts" => presence.concepts,
                other => presence.extra.contains(other),
            };
            !present
        })
        .cloned()
        .collect();
    missing.sort();
    missing
}

/// Fill derivable metadata in place. Currently: category from the parent
/// directory name when `auto_fill_category` is set and frontmatter omits it.
pub fn auto_fill(parsed: &mut ParsedDocument, path: &Path, config: &MetadataConfig) {
    if config.auto_fill_category && parsed.category.is_none() {
        let parent = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty());
        parsed.category = parent;
    }
}
