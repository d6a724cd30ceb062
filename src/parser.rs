//! Markdown parser: raw text → structured [`ParsedDocument`].
//!
//! Pure function, no I/O. Parsing the same text twice yields byte-identical
//! output, and `content_hash` is always the SHA-256 of the raw input.
//!
//! The parser is lenient: frontmatter without a closing delimiter is treated
//! as body text, and malformed lines inside frontmatter are skipped rather
//! than rejected.

use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::models::{
    Frontmatter, FrontmatterValue, ParsedChunk, ParsedDocument, ParsedHeading, ParsedLink,
};

/// Maximum words per chunk; longer paragraphs are split at word boundaries.
pub const CHUNK_MAX_WORDS: usize = 120;

/// Maximum whitespace-separated tokens in a generated summary.
const SUMMARY_MAX_TOKENS: usize = 150;

/// Number of extracted concepts to keep.
const CONCEPT_LIMIT: usize = 10;

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(#{1,6})\s+(.+?)\s*$").unwrap())
}

fn inline_link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[[^\]]*\]\(([^)]+)\)").unwrap())
}

fn autolink_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<([a-z][a-z0-9+.-]*://[^>\s]+)>").unwrap())
}

fn scheme_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9+.-]*://").unwrap())
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z][A-Za-z0-9_-]{2,}").unwrap())
}

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "this", "that", "from", "into", "your", "guide", "docs",
    "markdown", "are", "was", "were", "been", "being", "have", "has", "had", "does", "did",
    "will", "would", "could", "should", "may", "might", "can", "shall", "not", "but", "also",
    "than", "then", "when", "where", "how", "what", "which", "who", "whom", "why", "all",
    "each", "every", "both", "few", "more", "most", "other", "some", "such", "only", "own",
    "same", "too", "very", "just", "use", "using", "used",
];

fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word)
}

/// Turn heading text into a slug anchor: lowercase, non-alphanumeric runs
/// become a single `-`, leading/trailing dashes trimmed.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut last_dash = true;
    for ch in text.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_matches('-').to_string()
}

/// Tokenize text with the parser's word rule: lowercase matches of
/// `[A-Za-z][A-Za-z0-9_-]{2,}`. Shared by concept extraction, lexical
/// scoring, and the hash embedding backend.
pub fn tokenize(text: &str) -> Vec<String> {
    word_re()
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Parse raw Markdown text into its structured representation.
pub fn parse(text: &str) -> ParsedDocument {
    let content_hash = {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    };

    let (frontmatter, body) = parse_frontmatter(text);

    let headings = extract_headings(&body);
    let chunks = extract_chunks(&body);
    let links = extract_links(&body);

    let title = frontmatter
        .get("title")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .filter(|t| !t.is_empty())
        .or_else(|| headings.first().map(|h| h.text.clone()))
        .unwrap_or_else(|| "Untitled".to_string());

    let summary = frontmatter
        .get("summary")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| generate_summary(&title, &headings, &body));

    let category = frontmatter
        .get("category")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .filter(|c| !c.is_empty());

    let tags = frontmatter
        .get("tags")
        .map(|v| v.as_list())
        .unwrap_or_default();

    let declared_concepts = frontmatter
        .get("concepts")
        .map(|v| v.as_list())
        .unwrap_or_default();
    let concepts = if declared_concepts.is_empty() {
        extract_concepts(&body, &headings)
    } else {
        declared_concepts
    };

    let token_estimate = body.split_whitespace().count() as i64;

    ParsedDocument {
        title,
        summary,
        category,
        body,
        token_estimate,
        content_hash,
        frontmatter,
        tags,
        concepts,
        headings,
        links,
        chunks,
    }
}

/// Split off a leading frontmatter block delimited by `---` lines.
///
/// Returns the parsed key/value map and the remaining body. Text that does
/// not start with a frontmatter fence, or that never closes it, is returned
/// unchanged as body with an empty map.
fn parse_frontmatter(text: &str) -> (Frontmatter, String) {
    let mut lines = text.lines();
    if lines.next().map(str::trim_end) != Some("---") {
        return (BTreeMap::new(), text.to_string());
    }

    let mut fm_lines: Vec<&str> = Vec::new();
    let mut closed = false;
    let mut consumed = text.lines().next().map(|l| l.len() + 1).unwrap_or(0);
    for line in lines {
        consumed += line.len() + 1;
        if line.trim_end() == "---" {
            closed = true;
            break;
        }
        fm_lines.push(line);
    }

    if !closed {
        return (BTreeMap::new(), text.to_string());
    }

    let mut map: Frontmatter = BTreeMap::new();
    for line in fm_lines {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim().to_string();
        if key.is_empty() {
            continue;
        }
        let raw = value.trim().trim_matches('"').to_string();
        map.insert(key.clone(), parse_value(&key, &raw));
    }

    let body = if consumed >= text.len() {
        String::new()
    } else {
        text[consumed..].to_string()
    };
    (map, body)
}

/// Type a raw frontmatter value. `tags` and `concepts` always normalize to a
/// list regardless of input shape.
fn parse_value(key: &str, raw: &str) -> FrontmatterValue {
    if key == "tags" || key == "concepts" {
        let items: Vec<String> = raw
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty())
            .collect();
        return FrontmatterValue::List(items);
    }
    match raw {
        "true" => FrontmatterValue::Bool(true),
        "false" => FrontmatterValue::Bool(false),
        _ => {
            if let Ok(n) = raw.parse::<i64>() {
                FrontmatterValue::Int(n)
            } else {
                FrontmatterValue::Str(raw.to_string())
            }
        }
    }
}

fn extract_headings(body: &str) -> Vec<ParsedHeading> {
    let mut headings = Vec::new();
    for line in body.lines() {
        if let Some(caps) = heading_re().captures(line) {
            let text = caps[2].trim().to_string();
            headings.push(ParsedHeading {
                level: caps[1].len() as u8,
                anchor: slugify(&text),
                ordinal: headings.len() as i64,
                text,
            });
        }
    }
    headings
}

/// Walk the body emitting chunks: blank lines and heading lines close the
/// current paragraph, headings additionally update the enclosing-heading
/// stack that becomes each chunk's `heading_path`.
fn extract_chunks(body: &str) -> Vec<ParsedChunk> {
    let mut chunks: Vec<ParsedChunk> = Vec::new();
    let mut stack: Vec<(u8, String)> = Vec::new();
    let mut paragraph: Vec<&str> = Vec::new();

    let flush = |paragraph: &mut Vec<&str>, stack: &[(u8, String)], chunks: &mut Vec<ParsedChunk>| {
        if paragraph.is_empty() {
            return;
        }
        let heading_path = stack
            .iter()
            .map(|(_, text)| text.as_str())
            .collect::<Vec<_>>()
            .join("/");
        let content = paragraph.join("\n");
        paragraph.clear();
        let words: Vec<&str> = content.split_whitespace().collect();
        if words.is_empty() {
            return;
        }
        if words.len() <= CHUNK_MAX_WORDS {
            // Short paragraphs keep their original whitespace.
            let token_count = words.len() as i64;
            chunks.push(ParsedChunk {
                ordinal: chunks.len() as i64,
                heading_path,
                content,
                token_count,
            });
        } else {
            for subset in words.chunks(CHUNK_MAX_WORDS) {
                chunks.push(ParsedChunk {
                    ordinal: chunks.len() as i64,
                    heading_path: heading_path.clone(),
                    content: subset.join(" "),
                    token_count: subset.len() as i64,
                });
            }
        }
    };

    for line in body.lines() {
        if line.trim().is_empty() {
            flush(&mut paragraph, &stack, &mut chunks);
            continue;
        }
        if let Some(caps) = heading_re().captures(line) {
            flush(&mut paragraph, &stack, &mut chunks);
            let level = caps[1].len() as u8;
            let text = caps[2].trim().to_string();
            while stack.last().is_some_and(|(l, _)| *l >= level) {
                stack.pop();
            }
            stack.push((level, text));
            continue;
        }
        paragraph.push(line);
    }
    flush(&mut paragraph, &stack, &mut chunks);

    chunks
}

fn extract_links(body: &str) -> Vec<ParsedLink> {
    let mut links = Vec::new();
    for caps in inline_link_re().captures_iter(body) {
        let target = caps[1].trim().to_string();
        links.push(ParsedLink {
            is_external: scheme_re().is_match(&target),
            target,
        });
    }
    for caps in autolink_re().captures_iter(body) {
        let target = caps[1].trim().to_string();
        links.push(ParsedLink {
            is_external: true,
            target,
        });
    }
    links
}

/// Structured auto-summary: `"{title}. Covers: {h2 list}. {first paragraph}"`,
/// truncated to 150 whitespace-separated tokens.
fn generate_summary(title: &str, headings: &[ParsedHeading], body: &str) -> String {
    let mut parts: Vec<String> = Vec::new();

    if !title.is_empty() && title != "Untitled" {
        parts.push(format!("{title}."));
    }

    let h2s: Vec<&str> = headings
        .iter()
        .filter(|h| h.level == 2)
        .map(|h| h.text.as_str())
        .collect();
    if !h2s.is_empty() {
        parts.push(format!("Covers: {}.", h2s.join(", ")));
    }

    for paragraph in body.split("\n\n") {
        let trimmed = paragraph.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        parts.push(trimmed.to_string());
        break;
    }

    let joined = parts.join(" ");
    let words: Vec<&str> = joined.split_whitespace().collect();
    if words.len() > SUMMARY_MAX_TOKENS {
        words[..SUMMARY_MAX_TOKENS].join(" ")
    } else {
        joined
    }
}

/// Term-frequency concept extraction: body words count once, heading words
/// twice; ties break lexicographically.
fn extract_concepts(body: &str, headings: &[ParsedHeading]) -> Vec<String> {
    let mut counts: BTreeMap<String, i64> = BTreeMap::new();

    for m in word_re().find_iter(body) {
        let word = m.as_str().to_lowercase();
        if is_stopword(&word) {
            continue;
        }
        *counts.entry(word).or_insert(0) += 1;
    }

    for heading in headings {
        for m in word_re().find_iter(&heading.text) {
            let word = m.as_str().to_lowercase();
            if is_stopword(&word) {
                continue;
            }
            *counts.entry(word).or_insert(0) += 2;
        }
    }

    let mut ranked: Vec<(String, i64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked
        .into_iter()
        .take(CONCEPT_LIMIT)
        .map(|(word, _)| word)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_matches_sha256_of_input() {
        let text = "# Hello\n\nworld";
        let parsed = parse(text);
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        assert_eq!(parsed.content_hash, format!("{:x}", hasher.finalize()));
    }

    #[test]
    fn parse_is_deterministic() {
        let text = "---\ntitle: Stable\ntags: a, b\n---\n# One\n\nBody text here.\n";
        let first = parse(text);
        let second = parse(text);
        assert_eq!(first.title, second.title);
        assert_eq!(first.summary, second.summary);
        assert_eq!(first.concepts, second.concepts);
        assert_eq!(first.chunks, second.chunks);
        assert_eq!(first.content_hash, second.content_hash);
    }

    #[test]
    fn frontmatter_typed_values() {
        let text = "---\ntitle: Typed\ndraft: true\npriority: 7\ntags: rust, sqlite\n---\nBody";
        let parsed = parse(text);
        assert_eq!(parsed.frontmatter.get("draft"), Some(&FrontmatterValue::Bool(true)));
        assert_eq!(parsed.frontmatter.get("priority"), Some(&FrontmatterValue::Int(7)));
        assert_eq!(parsed.tags, vec!["rust", "sqlite"]);
        assert_eq!(parsed.title, "Typed");
    }

    #[test]
    fn unclosed_frontmatter_is_body() {
        let text = "---\ntitle: Broken\nno closing fence";
        let parsed = parse(text);
        assert!(parsed.frontmatter.is_empty());
        assert_eq!(parsed.body, text);
    }

    #[test]
    fn headings_dense_ordinals_and_anchors() {
        let text = "# First Heading\n\ntext\n\n## Sub Section!\n\nmore";
        let parsed = parse(text);
        assert_eq!(parsed.headings.len(), 2);
        assert_eq!(parsed.headings[0].ordinal, 0);
        assert_eq!(parsed.headings[1].ordinal, 1);
        assert_eq!(parsed.headings[0].anchor, "first-heading");
        assert_eq!(parsed.headings[1].anchor, "sub-section");
        assert_eq!(parsed.headings[1].level, 2);
    }

    #[test]
    fn slugify_collapses_runs() {
        assert_eq!(slugify("A  --  Messy *** Title"), "a-messy-title");
        assert_eq!(slugify("Plain"), "plain");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn chunks_carry_heading_path() {
        let text = "# Install\n\nIntro paragraph.\n\n## Prerequisites\n\nNeed rust.\n\n## Steps\n\nRun make.";
        let parsed = parse(text);
        let paths: Vec<&str> = parsed.chunks.iter().map(|c| c.heading_path.as_str()).collect();
        assert_eq!(paths, vec!["Install", "Install/Prerequisites", "Install/Steps"]);
        assert_eq!(parsed.chunks[2].content, "Run make.");
        // Dense ordinals
        for (i, chunk) in parsed.chunks.iter().enumerate() {
            assert_eq!(chunk.ordinal, i as i64);
        }
    }

    #[test]
    fn sibling_heading_replaces_stack_entry() {
        let text = "# Top\n\n## A\n\nalpha\n\n## B\n\nbeta\n\n### B1\n\ndeep";
        let parsed = parse(text);
        let paths: Vec<&str> = parsed.chunks.iter().map(|c| c.heading_path.as_str()).collect();
        assert_eq!(paths, vec!["Top/A", "Top/B", "Top/B/B1"]);
    }

    #[test]
    fn long_paragraph_splits_at_word_boundary() {
        let body = (0..300).map(|i| format!("word{i}")).collect::<Vec<_>>().join(" ");
        let parsed = parse(&body);
        assert_eq!(parsed.chunks.len(), 3);
        assert_eq!(parsed.chunks[0].token_count, 120);
        assert_eq!(parsed.chunks[1].token_count, 120);
        assert_eq!(parsed.chunks[2].token_count, 60);
    }

    #[test]
    fn short_paragraph_preserves_whitespace() {
        let text = "line one  with  spacing\nline two";
        let parsed = parse(text);
        assert_eq!(parsed.chunks[0].content, text);
    }

    #[test]
    fn links_classified_by_scheme() {
        let text = "See [docs](./other.md) and [site](https://example.com) plus <ftp://host/file>.";
        let parsed = parse(text);
        assert_eq!(parsed.links.len(), 3);
        assert!(!parsed.links[0].is_external);
        assert!(parsed.links[1].is_external);
        assert!(parsed.links[2].is_external);
        assert_eq!(parsed.links[2].target, "ftp://host/file");
    }

    #[test]
    fn title_falls_back_to_first_heading_then_untitled() {
        assert_eq!(parse("# From Heading\n\ntext").title, "From Heading");
        assert_eq!(parse("no headings at all").title, "Untitled");
        assert_eq!(parse("---\ntitle: Front\n---\n# Ignored").title, "Front");
    }

    #[test]
    fn summary_structured_form() {
        let text = "# Deploy Guide\n\n## Build\n\n## Ship\n\nFirst real paragraph.";
        let parsed = parse(text);
        assert!(parsed.summary.starts_with("Deploy Guide. Covers: Build, Ship."));
        assert!(parsed.summary.contains("First real paragraph."));
    }

    #[test]
    fn summary_truncated_by_tokens() {
        let long = (0..400).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let text = format!("# T\n\n{long}");
        let parsed = parse(&text);
        assert!(parsed.summary.split_whitespace().count() <= 150);
    }

    #[test]
    fn frontmatter_summary_wins() {
        let text = "---\nsummary: Hand written.\n---\n# T\n\nbody";
        assert_eq!(parse(text).summary, "Hand written.");
    }

    #[test]
    fn concepts_weighted_by_headings() {
        // "kubernetes" occurs twice in the text plus the ×2 heading bonus
        // (total 4); "deployment" five times in the body only.
        let text =
            "# Kubernetes\n\ndeployment deployment deployment deployment deployment kubernetes cluster";
        let parsed = parse(text);
        assert_eq!(parsed.concepts[0], "deployment");
        assert_eq!(parsed.concepts[1], "kubernetes");
        assert!(parsed.concepts.contains(&"cluster".to_string()));
    }

    #[test]
    fn declared_concepts_bypass_extraction() {
        let text = "---\nconcepts: alpha, beta\n---\nbody with words words words";
        assert_eq!(parse(text).concepts, vec!["alpha", "beta"]);
    }

    #[test]
    fn stopwords_excluded_from_concepts() {
        let text = "the the the and and for with unique";
        let parsed = parse(text);
        assert_eq!(parsed.concepts, vec!["unique"]);
    }

    #[test]
    fn token_estimate_counts_body_words() {
        let text = "---\ntitle: X\n---\none two three";
        assert_eq!(parse(text).token_estimate, 3);
        assert_eq!(parse("").token_estimate, 0);
    }
}
