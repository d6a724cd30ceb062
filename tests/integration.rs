use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn mdkeeper_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("mdkeeper");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let docs_dir = root.join("docs");
    fs::create_dir_all(&docs_dir).unwrap();

    fs::write(
        docs_dir.join("alpha.md"),
        "---\ntitle: Alpha\ntags: infra\nconcepts: kubernetes\n---\n# Alpha\n\nkubernetes deployment guide\n\n## Prerequisites\n\nInstall kubectl before anything else.\n\n## Steps\n\nApply the manifest with kubectl apply.\n",
    )
    .unwrap();
    fs::write(
        docs_dir.join("beta.md"),
        "# Beta\n\nNotes about cooking pasta at home.\n",
    )
    .unwrap();

    let config_content = format!(
        r#"[watch]
roots = ["{docs}"]
extensions = [".md", ".markdown"]
debounce_ms = 50

[storage]
database_path = "{root}/data/index.db"

[api]
host = "127.0.0.1"
port = 8765

[cache]
enabled = true
ttl_seconds = 3600

[embeddings]
backend = "hash"
"#,
        docs = docs_dir.display(),
        root = root.display(),
    );

    let config_path = root.join("markdownkeeper.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_mdkeeper(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = mdkeeper_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run mdkeeper binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn scan(config_path: &Path, file: &Path) -> i64 {
    let (stdout, stderr, success) = run_mdkeeper(
        config_path,
        &["--format", "json", "scan-file", file.to_str().unwrap()],
    );
    assert!(success, "scan-file failed: {stdout} {stderr}");
    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    payload["document_id"].as_i64().unwrap()
}

#[test]
fn init_db_creates_database_and_is_idempotent() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_mdkeeper(&config_path, &["init-db"]);
    assert!(success, "init failed: {stdout} {stderr}");
    assert!(stdout.contains("Initialized database"));
    assert!(tmp.path().join("data/index.db").exists());

    let (_, _, success) = run_mdkeeper(&config_path, &["init-db"]);
    assert!(success, "second init failed (not idempotent)");
}

#[test]
fn scan_and_query_ranks_matching_document_first() {
    let (tmp, config_path) = setup_test_env();
    run_mdkeeper(&config_path, &["init-db"]);

    let alpha = tmp.path().join("docs/alpha.md");
    let beta = tmp.path().join("docs/beta.md");
    let alpha_id = scan(&config_path, &alpha);
    scan(&config_path, &beta);

    let (stdout, stderr, success) =
        run_mdkeeper(&config_path, &["--format", "json", "query", "kubernetes"]);
    assert!(success, "query failed: {stdout} {stderr}");
    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!(payload["count"].as_i64().unwrap() >= 1);
    assert_eq!(payload["documents"][0]["id"].as_i64().unwrap(), alpha_id);
    assert!(payload["documents"][0]["score"].as_f64().unwrap() > 0.0);
}

#[test]
fn query_lexical_mode_matches() {
    let (tmp, config_path) = setup_test_env();
    run_mdkeeper(&config_path, &["init-db"]);
    scan(&config_path, &tmp.path().join("docs/beta.md"));

    let (stdout, _, success) = run_mdkeeper(
        &config_path,
        &["--format", "json", "query", "pasta", "--mode", "lexical"],
    );
    assert!(success);
    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(payload["search_mode"], "lexical");
    assert_eq!(payload["count"].as_i64().unwrap(), 1);
}

#[test]
fn get_doc_section_filter_returns_only_matching_chunks() {
    let (tmp, config_path) = setup_test_env();
    run_mdkeeper(&config_path, &["init-db"]);
    let id = scan(&config_path, &tmp.path().join("docs/alpha.md"));

    let (stdout, stderr, success) = run_mdkeeper(
        &config_path,
        &[
            "--format",
            "json",
            "get-doc",
            &id.to_string(),
            "--include-content",
            "--section",
            "Steps",
        ],
    );
    assert!(success, "get-doc failed: {stdout} {stderr}");
    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let content = payload["content"].as_str().unwrap();
    assert!(content.contains("Apply the manifest"));
    assert!(!content.contains("Install kubectl"));
}

#[test]
fn get_doc_missing_id_exits_nonzero() {
    let (_tmp, config_path) = setup_test_env();
    run_mdkeeper(&config_path, &["init-db"]);

    let (_, stderr, success) = run_mdkeeper(&config_path, &["get-doc", "424242"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[test]
fn check_links_reports_broken_and_exits_nonzero() {
    let (tmp, config_path) = setup_test_env();
    run_mdkeeper(&config_path, &["init-db"]);

    let doc = tmp.path().join("docs/broken.md");
    fs::write(&doc, "# Broken\n\nSee [missing](./nope.md).\n").unwrap();
    scan(&config_path, &doc);

    let (stdout, _, success) =
        run_mdkeeper(&config_path, &["--format", "json", "check-links"]);
    assert!(!success, "expected exit 1 with broken links: {stdout}");
    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(payload["broken"].as_i64().unwrap(), 1);
    assert_eq!(payload["broken_links"][0]["target"], "./nope.md");
}

#[test]
fn check_links_passes_on_valid_targets() {
    let (tmp, config_path) = setup_test_env();
    run_mdkeeper(&config_path, &["init-db"]);

    let doc = tmp.path().join("docs/linked.md");
    fs::write(&doc, "# Linked\n\nSee [beta](./beta.md).\n").unwrap();
    scan(&config_path, &doc);

    let (stdout, _, success) = run_mdkeeper(&config_path, &["check-links"]);
    assert!(success, "expected exit 0: {stdout}");
}

#[test]
fn find_concept_returns_declared_document() {
    let (tmp, config_path) = setup_test_env();
    run_mdkeeper(&config_path, &["init-db"]);
    scan(&config_path, &tmp.path().join("docs/alpha.md"));

    let (stdout, _, success) = run_mdkeeper(
        &config_path,
        &["--format", "json", "find-concept", "kubernetes"],
    );
    assert!(success);
    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(payload["count"].as_i64().unwrap(), 1);
    assert_eq!(payload["documents"][0]["title"], "Alpha");
}

#[test]
fn build_index_writes_all_index_files() {
    let (tmp, config_path) = setup_test_env();
    run_mdkeeper(&config_path, &["init-db"]);
    scan(&config_path, &tmp.path().join("docs/alpha.md"));

    let out_dir = tmp.path().join("_index");
    let (stdout, stderr, success) = run_mdkeeper(
        &config_path,
        &["build-index", "--output-dir", out_dir.to_str().unwrap()],
    );
    assert!(success, "build-index failed: {stdout} {stderr}");
    assert!(out_dir.join("master.md").exists());
    assert!(out_dir.join("by-concept.md").exists());
    assert!(out_dir.join("by-category.md").exists());
}

#[test]
fn watch_polling_iteration_indexes_tree() {
    let (_tmp, config_path) = setup_test_env();
    run_mdkeeper(&config_path, &["init-db"]);

    let (stdout, stderr, success) = run_mdkeeper(
        &config_path,
        &[
            "watch",
            "--mode",
            "polling",
            "--iterations",
            "1",
            "--interval",
            "0.1",
        ],
    );
    assert!(success, "watch failed: {stdout} {stderr}");
    assert!(stdout.contains("mode=polling"));
    assert!(stdout.contains("created=2"), "unexpected summary: {stdout}");

    let (qout, _, _) = run_mdkeeper(&config_path, &["--format", "json", "query", "kubernetes"]);
    let payload: serde_json::Value = serde_json::from_str(&qout).unwrap();
    assert!(payload["count"].as_i64().unwrap() >= 1);
}

#[test]
fn stats_reports_counts_and_queue() {
    let (tmp, config_path) = setup_test_env();
    run_mdkeeper(&config_path, &["init-db"]);
    scan(&config_path, &tmp.path().join("docs/alpha.md"));

    let (stdout, _, success) = run_mdkeeper(&config_path, &["--format", "json", "stats"]);
    assert!(success);
    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(payload["documents"].as_i64().unwrap(), 1);
    assert_eq!(payload["queue"]["failed"].as_i64().unwrap(), 0);
    assert_eq!(payload["embeddings"]["embedded"].as_i64().unwrap(), 1);
}

#[test]
fn embeddings_generate_and_status_roundtrip() {
    let (tmp, config_path) = setup_test_env();
    run_mdkeeper(&config_path, &["init-db"]);
    scan(&config_path, &tmp.path().join("docs/alpha.md"));

    let (stdout, stderr, success) = run_mdkeeper(&config_path, &["embeddings-generate"]);
    assert!(success, "embeddings-generate failed: {stdout} {stderr}");

    let (stdout, _, success) =
        run_mdkeeper(&config_path, &["--format", "json", "embeddings-status"]);
    assert!(success);
    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(payload["missing"].as_i64().unwrap(), 0);
    assert_eq!(payload["chunk_missing"].as_i64().unwrap(), 0);
    assert_eq!(payload["backend"], "hash-v1");
    assert_eq!(payload["stale"].as_i64().unwrap(), 0);
}

#[test]
fn embeddings_eval_scores_expected_documents() {
    let (tmp, config_path) = setup_test_env();
    run_mdkeeper(&config_path, &["init-db"]);
    let id = scan(&config_path, &tmp.path().join("docs/alpha.md"));

    let cases = tmp.path().join("cases.json");
    fs::write(
        &cases,
        format!(r#"[{{"query": "kubernetes deployment", "expected_ids": [{id}]}}]"#),
    )
    .unwrap();

    let (stdout, stderr, success) = run_mdkeeper(
        &config_path,
        &[
            "--format",
            "json",
            "embeddings-eval",
            cases.to_str().unwrap(),
            "--k",
            "1",
        ],
    );
    assert!(success, "embeddings-eval failed: {stdout} {stderr}");
    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert!((payload["precision_at_k"].as_f64().unwrap() - 1.0).abs() < 1e-9);
}

#[test]
fn semantic_benchmark_reports_latency() {
    let (tmp, config_path) = setup_test_env();
    run_mdkeeper(&config_path, &["init-db"]);
    scan(&config_path, &tmp.path().join("docs/alpha.md"));

    let cases = tmp.path().join("cases.json");
    fs::write(&cases, r#"[{"query": "kubernetes", "expected_ids": []}]"#).unwrap();

    let (stdout, stderr, success) = run_mdkeeper(
        &config_path,
        &[
            "--format",
            "json",
            "semantic-benchmark",
            cases.to_str().unwrap(),
            "--iterations",
            "2",
        ],
    );
    assert!(success, "benchmark failed: {stdout} {stderr}");
    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(payload["iterations"].as_i64().unwrap(), 2);
    assert!(payload["latency_ms"]["p95"].as_f64().unwrap() >= 0.0);
}

#[test]
fn show_config_prints_resolved_configuration() {
    let (_tmp, config_path) = setup_test_env();
    let (stdout, _, success) = run_mdkeeper(&config_path, &["show-config"]);
    assert!(success);
    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(payload["watch"]["debounce_ms"].as_i64().unwrap(), 50);
    assert_eq!(payload["embeddings"]["backend"], "hash");
}

#[test]
fn reindex_after_edit_updates_content() {
    let (tmp, config_path) = setup_test_env();
    run_mdkeeper(&config_path, &["init-db"]);
    let doc = tmp.path().join("docs/alpha.md");
    let id = scan(&config_path, &doc);

    fs::write(&doc, "# Alpha\n\nrewritten about terraform now\n").unwrap();
    let id2 = scan(&config_path, &doc);
    assert_eq!(id, id2, "path identity must be stable across edits");

    let (stdout, _, _) = run_mdkeeper(&config_path, &["--format", "json", "query", "terraform"]);
    let payload: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(payload["documents"][0]["id"].as_i64().unwrap(), id);
}
