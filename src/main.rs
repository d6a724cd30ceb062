//! # MarkdownKeeper CLI (`mdkeeper`)
//!
//! The `mdkeeper` binary is the primary interface for MarkdownKeeper. It
//! provides commands for database initialization, file indexing, hybrid
//! search, document retrieval, link validation, watching, embeddings
//! management, and the JSON-RPC API server.
//!
//! ## Usage
//!
//! ```bash
//! mdkeeper --config ./markdownkeeper.toml <command>
//! ```
//!
//! Every command accepts `--db-path` (database override) and
//! `--format text|json`. Exit codes: `0` success, `1` policy violation
//! (e.g. broken links found, document not found), `2` usage error.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use markdown_keeper::config::{self, Config};
use markdown_keeper::error::KeeperError;
use markdown_keeper::models::OutputFormat;
use markdown_keeper::search::{SearchMode, SearchOptions};
use markdown_keeper::store::ContentOptions;
use markdown_keeper::watcher::{WatchMode, WatchOptions};
use markdown_keeper::{
    db, embed_cmd, eval, get, indexer, ingest, links, migrate, search, server, stats,
};

/// MarkdownKeeper — background indexing and hybrid retrieval for Markdown
/// trees.
#[derive(Parser)]
#[command(
    name = "mdkeeper",
    about = "MarkdownKeeper — index a Markdown tree and answer hybrid semantic/lexical queries",
    version
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the database path from configuration.
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Output rendering: text or json.
    #[arg(long, global = true, default_value = "text", value_parser = ["text", "json"])]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the SQLite database (idempotent).
    InitDb,

    /// Print the resolved configuration as JSON.
    ShowConfig,

    /// Parse and index a single Markdown file.
    ScanFile {
        /// Markdown file to index.
        file: PathBuf,
    },

    /// Search indexed documents.
    Query {
        /// Search phrase.
        query: String,
        /// Search mode: hybrid semantic scoring or lexical overlap only.
        #[arg(long, default_value = "semantic", value_parser = ["semantic", "lexical"])]
        mode: String,
        /// Maximum number of results.
        #[arg(long, default_value_t = 10)]
        limit: i64,
        /// Include budgeted document content in results.
        #[arg(long)]
        include_content: bool,
        /// Token budget for returned content.
        #[arg(long, default_value_t = 200)]
        max_tokens: i64,
        /// Only return chunks whose heading path contains this substring.
        #[arg(long)]
        section: Option<String>,
    },

    /// Retrieve a document by id.
    GetDoc {
        /// Document id.
        id: i64,
        /// Include budgeted document content.
        #[arg(long)]
        include_content: bool,
        /// Token budget for returned content.
        #[arg(long)]
        max_tokens: Option<i64>,
        /// Only return chunks whose heading path contains this substring.
        #[arg(long)]
        section: Option<String>,
    },

    /// Find documents declaring or mentioning a concept.
    FindConcept {
        /// Concept name (case-insensitive).
        concept: String,
        /// Maximum number of results.
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },

    /// Validate indexed links. Exits 1 when any link is broken.
    CheckLinks {
        /// Also probe external links over HTTP.
        #[arg(long)]
        check_external: bool,
    },

    /// Generate static Markdown index files.
    BuildIndex {
        /// Directory the index files are written to.
        #[arg(long, default_value = "_index")]
        output_dir: PathBuf,
    },

    /// Watch the configured roots and index changes continuously.
    Watch {
        /// Watcher backend selection.
        #[arg(long, default_value = "auto", value_parser = ["auto", "notify", "polling"])]
        mode: String,
        /// Poll interval / notify tick in seconds.
        #[arg(long, default_value_t = 1.0)]
        interval: f64,
        /// Stop after this many polling iterations.
        #[arg(long)]
        iterations: Option<u64>,
        /// Stop after this many seconds (notify mode).
        #[arg(long)]
        duration: Option<f64>,
    },

    /// Run the JSON-RPC API server.
    ServeApi {
        /// Bind host (overrides config).
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides config).
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show system statistics.
    Stats,

    /// Show a health report: metadata gaps, broken links, failed events.
    Report,

    /// Regenerate all document and chunk embeddings.
    EmbeddingsGenerate,

    /// Show embedding coverage and staleness.
    EmbeddingsStatus,

    /// Evaluate retrieval precision@k against a JSON case file.
    EmbeddingsEval {
        /// JSON file of `{query, expected_ids}` cases.
        cases: PathBuf,
        /// Rank cutoff.
        #[arg(long, default_value_t = 5)]
        k: i64,
    },

    /// Benchmark semantic query latency against a JSON case file.
    SemanticBenchmark {
        /// JSON file of `{query, expected_ids}` cases.
        cases: PathBuf,
        /// Rank cutoff.
        #[arg(long, default_value_t = 5)]
        k: i64,
        /// Repetitions of the full case file.
        #[arg(long, default_value_t = 1)]
        iterations: u64,
    },
}

fn output_format(raw: &str) -> OutputFormat {
    match raw {
        "json" => OutputFormat::Json,
        _ => OutputFormat::Text,
    }
}

async fn open_database(config: &Config) -> anyhow::Result<sqlx::SqlitePool> {
    let pool = db::connect(&config.storage.database_path).await?;
    migrate::run_migrations(&pool).await?;
    Ok(pool)
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = config::load_config(&cli.config)?;
    if let Some(db_path) = &cli.db_path {
        config.storage.database_path = db_path.clone();
    }
    let format = output_format(&cli.format);

    match cli.command {
        Commands::InitDb => {
            let pool = open_database(&config).await?;
            pool.close().await;
            println!(
                "Initialized database at {}",
                config.storage.database_path.display()
            );
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::ScanFile { file } => {
            let pool = open_database(&config).await?;
            match ingest::scan_file(&pool, &config, &file).await {
                Ok(document_id) => match format {
                    OutputFormat::Json => {
                        println!(
                            "{}",
                            serde_json::json!({
                                "document_id": document_id,
                                "path": file.display().to_string(),
                            })
                        );
                    }
                    OutputFormat::Text => {
                        println!("Indexed {} as id={document_id}", file.display());
                    }
                },
                Err(KeeperError::NotFound(msg)) => {
                    eprintln!("{msg}");
                    return Ok(1);
                }
                Err(err) => return Err(err.into()),
            }
            pool.close().await;
        }
        Commands::Query {
            query,
            mode,
            limit,
            include_content,
            max_tokens,
            section,
        } => {
            let pool = open_database(&config).await?;
            let options = SearchOptions {
                mode: SearchMode::parse(&mode).unwrap_or(SearchMode::Semantic),
                limit,
                include_content,
                max_tokens: Some(max_tokens),
                section,
            };
            search::run_query(&pool, &config, &query, &options, format).await?;
            pool.close().await;
        }
        Commands::GetDoc {
            id,
            include_content,
            max_tokens,
            section,
        } => {
            let pool = open_database(&config).await?;
            let options = ContentOptions {
                include_content,
                max_tokens,
                section,
            };
            match get::run_get(&pool, id, &options, format).await {
                Ok(()) => {}
                Err(KeeperError::NotFound(_)) => {
                    eprintln!("Document id={id} not found");
                    return Ok(1);
                }
                Err(err) => return Err(err.into()),
            }
            pool.close().await;
        }
        Commands::FindConcept { concept, limit } => {
            let pool = open_database(&config).await?;
            let documents =
                markdown_keeper::store::find_by_concept(&pool, &concept, limit).await?;
            match format {
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&serde_json::json!({
                            "concept": concept,
                            "count": documents.len(),
                            "documents": documents,
                        }))?
                    );
                }
                OutputFormat::Text => {
                    for doc in &documents {
                        println!("[{}] {} ({})", doc.id, doc.title, doc.path);
                    }
                }
            }
            pool.close().await;
        }
        Commands::CheckLinks { check_external } => {
            let pool = open_database(&config).await?;
            let any_broken = links::run_check_links(&pool, check_external, format).await?;
            pool.close().await;
            if any_broken {
                return Ok(1);
            }
        }
        Commands::BuildIndex { output_dir } => {
            let pool = open_database(&config).await?;
            let written = indexer::generate_all_indexes(&pool, &output_dir).await?;
            for path in &written {
                println!("Wrote index: {}", path.display());
            }
            pool.close().await;
        }
        Commands::Watch {
            mode,
            interval,
            iterations,
            duration,
        } => {
            let pool = open_database(&config).await?;
            let options = WatchOptions {
                mode: WatchMode::parse(&mode).unwrap_or(WatchMode::Auto),
                interval_s: interval,
                iterations,
                duration_s: duration,
            };
            let (used_mode, summary) =
                markdown_keeper::watcher::run_watch(&pool, &config, &options).await?;
            println!(
                "watch summary mode={used_mode} created={} modified={} deleted={}",
                summary.created, summary.modified, summary.deleted
            );
            pool.close().await;
        }
        Commands::ServeApi { host, port } => {
            let pool = open_database(&config).await?;
            let bind_host = host.unwrap_or_else(|| config.api.host.clone());
            let bind_port = port.unwrap_or(config.api.port);
            println!("Starting API server on {bind_host}:{bind_port}");
            server::run_server(pool, config, &bind_host, bind_port).await?;
        }
        Commands::Stats => {
            let pool = open_database(&config).await?;
            stats::run_stats(&pool, &config, format).await?;
            pool.close().await;
        }
        Commands::Report => {
            let pool = open_database(&config).await?;
            stats::run_report(&pool, &config, format).await?;
            pool.close().await;
        }
        Commands::EmbeddingsGenerate => {
            let pool = open_database(&config).await?;
            embed_cmd::run_generate(&pool, &config, format).await?;
            pool.close().await;
        }
        Commands::EmbeddingsStatus => {
            let pool = open_database(&config).await?;
            embed_cmd::run_status(&pool, &config, format).await?;
            pool.close().await;
        }
        Commands::EmbeddingsEval { cases, k } => {
            let pool = open_database(&config).await?;
            eval::run_eval(&pool, &config, &cases, k, format).await?;
            pool.close().await;
        }
        Commands::SemanticBenchmark {
            cases,
            k,
            iterations,
        } => {
            let pool = open_database(&config).await?;
            eval::run_benchmark(&pool, &config, &cases, k, iterations, format).await?;
            pool.close().await;
        }
    }

    Ok(0)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let code = run(cli).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
