use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub embeddings: EmbeddingsConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WatchConfig {
    #[serde(default = "default_roots")]
    pub roots: Vec<String>,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            roots: default_roots(),
            extensions: default_extensions(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

fn default_roots() -> Vec<String> {
    vec![".".to_string()]
}
fn default_extensions() -> Vec<String> {
    vec![".md".to_string(), ".markdown".to_string()]
}
fn default_debounce_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from(".markdownkeeper/index.db")
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8765
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct MetadataConfig {
    #[serde(default)]
    pub required_frontmatter_fields: Vec<String>,
    #[serde(default)]
    pub auto_fill_category: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            ttl_seconds: default_ttl_seconds(),
        }
    }
}

fn default_cache_enabled() -> bool {
    true
}
fn default_ttl_seconds() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EmbeddingsConfig {
    /// Sentence-embedding model identifier used when the model backend is
    /// compiled in.
    #[serde(default = "default_model")]
    pub model: String,
    /// `"model"` or `"hash"`. The hash fallback is always available.
    #[serde(default = "default_backend")]
    pub backend: String,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            backend: default_backend(),
        }
    }
}

fn default_model() -> String {
    "all-MiniLM-L6-v2".to_string()
}
fn default_backend() -> String {
    "hash".to_string()
}

pub const DEFAULT_CONFIG_PATH: &str = "markdownkeeper.toml";

/// Load configuration from a TOML file. A missing file yields the default
/// configuration so every command works out of the box.
pub fn load_config(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    match config.embeddings.backend.as_str() {
        "hash" | "model" => {}
        other => anyhow::bail!(
            "Unknown embeddings backend: '{}'. Must be hash or model.",
            other
        ),
    }

    if config.watch.extensions.is_empty() {
        anyhow::bail!("watch.extensions must not be empty");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_config(Path::new("/nonexistent/markdownkeeper.toml")).unwrap();
        assert_eq!(config.watch.debounce_ms, 500);
        assert_eq!(config.cache.ttl_seconds, 3600);
        assert_eq!(config.api.port, 8765);
        assert_eq!(config.embeddings.backend, "hash");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markdownkeeper.toml");
        std::fs::write(&path, "[watch]\nroots = [\"/docs\"]\n").unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.watch.roots, vec!["/docs".to_string()]);
        assert_eq!(config.watch.extensions, vec![".md", ".markdown"]);
        assert!(config.cache.enabled);
    }

    #[test]
    fn unknown_backend_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("markdownkeeper.toml");
        std::fs::write(&path, "[embeddings]\nbackend = \"quantum\"\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
