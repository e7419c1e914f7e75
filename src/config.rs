//! TOML configuration parsing and validation.
//!
//! Every command reads a single file (default `./config/shelf.toml`).
//! Only `[db]` is mandatory; all other sections fall back to defaults that
//! keep external services disabled, so `shelf import` and `shelf stats`
//! work with a two-line config.
//!
//! API keys never live in the file. They are read from the environment
//! (optionally populated from a `.env` file via `dotenvy`) at the moment a
//! provider is constructed.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    /// Also drop rows that have no author.
    #[serde(default)]
    pub require_author: bool,
    #[serde(default = "default_max_errors_reported")]
    pub max_errors_reported: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            require_author: false,
            max_errors_reported: default_max_errors_reported(),
        }
    }
}

fn default_max_errors_reported() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_catalog_url")]
    pub base_url: String,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_enrich_retries")]
    pub max_retries: u32,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            base_url: default_catalog_url(),
            max_workers: default_max_workers(),
            rate_limit_ms: default_rate_limit_ms(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_enrich_retries(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_catalog_url() -> String {
    "https://openlibrary.org".to_string()
}
fn default_max_workers() -> usize {
    8
}
fn default_rate_limit_ms() -> u64 {
    20
}
fn default_enrich_retries() -> u32 {
    3
}
fn default_user_agent() -> String {
    format!("shelf-insight/{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama host, or an OpenAI-compatible gateway).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            batch_size: 50,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    50
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringConfig {
    #[serde(default = "default_min_k")]
    pub min_k: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_n_init")]
    pub n_init: usize,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            min_k: default_min_k(),
            max_k: default_max_k(),
            seed: default_seed(),
            n_init: default_n_init(),
            max_iter: default_max_iter(),
        }
    }
}

fn default_min_k() -> usize {
    3
}
fn default_max_k() -> usize {
    12
}
fn default_seed() -> u64 {
    42
}
fn default_n_init() -> usize {
    10
}
fn default_max_iter() -> usize {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Name of the environment variable holding the API key. Falls back to
    /// `GEMINI_API_KEY` / `OPENAI_API_KEY` depending on the provider.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    /// Directory with `<name>.md` files replacing the built-in templates.
    #[serde(default)]
    pub prompt_dir: Option<PathBuf>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            api_key_env: None,
            temperature: None,
            max_retries: default_llm_retries(),
            timeout_secs: default_llm_timeout_secs(),
            prompt_dir: None,
        }
    }
}

fn default_llm_retries() -> u32 {
    3
}
fn default_llm_timeout_secs() -> u64 {
    120
}

impl LlmConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Environment variable consulted for the API key.
    pub fn key_var(&self) -> String {
        if let Some(var) = &self.api_key_env {
            return var.clone();
        }
        match self.provider.as_str() {
            "openai" => "OPENAI_API_KEY".to_string(),
            _ => "GEMINI_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// A config pointing at `path` with every other section defaulted.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            import: ImportConfig::default(),
            enrichment: EnrichmentConfig::default(),
            embedding: EmbeddingConfig::default(),
            clustering: ClusteringConfig::default(),
            llm: LlmConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        // Clustering bounds
        if self.clustering.min_k < 2 {
            anyhow::bail!("clustering.min_k must be >= 2");
        }
        if self.clustering.min_k > self.clustering.max_k {
            anyhow::bail!(
                "clustering.min_k ({}) must be <= clustering.max_k ({})",
                self.clustering.min_k,
                self.clustering.max_k
            );
        }
        if self.clustering.n_init == 0 {
            anyhow::bail!("clustering.n_init must be >= 1");
        }
        if self.clustering.max_iter == 0 {
            anyhow::bail!("clustering.max_iter must be >= 1");
        }

        if self.enrichment.max_workers == 0 {
            anyhow::bail!("enrichment.max_workers must be >= 1");
        }

        // Embedding
        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" | "gemini" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or gemini.",
                other
            ),
        }
        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.batch_size == 0 {
                anyhow::bail!("embedding.batch_size must be > 0");
            }
        }

        // LLM
        match self.llm.provider.as_str() {
            "disabled" | "gemini" | "openai" => {}
            other => anyhow::bail!(
                "Unknown llm provider: '{}'. Must be disabled, gemini, or openai.",
                other
            ),
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Result<Config> {
        let config: Config = toml::from_str(src)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = parse("[db]\npath = \"./data/shelf.sqlite\"\n").unwrap();
        assert_eq!(cfg.clustering.min_k, 3);
        assert_eq!(cfg.clustering.max_k, 12);
        assert_eq!(cfg.clustering.seed, 42);
        assert!(!cfg.embedding.is_enabled());
        assert!(!cfg.llm.is_enabled());
        assert_eq!(cfg.enrichment.base_url, "https://openlibrary.org");
    }

    #[test]
    fn rejects_inverted_cluster_bounds() {
        let err = parse("[db]\npath = \"x\"\n[clustering]\nmin_k = 6\nmax_k = 4\n").unwrap_err();
        assert!(err.to_string().contains("min_k"));
    }

    #[test]
    fn enabled_embedding_requires_model_and_dims() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn rejects_unknown_llm_provider() {
        let err = parse("[db]\npath = \"x\"\n[llm]\nprovider = \"mystery\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown llm provider"));
    }

    #[test]
    fn key_var_follows_provider() {
        let mut llm = LlmConfig::default();
        llm.provider = "openai".to_string();
        assert_eq!(llm.key_var(), "OPENAI_API_KEY");
        llm.provider = "gemini".to_string();
        assert_eq!(llm.key_var(), "GEMINI_API_KEY");
        llm.api_key_env = Some("MY_KEY".to_string());
        assert_eq!(llm.key_var(), "MY_KEY");
    }
}
