//! TOML configuration parsing and validation.
//!
//! Every section has defaults, so an empty file is a valid configuration
//! (with embeddings disabled). See `config/docrag.example.toml` for a
//! complete example.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub chat: ChatConfig,
    #[serde(default)]
    pub prompts: PromptConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    #[serde(default = "default_collection")]
    pub collection: String,
    /// `"cosine"` (scores are similarities) or `"l2"` (scores are distances).
    #[serde(default = "default_metric")]
    pub metric: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            collection: default_collection(),
            metric: default_metric(),
        }
    }
}

fn default_store_path() -> PathBuf {
    PathBuf::from("data/vectors.sqlite")
}
fn default_collection() -> String {
    "rag_poc".to_string()
}
fn default_metric() -> String {
    "cosine".to_string()
}

/// Scoring policy for the retrieval engine.
#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Candidates requested from the index. Falls back to `top_k`.
    #[serde(default)]
    pub fetch_k: Option<usize>,
    /// `"similarity"`, `"distance"`, or `"auto"`.
    #[serde(default = "default_score_type")]
    pub score_type: String,
    #[serde(default)]
    pub min_score: Option<f64>,
    #[serde(default)]
    pub max_distance: Option<f64>,
    #[serde(default = "default_min_results")]
    pub min_results: usize,
    #[serde(default)]
    pub debug: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            fetch_k: None,
            score_type: default_score_type(),
            min_score: None,
            max_distance: None,
            min_results: default_min_results(),
            debug: false,
        }
    }
}

impl RetrievalConfig {
    pub fn effective_fetch_k(&self) -> usize {
        self.fetch_k.unwrap_or(self.top_k)
    }
}

fn default_top_k() -> usize {
    5
}
fn default_score_type() -> String {
    "auto".to_string()
}
fn default_min_results() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            batch_size: default_batch_size(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embedding_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            temperature: default_temperature(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_chat_timeout_secs(),
        }
    }
}

fn default_model() -> String {
    "gpt-4.1-mini".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_chat_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptConfig {
    #[serde(default = "default_prompts_dir")]
    pub dir: PathBuf,
    /// Template file name, resolved under `dir`.
    #[serde(default)]
    pub system: Option<String>,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            dir: default_prompts_dir(),
            system: None,
        }
    }
}

fn default_prompts_dir() -> PathBuf {
    PathBuf::from("files/prompts")
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            data_path: default_data_path(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

impl IngestConfig {
    /// Case-insensitive extension check. `ext` includes the leading dot.
    pub fn allows_extension(&self, ext: &str) -> bool {
        self.allowed_extensions.is_empty()
            || self
                .allowed_extensions
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext))
    }
}

fn default_data_path() -> PathBuf {
    PathBuf::from("data/raw")
}
fn default_chunk_size() -> usize {
    800
}
fn default_chunk_overlap() -> usize {
    120
}
fn default_allowed_extensions() -> Vec<String> {
    vec![".txt".to_string(), ".html".to_string(), ".csv".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Environment variable holding the `X-API-Key` secret. Unset disables auth.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_key_env: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate retrieval
    let retrieval = &config.retrieval;
    if retrieval.top_k < 1 {
        bail!("retrieval.top_k must be >= 1");
    }
    if retrieval.fetch_k == Some(0) {
        bail!("retrieval.fetch_k must be >= 1");
    }
    match retrieval.score_type.trim().to_ascii_lowercase().as_str() {
        "auto" | "similarity" | "distance" => {}
        other => bail!(
            "Unknown retrieval.score_type: '{}'. Must be auto, similarity, or distance.",
            other
        ),
    }
    if retrieval.effective_fetch_k() < retrieval.top_k {
        tracing::warn!(
            fetch_k = retrieval.effective_fetch_k(),
            top_k = retrieval.top_k,
            "retrieval.fetch_k is below top_k; results will be capped at fetch_k"
        );
    }

    match config.store.metric.as_str() {
        "cosine" | "l2" => {}
        other => bail!("Unknown store.metric: '{}'. Must be cosine or l2.", other),
    }
    if config.store.collection.trim().is_empty() {
        bail!("store.collection must not be empty");
    }

    // Validate chunking
    if config.ingest.chunk_size == 0 {
        bail!("ingest.chunk_size must be > 0");
    }
    if config.ingest.chunk_overlap >= config.ingest.chunk_size {
        bail!("ingest.chunk_overlap must be smaller than ingest.chunk_size");
    }

    if !(0.0..=2.0).contains(&config.chat.temperature) {
        bail!("chat.temperature must be in [0.0, 2.0]");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.provider == "openai" && config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "hash" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or hash.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.retrieval.top_k, 5);
        assert_eq!(cfg.retrieval.effective_fetch_k(), 5);
        assert_eq!(cfg.retrieval.score_type, "auto");
        assert_eq!(cfg.retrieval.min_results, 1);
        assert_eq!(cfg.store.collection, "rag_poc");
        assert_eq!(cfg.chat.default_model, "gpt-4.1-mini");
        assert!(!cfg.embedding.is_enabled());
    }

    #[test]
    fn test_retrieval_section() {
        let cfg = parse_config(
            r#"
[retrieval]
top_k = 2
fetch_k = 5
score_type = "similarity"
min_score = 0.5
min_results = 1
"#,
        )
        .unwrap();
        assert_eq!(cfg.retrieval.top_k, 2);
        assert_eq!(cfg.retrieval.effective_fetch_k(), 5);
        assert_eq!(cfg.retrieval.min_score, Some(0.5));
        assert_eq!(cfg.retrieval.max_distance, None);
    }

    #[test]
    fn test_fetch_k_below_top_k_is_accepted() {
        let cfg = parse_config("[retrieval]\ntop_k = 5\nfetch_k = 2\n").unwrap();
        assert_eq!(cfg.retrieval.effective_fetch_k(), 2);
    }

    #[test]
    fn test_rejects_unknown_score_type() {
        let err = parse_config("[retrieval]\nscore_type = \"rank\"\n").unwrap_err();
        assert!(err.to_string().contains("score_type"));
    }

    #[test]
    fn test_rejects_zero_top_k() {
        assert!(parse_config("[retrieval]\ntop_k = 0\n").is_err());
    }

    #[test]
    fn test_embedding_requires_model_and_dims() {
        let err = parse_config("[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("dims"));

        let cfg = parse_config(
            "[embedding]\nprovider = \"openai\"\nmodel = \"text-embedding-3-small\"\ndims = 1536\n",
        )
        .unwrap();
        assert!(cfg.embedding.is_enabled());
    }

    #[test]
    fn test_hash_embedding_needs_only_dims() {
        assert!(parse_config("[embedding]\nprovider = \"hash\"\n").is_err());
        let cfg = parse_config("[embedding]\nprovider = \"hash\"\ndims = 256\n").unwrap();
        assert_eq!(cfg.embedding.dims, Some(256));
        assert!(parse_config("[embedding]\nprovider = \"word2vec\"\ndims = 8\n").is_err());
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_chunk() {
        assert!(parse_config("[ingest]\nchunk_size = 100\nchunk_overlap = 100\n").is_err());
    }

    #[test]
    fn test_allowed_extensions_case_insensitive() {
        let cfg = IngestConfig::default();
        assert!(cfg.allows_extension(".TXT"));
        assert!(!cfg.allows_extension(".pdf"));
    }
}
