use crate::TriageError;
use crate::metrics::MetricsConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Default)]
pub struct TriageConfig {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Optional model file overrides. Unset entries use the embedded models.
#[derive(Debug, Deserialize, Default)]
pub struct ModelsConfig {
    pub classifier: Option<PathBuf>,
    pub sentiment: Option<PathBuf>,
    pub encoder: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    /// Concurrent inference calls (default: available parallelism).
    pub workers: Option<usize>,
    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            workers: None,
            timeout_secs: default_inference_timeout(),
            max_tokens: default_max_tokens(),
            max_chars: default_max_chars(),
        }
    }
}

impl InferenceConfig {
    pub fn resolved_workers(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        })
    }
}

fn default_inference_timeout() -> u64 {
    30
}

fn default_max_tokens() -> usize {
    crate::classify::DEFAULT_MAX_TOKENS
}

fn default_max_chars() -> usize {
    crate::sentiment::DEFAULT_MAX_CHARS
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_backend")]
    pub backend: String,
    pub dimension: Option<usize>,
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub fallback_endpoint: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: default_embedding_backend(),
            dimension: None,
            endpoint: default_embedding_endpoint(),
            model: default_embedding_model(),
            timeout_secs: default_embedding_timeout(),
            fallback_endpoint: None,
        }
    }
}

fn default_embedding_backend() -> String {
    "local".into()
}

fn default_embedding_endpoint() -> String {
    "http://localhost:1234/v1/embeddings".into()
}

fn default_embedding_model() -> String {
    "all-MiniLM-L6-v2".into()
}

fn default_embedding_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// "memory" (brute-force snapshot) or "sqlite" (scan in the store).
    #[serde(default = "default_index")]
    pub index: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            index: default_index(),
        }
    }
}

fn default_index() -> String {
    "memory".into()
}

/// Load config from DESKTRIAGE_CONFIG env var, ~/.desktriage/config.toml, or defaults.
pub fn load_config() -> Result<TriageConfig, TriageError> {
    let path = config_path();
    match path {
        Some(p) if p.exists() => load_config_from(&p),
        _ => Ok(TriageConfig::default()),
    }
}

pub fn load_config_from(path: &Path) -> Result<TriageConfig, TriageError> {
    let content = std::fs::read_to_string(path)?;
    let config: TriageConfig = toml::from_str(&content)
        .map_err(|e| TriageError::Config(format!("{}: {e}", path.display())))?;
    validate_config(&config)?;
    Ok(config)
}

fn config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("DESKTRIAGE_CONFIG") {
        return Some(PathBuf::from(p));
    }
    let home = std::env::var("HOME").ok()?;
    Some(Path::new(&home).join(".desktriage").join("config.toml"))
}

fn validate_config(config: &TriageConfig) -> Result<(), TriageError> {
    if config.inference.workers == Some(0) {
        return Err(TriageError::Config("inference.workers must be > 0".into()));
    }
    if config.inference.timeout_secs == 0 {
        return Err(TriageError::Config("inference.timeout_secs must be > 0".into()));
    }
    if config.inference.max_tokens == 0 || config.inference.max_chars == 0 {
        return Err(TriageError::Config(
            "inference.max_tokens and inference.max_chars must be > 0".into(),
        ));
    }
    if config.embedding.dimension == Some(0) {
        return Err(TriageError::Config("embedding.dimension must be > 0".into()));
    }
    match config.embedding.backend.as_str() {
        "local" | "http" => {}
        other => {
            return Err(TriageError::Config(format!(
                "embedding.backend: {other:?} (expected \"local\" or \"http\")"
            )));
        }
    }
    match config.retrieval.index.as_str() {
        "memory" | "sqlite" => {}
        other => {
            return Err(TriageError::Config(format!(
                "retrieval.index: {other:?} (expected \"memory\" or \"sqlite\")"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_when_no_file() {
        let config = TriageConfig::default();
        assert!(config.models.classifier.is_none());
        assert_eq!(config.inference.timeout_secs, 30);
        assert_eq!(config.inference.max_tokens, 512);
        assert_eq!(config.inference.max_chars, 512);
        assert_eq!(config.embedding.backend, "local");
        assert_eq!(config.retrieval.index, "memory");
        assert!(!config.metrics.enabled);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[models]
classifier = "/opt/desk/models/category.json"

[inference]
workers = 2
timeout_secs = 5
max_tokens = 256

[embedding]
backend = "http"
dimension = 768
endpoint = "http://embed.internal/v1/embeddings"
fallback_endpoint = "http://localhost:1234/v1/embeddings"

[retrieval]
index = "sqlite"
"#;
        let config: TriageConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.models.classifier,
            Some(PathBuf::from("/opt/desk/models/category.json"))
        );
        assert_eq!(config.inference.resolved_workers(), 2);
        assert_eq!(config.inference.timeout_secs, 5);
        assert_eq!(config.inference.max_tokens, 256);
        assert_eq!(config.inference.max_chars, 512);
        assert_eq!(config.embedding.backend, "http");
        assert_eq!(config.embedding.dimension, Some(768));
        assert_eq!(config.embedding.timeout_secs, 10);
        assert_eq!(config.retrieval.index, "sqlite");
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let config: TriageConfig = toml::from_str("[inference]\nworkers = 0\n").unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn unknown_backend_rejected() {
        let config: TriageConfig = toml::from_str("[embedding]\nbackend = \"onnx\"\n").unwrap();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("embedding.backend"));
    }

    #[test]
    fn unknown_index_rejected() {
        let config: TriageConfig = toml::from_str("[retrieval]\nindex = \"hnsw\"\n").unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn default_workers_positive() {
        assert!(InferenceConfig::default().resolved_workers() >= 1);
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[inference]\ntimeout_secs = 7\n").unwrap();
        let config = load_config_from(&path).unwrap();
        assert_eq!(config.inference.timeout_secs, 7);

        std::fs::write(&path, "[inference]\ntimeout_secs = \"soon\"\n").unwrap();
        assert!(matches!(load_config_from(&path), Err(TriageError::Config(_))));
    }
}
