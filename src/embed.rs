//! Text embeddings for knowledge-base retrieval.
//!
//! Two backends: a local signed feature-hashing encoder (default, no
//! network) and an OpenAI-compatible `/v1/embeddings` endpoint. Both return
//! vectors of a dimension fixed at construction.

use crate::TriageError;
use crate::config::{EmbeddingConfig, TriageConfig};
use crate::inference::{
    InferenceError, InferenceErrorKind, Stage, char_wb_ngrams, fnv1a64, read_model_source,
    word_ngrams, word_tokenize,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub const MODEL_FILE: &str = "encoder.json";

pub const DEFAULT_DIMENSION: usize = 384;

pub trait EmbeddingEncoder: Send + Sync {
    fn dimension(&self) -> usize;

    /// Encode `text` into a `dimension()`-length vector.
    fn encode(&self, text: &str) -> Result<Vec<f32>, InferenceError>;

    /// Short identifier for status output.
    fn describe(&self) -> String;
}

/// Build the encoder selected by `embedding.backend`.
pub fn encoder_from_config(config: &TriageConfig) -> Result<Arc<dyn EmbeddingEncoder>, TriageError> {
    let encoder: Arc<dyn EmbeddingEncoder> = match config.embedding.backend.as_str() {
        "http" => Arc::new(HttpEncoder::new(&config.embedding)),
        _ => Arc::new(HashingEncoder::load(
            config.models.encoder.as_deref(),
            config.embedding.dimension,
        )?),
    };
    Ok(encoder)
}

fn empty_input(text: &str) -> InferenceError {
    InferenceError::new(Stage::Embed, InferenceErrorKind::EmptyInput, text)
}

fn runtime(text: &str, msg: impl Into<String>) -> InferenceError {
    InferenceError::new(Stage::Embed, InferenceErrorKind::Runtime(msg.into()), text)
}

// --- Local hashing encoder ---

#[derive(Deserialize)]
struct EncoderSpec {
    dimension: usize,
    word_ngram_range: [usize; 2],
    char_ngram_range: [usize; 2],
    #[serde(default = "default_char_weight")]
    char_weight: f32,
    #[serde(default = "default_idf")]
    default_idf: f32,
    #[serde(default)]
    idf: HashMap<String, f32>,
}

fn default_char_weight() -> f32 {
    0.35
}

fn default_idf() -> f32 {
    1.0
}

/// Signed feature hashing of word and char n-grams, L2-normalized.
pub struct HashingEncoder {
    spec: EncoderSpec,
    hash: String,
}

impl HashingEncoder {
    /// Load encoder settings; `dimension` overrides the model's own.
    pub fn load(path: Option<&Path>, dimension: Option<usize>) -> Result<Self, InferenceError> {
        let (raw, origin) = read_model_source(path, MODEL_FILE, Stage::Embed)?;
        let encoder = Self::from_json(&raw, dimension)?;
        log::info!(
            "loaded embed model from {origin} (dimension {}, {} idf terms)",
            encoder.spec.dimension,
            encoder.spec.idf.len()
        );
        Ok(encoder)
    }

    pub fn from_json(raw: &[u8], dimension: Option<usize>) -> Result<Self, InferenceError> {
        let mut spec: EncoderSpec = serde_json::from_slice(raw)
            .map_err(|e| InferenceError::model_unavailable(Stage::Embed, format!("parse: {e}")))?;
        if let Some(d) = dimension {
            spec.dimension = d;
        }
        if spec.dimension == 0 {
            return Err(InferenceError::model_unavailable(Stage::Embed, "dimension must be > 0"));
        }
        for range in [spec.word_ngram_range, spec.char_ngram_range] {
            if range[0] == 0 || range[0] > range[1] {
                return Err(InferenceError::model_unavailable(
                    Stage::Embed,
                    format!("bad ngram range {range:?}"),
                ));
            }
        }
        Ok(Self {
            spec,
            hash: crate::inference::siphash_hex(raw),
        })
    }

    fn add_features(&self, out: &mut [f32], grams: HashMap<String, u32>, scale: f32) {
        // Sorted so float accumulation order is the same on every call.
        let mut grams: Vec<(String, u32)> = grams.into_iter().collect();
        grams.sort_unstable();

        let dim = out.len() as u64;
        for (gram, count) in grams {
            let idf = self.spec.idf.get(&gram).copied().unwrap_or(self.spec.default_idf);
            let tf = 1.0 + (count as f32).ln();
            let h = fnv1a64(gram.as_bytes());
            let bucket = (h % dim) as usize;
            let sign = if h >> 63 == 1 { -1.0 } else { 1.0 };
            out[bucket] += sign * tf * idf * scale;
        }
    }
}

impl EmbeddingEncoder for HashingEncoder {
    fn dimension(&self) -> usize {
        self.spec.dimension
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>, InferenceError> {
        let tokens = word_tokenize(text);
        if tokens.is_empty() {
            return Err(empty_input(text));
        }

        let mut out = vec![0.0f32; self.spec.dimension];
        let [wlo, whi] = self.spec.word_ngram_range;
        let [clo, chi] = self.spec.char_ngram_range;
        self.add_features(&mut out, word_ngrams(&tokens, wlo, whi), 1.0);
        self.add_features(&mut out, char_wb_ngrams(&tokens.join(" "), clo, chi), self.spec.char_weight);

        let norm = out.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm == 0.0 || !norm.is_finite() {
            return Err(runtime(text, "degenerate embedding (zero norm)"));
        }
        for v in &mut out {
            *v /= norm;
        }
        Ok(out)
    }

    fn describe(&self) -> String {
        format!("hashing/{} ({})", self.spec.dimension, self.hash)
    }
}

// --- Remote encoder ---

/// OpenAI-compatible embeddings endpoint, with optional fallback.
pub struct HttpEncoder {
    agent: ureq::Agent,
    endpoint: String,
    fallback_endpoint: Option<String>,
    model: String,
    api_key: Option<String>,
    dimension: usize,
}

impl HttpEncoder {
    pub fn new(config: &EmbeddingConfig) -> Self {
        let agent = ureq::Agent::new_with_config(
            ureq::config::Config::builder()
                .timeout_global(Some(Duration::from_secs(config.timeout_secs)))
                .build(),
        );
        Self {
            agent,
            endpoint: config.endpoint.clone(),
            fallback_endpoint: config.fallback_endpoint.clone(),
            model: config.model.clone(),
            api_key: std::env::var("DESKTRIAGE_EMBEDDING_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            dimension: config.dimension.unwrap_or(DEFAULT_DIMENSION),
        }
    }

    fn try_endpoint(&self, endpoint: &str, text: &str) -> Result<Vec<f32>, String> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let mut req = self.agent.post(endpoint);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        let resp: serde_json::Value = req
            .send_json(&body)
            .map_err(|e| format!("embedding request: {e}"))?
            .body_mut()
            .read_json()
            .map_err(|e| format!("embedding response: {e}"))?;

        parse_embedding_response(&resp, self.dimension)
    }
}

/// Pull `data[0].embedding` out of a response and check its length.
fn parse_embedding_response(resp: &serde_json::Value, dimension: usize) -> Result<Vec<f32>, String> {
    let values = resp
        .pointer("/data/0/embedding")
        .and_then(serde_json::Value::as_array)
        .ok_or("no data[0].embedding in response")?;

    let vector: Vec<f32> = values
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect::<Option<_>>()
        .ok_or("non-numeric embedding component")?;

    if vector.len() != dimension {
        return Err(format!(
            "endpoint returned {} components, expected {dimension}",
            vector.len()
        ));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err("non-finite embedding component".into());
    }
    Ok(vector)
}

impl EmbeddingEncoder for HttpEncoder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode(&self, text: &str) -> Result<Vec<f32>, InferenceError> {
        if text.trim().is_empty() {
            return Err(empty_input(text));
        }
        match self.try_endpoint(&self.endpoint, text) {
            Ok(v) => Ok(v),
            Err(primary_err) => match &self.fallback_endpoint {
                Some(fallback) => {
                    log::warn!("embedding endpoint failed ({primary_err}), trying fallback");
                    self.try_endpoint(fallback, text).map_err(|e| runtime(text, e))
                }
                None => Err(runtime(text, primary_err)),
            },
        }
    }

    fn describe(&self) -> String {
        format!("http/{} ({} @ {})", self.dimension, self.model, self.endpoint)
    }
}
