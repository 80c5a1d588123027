//! Shared TF-IDF + linear-head inference engine.
//!
//! Pure Rust inference for text classifiers exported from scikit-learn
//! (TfidfVectorizer + LogisticRegression/LinearSVC). The ticket classifier
//! and the sentiment scorer both delegate to [`LinearModel`]; the hashing
//! encoder reuses the tokenizer and n-gram helpers.
//!
//! Model files are JSON. A model may have one coefficient row per class
//! (multi-class, softmax) or a single row for a two-class model (sigmoid,
//! `classes[1]` is the positive class).

use crate::preview::preview;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which inference call produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Classify,
    Sentiment,
    Embed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Classify => "classify",
            Stage::Sentiment => "sentiment",
            Stage::Embed => "embed",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InferenceErrorKind {
    EmptyInput,
    ModelUnavailable(String),
    Timeout(Duration),
    Runtime(String),
}

/// Failure of a single inference call, with a redacted preview of its input.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceError {
    pub stage: Stage,
    pub kind: InferenceErrorKind,
    pub preview: String,
}

impl InferenceError {
    pub fn new(stage: Stage, kind: InferenceErrorKind, text: &str) -> Self {
        Self {
            stage,
            kind,
            preview: preview(text),
        }
    }

    pub fn model_unavailable(stage: Stage, msg: impl Into<String>) -> Self {
        Self::new(stage, InferenceErrorKind::ModelUnavailable(msg.into()), "")
    }
}

impl std::fmt::Display for InferenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stage = self.stage.as_str();
        match &self.kind {
            InferenceErrorKind::EmptyInput => write!(f, "{stage}: empty input")?,
            InferenceErrorKind::ModelUnavailable(msg) => {
                write!(f, "{stage}: model unavailable: {msg}")?
            }
            InferenceErrorKind::Timeout(d) => {
                write!(f, "{stage}: timed out after {}s", d.as_secs_f64())?
            }
            InferenceErrorKind::Runtime(msg) => write!(f, "{stage}: {msg}")?,
        }
        if !self.preview.is_empty() {
            write!(f, " (input: {:?})", self.preview)?;
        }
        Ok(())
    }
}

impl std::error::Error for InferenceError {}

/// Exported TF-IDF vectorizer for one feature set (word or char).
#[derive(Deserialize)]
pub(crate) struct VectorizerWeights {
    pub vocabulary: HashMap<String, usize>,
    pub idf: Vec<f64>,
    pub ngram_range: [usize; 2],
    #[serde(default)]
    pub binary: bool,
    #[serde(default = "default_true")]
    pub sublinear_tf: bool,
}

fn default_true() -> bool {
    true
}

/// Full exported model (deserialized from JSON).
#[derive(Deserialize)]
struct ExportedModel {
    classes: Vec<String>,
    word: VectorizerWeights,
    char: VectorizerWeights,
    coef_word: Vec<Vec<f64>>,
    coef_char: Vec<Vec<f64>>,
    intercept: Vec<f64>,
}

/// Loaded model ready for inference. Read-only after construction.
pub(crate) struct LinearModel {
    pub classes: Vec<String>,
    word: VectorizerWeights,
    char: VectorizerWeights,
    coef_word: Vec<Vec<f64>>,
    coef_char: Vec<Vec<f64>>,
    intercept: Vec<f64>,
    pub hash: String,
}

/// Compute a SipHash fingerprint of raw bytes, returned as 16-char hex string.
pub(crate) fn siphash_hex(data: &[u8]) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::hash::DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// 64-bit FNV-1a. Stable across builds, unlike the std hasher.
pub(crate) fn fnv1a64(data: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in data {
        h ^= u64::from(*b);
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}

fn desktriage_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .map(|h| PathBuf::from(h).join(".desktriage"))
}

/// Default model weights compiled into the binary.
mod embedded {
    pub const TICKET_CATEGORY: &str = include_str!("../models/ticket-category.json");
    pub const SENTIMENT: &str = include_str!("../models/sentiment.json");
    pub const ENCODER: &str = include_str!("../models/encoder.json");
}

/// Get embedded model data by filename.
pub(crate) fn embedded_model_data(filename: &str) -> Option<&'static str> {
    match filename {
        "ticket-category.json" => Some(embedded::TICKET_CATEGORY),
        "sentiment.json" => Some(embedded::SENTIMENT),
        "encoder.json" => Some(embedded::ENCODER),
        _ => None,
    }
}

/// Find an override model file in the standard locations.
/// External files win over embedded models.
pub(crate) fn resolve_model_path(filename: &str) -> Option<PathBuf> {
    let candidates = [
        desktriage_dir().map(|d| d.join("models").join(filename)),
        Some(PathBuf::from("models").join(filename)),
    ];
    candidates.into_iter().flatten().find(|p| p.exists())
}

/// Read model bytes: explicit path, then override locations, then embedded.
pub(crate) fn read_model_source(
    explicit: Option<&Path>,
    filename: &str,
    stage: Stage,
) -> Result<(Vec<u8>, String), InferenceError> {
    if let Some(path) = explicit {
        let raw = std::fs::read(path).map_err(|e| {
            InferenceError::model_unavailable(stage, format!("{}: {e}", path.display()))
        })?;
        return Ok((raw, path.display().to_string()));
    }
    if let Some(path) = resolve_model_path(filename)
        && let Ok(raw) = std::fs::read(&path)
    {
        return Ok((raw, path.display().to_string()));
    }
    embedded_model_data(filename)
        .map(|data| (data.as_bytes().to_vec(), "embedded".to_string()))
        .ok_or_else(|| InferenceError::model_unavailable(stage, format!("no model {filename}")))
}

impl LinearModel {
    /// Parse and shape-check a model from raw JSON bytes.
    pub fn parse(raw: &[u8], stage: Stage) -> Result<Self, InferenceError> {
        let hash = siphash_hex(raw);
        let exported: ExportedModel = serde_json::from_slice(raw)
            .map_err(|e| InferenceError::model_unavailable(stage, format!("parse: {e}")))?;

        let model = Self {
            classes: exported.classes,
            word: exported.word,
            char: exported.char,
            coef_word: exported.coef_word,
            coef_char: exported.coef_char,
            intercept: exported.intercept,
            hash,
        };
        model
            .validate()
            .map_err(|msg| InferenceError::model_unavailable(stage, msg))?;
        Ok(model)
    }

    /// Load from an explicit path, an override file, or the embedded copy.
    pub fn load(explicit: Option<&Path>, filename: &str, stage: Stage) -> Result<Self, InferenceError> {
        let (raw, origin) = read_model_source(explicit, filename, stage)?;
        let model = Self::parse(&raw, stage)?;
        log::info!(
            "loaded {} model from {origin} ({} classes, {} word + {} char features)",
            stage.as_str(),
            model.classes.len(),
            model.word.vocabulary.len(),
            model.char.vocabulary.len()
        );
        Ok(model)
    }

    fn validate(&self) -> Result<(), String> {
        if self.classes.len() < 2 {
            return Err("model needs at least two classes".into());
        }
        let rows = self.coef_word.len();
        let binary_head = self.classes.len() == 2 && rows == 1;
        if rows != self.classes.len() && !binary_head {
            return Err(format!(
                "{} coefficient rows for {} classes",
                rows,
                self.classes.len()
            ));
        }
        if self.coef_char.len() != rows || self.intercept.len() != rows {
            return Err("coef_char/intercept row count differs from coef_word".into());
        }
        for (name, vw, coef) in [
            ("word", &self.word, &self.coef_word),
            ("char", &self.char, &self.coef_char),
        ] {
            if vw.ngram_range[0] == 0 || vw.ngram_range[0] > vw.ngram_range[1] {
                return Err(format!("{name}: bad ngram_range {:?}", vw.ngram_range));
            }
            if vw.vocabulary.values().any(|&i| i >= vw.idf.len()) {
                return Err(format!("{name}: vocabulary index beyond idf length"));
            }
            if coef.iter().any(|row| row.len() != vw.idf.len()) {
                return Err(format!("{name}: coefficient row length differs from idf"));
            }
        }
        Ok(())
    }

    fn is_binary_head(&self) -> bool {
        self.coef_word.len() == 1
    }

    /// Class probabilities for an already-truncated token sequence.
    /// Char n-grams are built from `char_source`.
    pub fn probabilities(&self, tokens: &[String], char_source: &str) -> Vec<f64> {
        let word_ng = word_ngrams(tokens, self.word.ngram_range[0], self.word.ngram_range[1]);
        let char_ng = char_wb_ngrams(char_source, self.char.ngram_range[0], self.char.ngram_range[1]);
        let word_vec = tfidf_vector(&word_ng, &self.word);
        let char_vec = tfidf_vector(&char_ng, &self.char);

        let raw: Vec<f64> = (0..self.coef_word.len())
            .map(|row| {
                sparse_dot(&word_vec, &self.coef_word[row])
                    + sparse_dot(&char_vec, &self.coef_char[row])
                    + self.intercept[row]
            })
            .collect();

        if self.is_binary_head() {
            let p = sigmoid(raw[0]);
            vec![1.0 - p, p]
        } else {
            softmax(&raw)
        }
    }

    /// Index and probability of the most likely class. Ties go to the lowest index.
    pub fn predict(&self, tokens: &[String], char_source: &str) -> (usize, f64) {
        argmax(&self.probabilities(tokens, char_source))
    }
}

pub(crate) fn argmax(values: &[f64]) -> (usize, f64) {
    let mut best = (0, f64::NEG_INFINITY);
    for (i, &v) in values.iter().enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best
}

pub(crate) fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub(crate) fn softmax(raw: &[f64]) -> Vec<f64> {
    let max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = raw.iter().map(|v| (v - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Tokenize text into lowercase word tokens.
pub(crate) fn word_tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '_' {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

/// Keep the first `max` tokens.
pub(crate) fn truncate_tokens(mut tokens: Vec<String>, max: usize) -> Vec<String> {
    tokens.truncate(max);
    tokens
}

/// Keep the first `max` characters, on a char boundary.
pub(crate) fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Generate word n-grams and count occurrences.
pub(crate) fn word_ngrams(tokens: &[String], lo: usize, hi: usize) -> HashMap<String, u32> {
    let mut ngrams = HashMap::new();

    for n in lo..=hi {
        if n == 0 || n > tokens.len() {
            continue;
        }
        for window in tokens.windows(n) {
            let gram = window.join(" ");
            *ngrams.entry(gram).or_insert(0) += 1;
        }
    }

    ngrams
}

/// Generate char_wb n-grams (whitespace-bounded character n-grams).
pub(crate) fn char_wb_ngrams(text: &str, lo: usize, hi: usize) -> HashMap<String, u32> {
    let mut ngrams = HashMap::new();
    let lower = text.to_lowercase();

    for word in lower.split_whitespace() {
        let padded = format!(" {word} ");
        let chars: Vec<char> = padded.chars().collect();

        for n in lo..=hi {
            if n == 0 || n > chars.len() {
                continue;
            }
            for window in chars.windows(n) {
                let gram: String = window.iter().collect();
                *ngrams.entry(gram).or_insert(0) += 1;
            }
        }
    }

    ngrams
}

/// L2-normalized sparse TF-IDF vector over the model vocabulary.
pub(crate) fn tfidf_vector(ngrams: &HashMap<String, u32>, vw: &VectorizerWeights) -> Vec<(usize, f64)> {
    let mut pairs: Vec<(usize, f64)> = Vec::new();

    for (gram, &count) in ngrams {
        if let Some(&idx) = vw.vocabulary.get(gram) {
            let tf = if vw.binary {
                1.0
            } else if vw.sublinear_tf {
                (count as f64).ln() + 1.0
            } else {
                count as f64
            };
            pairs.push((idx, tf * vw.idf[idx]));
        }
    }

    let norm_sq: f64 = pairs.iter().map(|(_, v)| v * v).sum();
    if norm_sq == 0.0 {
        return Vec::new();
    }
    let norm = norm_sq.sqrt();
    for (_, v) in &mut pairs {
        *v /= norm;
    }
    // HashMap iteration order varies; summation order must not.
    pairs.sort_unstable_by_key(|(idx, _)| *idx);
    pairs
}

pub(crate) fn sparse_dot(vec: &[(usize, f64)], row: &[f64]) -> f64 {
    vec.iter().map(|(idx, v)| v * row[*idx]).sum()
}
