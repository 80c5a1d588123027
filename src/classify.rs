//! Ticket category classifier.
//!
//! Model label `i` maps to category id `i + 1`; the `ticket_categories`
//! table is seeded from [`TextClassifier::labels`] in that order.

use crate::inference::{
    InferenceError, LinearModel, Stage, truncate_tokens, word_tokenize,
};
use std::path::Path;

pub const MODEL_FILE: &str = "ticket-category.json";

/// Default token cutoff, matching the BERT-style 512 token window.
pub const DEFAULT_MAX_TOKENS: usize = 512;

pub struct TextClassifier {
    model: LinearModel,
    max_tokens: usize,
}

impl TextClassifier {
    /// Load from `path`, an override file, or the embedded model.
    pub fn load(path: Option<&Path>, max_tokens: usize) -> Result<Self, InferenceError> {
        let model = LinearModel::load(path, MODEL_FILE, Stage::Classify)?;
        Ok(Self { model, max_tokens })
    }

    /// Build from raw model JSON.
    pub fn from_json(raw: &[u8], max_tokens: usize) -> Result<Self, InferenceError> {
        let model = LinearModel::parse(raw, Stage::Classify)?;
        Ok(Self { model, max_tokens })
    }

    /// Category names by label index.
    pub fn labels(&self) -> &[String] {
        &self.model.classes
    }

    pub fn num_categories(&self) -> usize {
        self.model.classes.len()
    }

    pub fn model_hash(&self) -> &str {
        &self.model.hash
    }

    /// Classify `text` into a 1-based category id.
    ///
    /// Only the first `max_tokens` tokens are used; anything past the cutoff
    /// is dropped silently.
    pub fn classify(&self, text: &str) -> Result<i64, InferenceError> {
        let tokens = truncate_tokens(word_tokenize(text), self.max_tokens);
        if tokens.is_empty() {
            return Err(InferenceError::new(
                Stage::Classify,
                crate::InferenceErrorKind::EmptyInput,
                text,
            ));
        }
        let char_source = tokens.join(" ");
        let (label, confidence) = self.model.predict(&tokens, &char_source);
        let category_id = label as i64 + 1;
        log::debug!(
            "classified as category {category_id} ({}, p={confidence:.3})",
            self.model.classes[label]
        );
        Ok(category_id)
    }
}
