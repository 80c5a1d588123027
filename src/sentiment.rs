//! Sentiment scoring for ticket text.
//!
//! Input is cut to the first `max_chars` characters before tokenizing. This
//! is a character cutoff, not a token cutoff, and scores depend on it.

use crate::inference::{
    InferenceError, InferenceErrorKind, LinearModel, Stage, truncate_chars, word_tokenize,
};
use serde::Serialize;
use std::path::Path;

pub const MODEL_FILE: &str = "sentiment.json";

pub const DEFAULT_MAX_CHARS: usize = 512;

/// Dominant sentiment label and its probability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sentiment {
    pub label: String,
    pub score: f32,
}

pub struct SentimentScorer {
    model: LinearModel,
    max_chars: usize,
}

impl SentimentScorer {
    pub fn load(path: Option<&Path>, max_chars: usize) -> Result<Self, InferenceError> {
        let model = LinearModel::load(path, MODEL_FILE, Stage::Sentiment)?;
        Ok(Self { model, max_chars })
    }

    pub fn from_json(raw: &[u8], max_chars: usize) -> Result<Self, InferenceError> {
        let model = LinearModel::parse(raw, Stage::Sentiment)?;
        Ok(Self { model, max_chars })
    }

    pub fn model_hash(&self) -> &str {
        &self.model.hash
    }

    /// Probability of the dominant sentiment label, in [0, 1].
    pub fn score(&self, text: &str) -> Result<f32, InferenceError> {
        self.analyze(text).map(|s| s.score)
    }

    pub fn analyze(&self, text: &str) -> Result<Sentiment, InferenceError> {
        let truncated = truncate_chars(text, self.max_chars);
        let tokens = word_tokenize(truncated);
        if tokens.is_empty() {
            return Err(InferenceError::new(
                Stage::Sentiment,
                InferenceErrorKind::EmptyInput,
                text,
            ));
        }
        let (label, p) = self.model.predict(&tokens, truncated);
        let score = (p as f32).clamp(0.0, 1.0);
        if !score.is_finite() {
            return Err(InferenceError::new(
                Stage::Sentiment,
                InferenceErrorKind::Runtime("non-finite score".into()),
                text,
            ));
        }
        Ok(Sentiment {
            label: self.model.classes[label].clone(),
            score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer(max_chars: usize) -> SentimentScorer {
        SentimentScorer::load(None, max_chars).unwrap()
    }

    #[test]
    fn empty_input_fails() {
        let s = scorer(DEFAULT_MAX_CHARS);
        let err = s.score("").unwrap_err();
        assert_eq!(err.stage, Stage::Sentiment);
        assert_eq!(err.kind, InferenceErrorKind::EmptyInput);
        assert!(s.score("\n\t ").is_err());
    }

    #[test]
    fn score_is_a_probability() {
        let s = scorer(DEFAULT_MAX_CHARS);
        for text in [
            "My login is broken",
            "Thanks, the fix works great!",
            "neutral words only here",
        ] {
            let v = s.score(text).unwrap();
            assert!((0.0..=1.0).contains(&v), "{text}: {v}");
        }
    }

    #[test]
    fn dominant_label_follows_wording() {
        let s = scorer(DEFAULT_MAX_CHARS);
        let neg = s.analyze("this is terrible, still broken again, unacceptable").unwrap();
        assert_eq!(neg.label, "negative");
        assert!(neg.score > 0.5);
        let pos = s.analyze("thanks, great and helpful support, resolved quick").unwrap();
        assert_eq!(pos.label, "positive");
        assert!(pos.score > 0.5);
    }

    #[test]
    fn characters_past_cutoff_are_ignored() {
        let s = scorer(32);
        let prefix = "awful experience, still broken!!";
        assert_eq!(prefix.chars().count(), 32);
        let base = s.analyze(prefix).unwrap();
        let longer = format!("{prefix}{}", " thanks great love it".repeat(100));
        assert_eq!(s.analyze(&longer).unwrap(), base);
    }

    #[test]
    fn cutoff_is_character_based() {
        // A word straddling the cutoff is cut mid-word.
        let s = scorer(4);
        let cut = s.analyze("goodbye").unwrap();
        let whole = s.analyze("good").unwrap();
        assert_eq!(cut, whole);
    }
}
