//! Bounded, time-limited execution of model calls.
//!
//! Every inference call acquires a permit from a shared semaphore and runs
//! on tokio's blocking pool. The permit moves into the blocking closure, so a
//! call that outlives its timeout keeps its slot until the model actually
//! returns and the pool never over-commits.

use crate::classify::TextClassifier;
use crate::config::TriageConfig;
use crate::embed::{EmbeddingEncoder, encoder_from_config};
use crate::inference::{InferenceError, InferenceErrorKind, Stage};
use crate::metrics;
use crate::preview::preview;
use crate::sentiment::{Sentiment, SentimentScorer};
use crate::similarity::{Neighbor, SimilarityIndex};
use crate::TriageError;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Models loaded once and shared read-only across tasks.
pub struct InferenceService {
    pub classifier: TextClassifier,
    pub sentiment: SentimentScorer,
    pub encoder: Arc<dyn EmbeddingEncoder>,
}

impl InferenceService {
    pub fn new(
        classifier: TextClassifier,
        sentiment: SentimentScorer,
        encoder: Arc<dyn EmbeddingEncoder>,
    ) -> Self {
        Self {
            classifier,
            sentiment,
            encoder,
        }
    }

    pub fn from_config(config: &TriageConfig) -> Result<Self, TriageError> {
        let classifier =
            TextClassifier::load(config.models.classifier.as_deref(), config.inference.max_tokens)?;
        let sentiment =
            SentimentScorer::load(config.models.sentiment.as_deref(), config.inference.max_chars)?;
        let encoder = encoder_from_config(config)?;
        log::info!(
            "inference ready: {} categories, encoder {}",
            classifier.num_categories(),
            encoder.describe()
        );
        Ok(Self::new(classifier, sentiment, encoder))
    }
}

/// Triage result for one ticket. Both fields are always present together.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Triage {
    pub category_id: i64,
    pub sentiment_score: f32,
    pub sentiment_label: String,
}

pub struct TriagePipeline {
    service: Arc<InferenceService>,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl TriagePipeline {
    pub fn new(service: Arc<InferenceService>, workers: usize, timeout: Duration) -> Self {
        Self {
            service,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            timeout,
        }
    }

    pub fn from_config(service: Arc<InferenceService>, config: &TriageConfig) -> Self {
        Self::new(
            service,
            config.inference.resolved_workers(),
            Duration::from_secs(config.inference.timeout_secs),
        )
    }

    /// Run `f` against the models on a blocking worker, within the timeout.
    async fn run<T, F>(&self, stage: Stage, text: &str, f: F) -> Result<T, InferenceError>
    where
        T: Send + 'static,
        F: FnOnce(&InferenceService) -> Result<T, InferenceError> + Send + 'static,
    {
        let start = Instant::now();
        let service = self.service.clone();
        let permits = self.permits.clone();

        let call = async move {
            let permit = permits.acquire_owned().await.map_err(|_| {
                InferenceError::new(stage, InferenceErrorKind::Runtime("worker pool closed".into()), "")
            })?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                f(&service)
            })
            .await
            .map_err(|e| {
                InferenceError::new(stage, InferenceErrorKind::Runtime(format!("worker failed: {e}")), "")
            })?
        };

        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(mut e)) => {
                if e.preview.is_empty() {
                    e.preview = preview(text);
                }
                Err(e)
            }
            Err(_) => Err(InferenceError::new(
                stage,
                InferenceErrorKind::Timeout(self.timeout),
                text,
            )),
        };
        metrics::record_inference(stage, result.is_ok(), start);
        result
    }

    pub async fn encode(&self, text: &str) -> Result<Vec<f32>, InferenceError> {
        let owned = text.to_string();
        self.run(Stage::Embed, text, move |s| s.encoder.encode(&owned))
            .await
    }

    /// Nearest neighbours of `query` in `index`, scanned on a pool worker.
    /// The scan holds a permit like any model call but has no timeout.
    pub async fn search(
        &self,
        index: Arc<dyn SimilarityIndex>,
        query: Vec<f32>,
        k: usize,
    ) -> Result<Vec<Neighbor>, TriageError> {
        let worker_error = |msg: String| {
            TriageError::Inference(InferenceError::new(
                Stage::Embed,
                InferenceErrorKind::Runtime(msg),
                "",
            ))
        };
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| worker_error("worker pool closed".into()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            index.top_k(&query, k)
        })
        .await
        .map_err(|e| worker_error(format!("index scan failed: {e}")))?
    }

    /// Classify and score `description` concurrently. Either failure fails
    /// the whole call and the other result is discarded.
    pub async fn triage(&self, subject: &str, description: &str) -> Result<Triage, TriageError> {
        self.triage_with(
            subject,
            description,
            |s, text| s.classifier.classify(text),
            |s, text| s.sentiment.analyze(text),
        )
        .await
    }

    async fn triage_with<C, S>(
        &self,
        subject: &str,
        description: &str,
        classify_fn: C,
        sentiment_fn: S,
    ) -> Result<Triage, TriageError>
    where
        C: FnOnce(&InferenceService, &str) -> Result<i64, InferenceError> + Send + 'static,
        S: FnOnce(&InferenceService, &str) -> Result<Sentiment, InferenceError> + Send + 'static,
    {
        log::debug!("triage start: {:?}", preview(subject));
        let for_classify = description.to_string();
        let for_sentiment = description.to_string();
        let (category_id, sentiment) = tokio::try_join!(
            self.run(Stage::Classify, description, move |s| classify_fn(
                s,
                &for_classify
            )),
            self.run(Stage::Sentiment, description, move |s| sentiment_fn(
                s,
                &for_sentiment
            )),
        )?;
        log::debug!(
            "triage done: {:?} -> category {category_id}, {} {:.3}",
            preview(subject),
            sentiment.label,
            sentiment.score
        );
        Ok(Triage {
            category_id,
            sentiment_score: sentiment.score,
            sentiment_label: sentiment.label,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowEncoder(Duration);

    impl EmbeddingEncoder for SlowEncoder {
        fn dimension(&self) -> usize {
            4
        }

        fn encode(&self, _text: &str) -> Result<Vec<f32>, InferenceError> {
            std::thread::sleep(self.0);
            Ok(vec![0.5; 4])
        }

        fn describe(&self) -> String {
            "slow".into()
        }
    }

    fn service(encoder: Arc<dyn EmbeddingEncoder>) -> Arc<InferenceService> {
        Arc::new(InferenceService::new(
            TextClassifier::load(None, 512).unwrap(),
            SentimentScorer::load(None, 512).unwrap(),
            encoder,
        ))
    }

    fn pipeline(encoder: Arc<dyn EmbeddingEncoder>, timeout: Duration) -> TriagePipeline {
        TriagePipeline::new(service(encoder), 2, timeout)
    }

    #[tokio::test]
    async fn triage_returns_both_fields() {
        let p = pipeline(Arc::new(SlowEncoder(Duration::ZERO)), Duration::from_secs(5));
        let t = p
            .triage("Login", "My login is broken and the server shows an error")
            .await
            .unwrap();
        assert!((1..=3).contains(&t.category_id));
        assert!((0.0..=1.0).contains(&t.sentiment_score));
        assert!(!t.sentiment_label.is_empty());
    }

    #[tokio::test]
    async fn triage_fails_on_empty_description() {
        let p = pipeline(Arc::new(SlowEncoder(Duration::ZERO)), Duration::from_secs(5));
        let err = p.triage("Subject", "   ").await.unwrap_err();
        match err {
            TriageError::Inference(e) => assert_eq!(e.kind, InferenceErrorKind::EmptyInput),
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn slow_call_times_out() {
        let p = pipeline(
            Arc::new(SlowEncoder(Duration::from_millis(400))),
            Duration::from_millis(50),
        );
        let err = p.encode("refund for my invoice").await.unwrap_err();
        assert_eq!(err.stage, Stage::Embed);
        assert!(matches!(err.kind, InferenceErrorKind::Timeout(_)));
        assert_eq!(err.preview, "refund for my invoice");
    }

    #[tokio::test]
    async fn timed_out_call_keeps_its_permit() {
        let p = TriagePipeline::new(
            service(Arc::new(SlowEncoder(Duration::from_millis(300)))),
            1,
            Duration::from_millis(50),
        );
        assert!(p.encode("first").await.is_err());
        // The only worker is still busy with the first call.
        assert_eq!(p.permits.available_permits(), 0);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(p.permits.available_permits(), 1);
    }

    fn slow<T: Send + 'static>(
        ms: u64,
        value: T,
    ) -> impl FnOnce(&InferenceService, &str) -> Result<T, InferenceError> + Send + 'static {
        move |_, _| {
            std::thread::sleep(Duration::from_millis(ms));
            Ok(value)
        }
    }

    fn neutral() -> Sentiment {
        Sentiment {
            label: "neutral".into(),
            score: 0.5,
        }
    }

    #[tokio::test]
    async fn stages_overlap_with_two_workers() {
        let p = pipeline(Arc::new(SlowEncoder(Duration::ZERO)), Duration::from_secs(5));
        let start = Instant::now();
        let t = p
            .triage_with("s", "slow ticket", slow(300, 2), slow(300, neutral()))
            .await
            .unwrap();
        assert_eq!(t.category_id, 2);
        assert!(start.elapsed() < Duration::from_millis(550), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn one_worker_serializes_stages() {
        let p = TriagePipeline::new(
            service(Arc::new(SlowEncoder(Duration::ZERO))),
            1,
            Duration::from_secs(5),
        );
        let start = Instant::now();
        p.triage_with("s", "slow ticket", slow(200, 1), slow(200, neutral()))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(400), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn sentiment_failure_discards_category() {
        let p = pipeline(Arc::new(SlowEncoder(Duration::ZERO)), Duration::from_secs(5));
        let err = p
            .triage_with(
                "s",
                "server error after the update",
                |s, text| s.classifier.classify(text),
                |_, text| {
                    Err(InferenceError::new(
                        Stage::Sentiment,
                        InferenceErrorKind::Runtime("scorer crashed".into()),
                        text,
                    ))
                },
            )
            .await
            .unwrap_err();
        match err {
            TriageError::Inference(e) => assert_eq!(e.stage, Stage::Sentiment),
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn classify_failure_returns_before_slow_sentiment() {
        let p = pipeline(Arc::new(SlowEncoder(Duration::ZERO)), Duration::from_secs(5));
        let start = Instant::now();
        let err = p
            .triage_with(
                "s",
                "text",
                |_, text| {
                    Err(InferenceError::new(
                        Stage::Classify,
                        InferenceErrorKind::Runtime("classifier crashed".into()),
                        text,
                    ))
                },
                slow(500, neutral()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TriageError::Inference(ref e) if e.stage == Stage::Classify));
        assert!(start.elapsed() < Duration::from_millis(400), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn only_sentiment_sees_empty_window() {
        // Sentiment reads the first 3 characters, which hold no words;
        // the classifier still finds tokens further on.
        let service = Arc::new(InferenceService::new(
            TextClassifier::load(None, 512).unwrap(),
            SentimentScorer::load(None, 3).unwrap(),
            Arc::new(SlowEncoder(Duration::ZERO)),
        ));
        let text = "?!? my login is broken";
        assert!(service.classifier.classify(text).is_ok());

        let p = TriagePipeline::new(service, 2, Duration::from_secs(5));
        match p.triage("Login", text).await.unwrap_err() {
            TriageError::Inference(e) => {
                assert_eq!(e.stage, Stage::Sentiment);
                assert_eq!(e.kind, InferenceErrorKind::EmptyInput);
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn search_waits_for_a_worker() {
        use crate::similarity::{KbEntry, MemoryIndex};

        let p = TriagePipeline::new(
            service(Arc::new(SlowEncoder(Duration::ZERO))),
            1,
            Duration::from_secs(5),
        );
        let mut index = MemoryIndex::new(2);
        index
            .insert(
                KbEntry {
                    id: 1,
                    title: "t".into(),
                    content: "c".into(),
                    categories: vec![],
                },
                vec![1.0, 0.0],
            )
            .unwrap();
        let index: Arc<dyn SimilarityIndex> = Arc::new(index);

        let held = p.permits.clone().acquire_owned().await.unwrap();
        let blocked = tokio::time::timeout(
            Duration::from_millis(100),
            p.search(index.clone(), vec![1.0, 0.0], 3),
        )
        .await;
        assert!(blocked.is_err());
        drop(held);

        let found = p.search(index, vec![1.0, 0.0], 3).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].entry.id, 1);
    }

    #[tokio::test]
    async fn encode_passes_through() {
        let p = pipeline(Arc::new(SlowEncoder(Duration::ZERO)), Duration::from_secs(5));
        assert_eq!(p.encode("anything").await.unwrap(), vec![0.5; 4]);
    }
}
