pub mod cache;
pub mod classify;
pub mod cli;
pub mod config;
pub mod db;
pub mod desk;
pub mod embed;
pub mod inference;
pub mod kb;
pub mod metrics;
pub mod pipeline;
pub mod preview;
pub mod schema;
pub mod sentiment;
pub mod serve;
pub mod similarity;
pub mod status;
pub mod store;

pub use inference::{InferenceError, InferenceErrorKind, Stage};

#[derive(Debug)]
pub enum TriageError {
    Inference(InferenceError),
    DimensionMismatch { expected: usize, actual: usize },
    Persistence(rusqlite::Error),
    Io(std::io::Error),
    Json(serde_json::Error),
    Config(String),
}

impl std::fmt::Display for TriageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriageError::Inference(e) => write!(f, "inference: {e}"),
            TriageError::DimensionMismatch { expected, actual } => write!(
                f,
                "dimension mismatch: index holds {expected}-d vectors, query has {actual}"
            ),
            TriageError::Persistence(e) => write!(f, "persistence: {e}"),
            TriageError::Io(e) => write!(f, "io: {e}"),
            TriageError::Json(e) => write!(f, "json: {e}"),
            TriageError::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for TriageError {}

impl From<InferenceError> for TriageError {
    fn from(e: InferenceError) -> Self {
        TriageError::Inference(e)
    }
}

impl From<rusqlite::Error> for TriageError {
    fn from(e: rusqlite::Error) -> Self {
        TriageError::Persistence(e)
    }
}

impl From<std::io::Error> for TriageError {
    fn from(e: std::io::Error) -> Self {
        TriageError::Io(e)
    }
}

impl From<serde_json::Error> for TriageError {
    fn from(e: serde_json::Error) -> Self {
        TriageError::Json(e)
    }
}

impl From<rusqlite_migration::Error> for TriageError {
    fn from(e: rusqlite_migration::Error) -> Self {
        match e {
            rusqlite_migration::Error::RusqliteError { query: _, err } => {
                TriageError::Persistence(err)
            }
            other => TriageError::Config(format!("migration: {other}")),
        }
    }
}

/// Multi-threaded runtime for the async command handlers.
pub(crate) fn runtime() -> Result<tokio::runtime::Runtime, TriageError> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}
