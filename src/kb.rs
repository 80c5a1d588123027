//! Knowledge-base maintenance: add, bulk import, list.

use crate::config::load_config;
use crate::db::{open_db, open_db_readonly};
use crate::embed::{EmbeddingEncoder, encoder_from_config};
use crate::store;
use crate::TriageError;
use rusqlite::Connection;
use serde::Deserialize;
use std::path::Path;

/// One entry as accepted by `kb import`.
#[derive(Debug, Deserialize)]
pub struct NewKbEntry {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub categories: Vec<i64>,
}

/// Text that gets embedded for an entry.
pub fn embedding_text(title: &str, content: &str) -> String {
    format!("{title}\n{content}")
}

/// Embed and store one entry. Categories must exist, and the vector must
/// match the dimension of entries already stored.
pub fn add_entry(
    conn: &Connection,
    encoder: &dyn EmbeddingEncoder,
    entry: &NewKbEntry,
) -> Result<i64, TriageError> {
    if entry.title.trim().is_empty() {
        return Err(TriageError::Config("knowledge-base title must not be empty".into()));
    }
    for id in &entry.categories {
        if store::category_name(conn, *id)?.is_none() {
            return Err(TriageError::Config(format!("unknown category id {id}")));
        }
    }

    let embedding = encoder.encode(&embedding_text(&entry.title, &entry.content))?;
    if let Some(stored) = store::kb_dimensions(conn)?.into_iter().find(|d| *d != embedding.len()) {
        return Err(TriageError::DimensionMismatch {
            expected: stored,
            actual: embedding.len(),
        });
    }

    let id = store::insert_kb_entry(conn, &entry.title, &entry.content, &embedding, &entry.categories)?;
    log::info!("knowledge-base entry {id} added: {:?}", entry.title);
    Ok(id)
}

/// Parse a JSON array of entries and add them in order. Stops at the first
/// failing entry; entries before it stay stored.
pub fn import_entries(
    conn: &Connection,
    encoder: &dyn EmbeddingEncoder,
    raw: &str,
) -> Result<Vec<i64>, TriageError> {
    let entries: Vec<NewKbEntry> = serde_json::from_str(raw)?;
    let mut ids = Vec::with_capacity(entries.len());
    for (n, entry) in entries.iter().enumerate() {
        let id = add_entry(conn, encoder, entry).inspect_err(|e| {
            log::error!("import stopped at entry {n} ({:?}): {e}", entry.title)
        })?;
        ids.push(id);
    }
    Ok(ids)
}

/// Open the store and seed categories so entries can reference them.
fn open_for_write(db_path: &Path) -> Result<(Connection, std::sync::Arc<dyn EmbeddingEncoder>), TriageError> {
    let config = load_config()?;
    let conn = open_db(db_path)?;
    let classifier = crate::classify::TextClassifier::load(
        config.models.classifier.as_deref(),
        config.inference.max_tokens,
    )?;
    store::ensure_categories(&conn, classifier.labels())?;
    Ok((conn, encoder_from_config(&config)?))
}

pub fn handle_kb_add(
    db_path: &Path,
    title: &str,
    content: &str,
    categories: &[i64],
) -> Result<(), TriageError> {
    let (conn, encoder) = open_for_write(db_path)?;
    let entry = NewKbEntry {
        title: title.to_string(),
        content: content.to_string(),
        categories: categories.to_vec(),
    };
    let id = add_entry(&conn, encoder.as_ref(), &entry)?;
    println!("{}", serde_json::json!({ "id": id }));
    Ok(())
}

pub fn handle_kb_import(db_path: &Path, file: &Path) -> Result<(), TriageError> {
    let raw = std::fs::read_to_string(file)?;
    let (conn, encoder) = open_for_write(db_path)?;
    let ids = import_entries(&conn, encoder.as_ref(), &raw)?;
    eprintln!("desktriage: imported {} entries", ids.len());
    println!("{}", serde_json::json!({ "ids": ids }));
    Ok(())
}

pub fn handle_kb_list(db_path: &Path) -> Result<(), TriageError> {
    if !db_path.exists() {
        println!("[]");
        return Ok(());
    }
    let conn = open_db_readonly(db_path)?;
    let entries = store::list_kb(&conn)?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}
