use crate::config::load_config;
use crate::db::open_db_readonly;
use crate::pipeline::InferenceService;
use crate::store;
use crate::TriageError;
use std::path::Path;

pub fn handle_status(db_path: &Path) -> Result<(), TriageError> {
    let config = load_config()?;
    let service = InferenceService::from_config(&config)?;
    eprintln!(
        "desktriage: classifier — {} categories ({})",
        service.classifier.num_categories(),
        service.classifier.model_hash()
    );
    eprintln!("desktriage: sentiment — {}", service.sentiment.model_hash());
    eprintln!("desktriage: encoder — {}", service.encoder.describe());
    eprintln!(
        "desktriage: retrieval — {} index, {} workers, {}s timeout",
        config.retrieval.index,
        config.inference.resolved_workers(),
        config.inference.timeout_secs
    );

    if !db_path.exists() {
        eprintln!("desktriage: no database at {}", db_path.display());
        return Ok(());
    }

    let db_size = std::fs::metadata(db_path)?.len();
    let wal_size = std::fs::metadata(db_path.with_extension("db-wal"))
        .map(|m| m.len())
        .ok();
    match wal_size {
        Some(ws) => eprintln!(
            "desktriage: database — {} (+{} WAL)",
            fmt_size(db_size),
            fmt_size(ws)
        ),
        None => eprintln!("desktriage: database — {}", fmt_size(db_size)),
    }

    let conn = open_db_readonly(db_path)?;
    let counts = store::counts(&conn)?;
    eprintln!(
        "desktriage: tickets — {} ({} open)",
        counts.tickets, counts.open_tickets
    );
    eprintln!("desktriage: customers — {}", counts.customers);
    eprintln!("desktriage: categories — {}", counts.categories);

    let dims = store::kb_dimensions(&conn)?;
    let encoder_dim = service.encoder.dimension();
    let dim_note = match dims.as_slice() {
        [] => String::new(),
        [d] if *d == encoder_dim => format!(" ({d}-d)"),
        other => format!(" (stored {other:?}, encoder {encoder_dim}: mismatch)"),
    };
    eprintln!("desktriage: knowledge base — {}{dim_note}", counts.kb_entries);

    println!("{}", serde_json::to_string(&counts)?);
    Ok(())
}

fn fmt_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
