//! CRUD over customers, tickets, categories and the knowledge base.

use crate::TriageError;
use crate::similarity::{KbEntry, decode_embedding, encode_embedding};
use rusqlite::{Connection, OptionalExtension, Row, params};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Open,
    InProgress,
    Closed,
}

impl Status {
    pub fn code(self) -> &'static str {
        match self {
            Status::Open => "O",
            Status::InProgress => "P",
            Status::Closed => "C",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "O" => Some(Status::Open),
            "P" => Some(Status::InProgress),
            "C" => Some(Status::Closed),
            _ => None,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn code(self) -> &'static str {
        match self {
            Priority::High => "H",
            Priority::Medium => "M",
            Priority::Low => "L",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "H" => Some(Priority::High),
            "M" => Some(Priority::Medium),
            "L" => Some(Priority::Low),
            _ => None,
        }
    }
}

/// Fields written at ticket creation.
#[derive(Debug, Clone)]
pub struct NewTicket<'a> {
    pub subject: &'a str,
    pub description: &'a str,
    pub priority: Priority,
    pub category_id: i64,
    pub sentiment_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TicketSummary {
    pub id: i64,
    pub subject: String,
    pub description: String,
    pub status: Status,
    pub priority: Priority,
    pub category_id: Option<i64>,
    pub category: Option<String>,
    pub customer_email: String,
    pub sentiment_score: Option<f64>,
    pub created_at: i64,
}

#[derive(Debug, Default, Serialize)]
pub struct Counts {
    pub customers: i64,
    pub tickets: i64,
    pub open_tickets: i64,
    pub categories: i64,
    pub kb_entries: i64,
}

pub(crate) fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// --- Customers & categories ---

/// Find or create the customer for `email`. `user_id` is linked only when
/// the row has no link yet and no other customer holds that user id, so a
/// user whose email changed still gets a customer row.
pub fn upsert_customer(conn: &Connection, email: &str, user_id: i64) -> Result<i64, TriageError> {
    let id: i64 = conn.query_row(
        "INSERT INTO customers (email) VALUES (?1)
         ON CONFLICT(email) DO UPDATE SET email = excluded.email
         RETURNING id",
        params![email],
        |r| r.get(0),
    )?;
    let linked = conn.execute(
        "UPDATE customers SET user_id = ?2
         WHERE id = ?1 AND user_id IS NULL
           AND NOT EXISTS (SELECT 1 FROM customers WHERE user_id = ?2)",
        params![id, user_id],
    )?;
    if linked == 0 {
        log::debug!("customer {id}: user {user_id} link unchanged");
    }
    Ok(id)
}

/// Seed one category per classifier label, `id = index + 1`. Existing rows
/// are kept, but row `i + 1` must be named `labels[i]`; a table seeded from
/// a different label set is a `Config` error. Returns how many were inserted.
pub fn ensure_categories(conn: &Connection, labels: &[String]) -> Result<usize, TriageError> {
    let tx = conn.unchecked_transaction()?;
    let mut inserted = 0;
    {
        let mut stmt =
            tx.prepare("INSERT OR IGNORE INTO ticket_categories (id, name) VALUES (?1, ?2)")?;
        for (i, label) in labels.iter().enumerate() {
            inserted += stmt.execute(params![i as i64 + 1, label])?;
        }
    }
    for (i, label) in labels.iter().enumerate() {
        let id = i as i64 + 1;
        match category_name(&tx, id)? {
            Some(name) if name == *label => {}
            found => {
                return Err(TriageError::Config(format!(
                    "ticket category {id} is {found:?}, classifier label is {label:?}"
                )));
            }
        }
    }
    tx.commit()?;
    if inserted > 0 {
        log::info!("seeded {inserted} ticket categories");
    }
    Ok(inserted)
}

pub fn category_name(conn: &Connection, id: i64) -> Result<Option<String>, TriageError> {
    let name = conn
        .query_row(
            "SELECT name FROM ticket_categories WHERE id = ?1",
            params![id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(name)
}

// --- Tickets ---

const TICKET_COLUMNS: &str = "
    t.id, t.subject, t.description, t.status, t.priority, t.category_id,
    c.name, cu.email, t.sentiment_score, t.created_at
    FROM tickets t
    JOIN customers cu ON cu.id = t.customer_id
    LEFT JOIN ticket_categories c ON c.id = t.category_id";

fn ticket_from_row(r: &Row<'_>) -> rusqlite::Result<TicketSummary> {
    let status: String = r.get(3)?;
    let priority: String = r.get(4)?;
    Ok(TicketSummary {
        id: r.get(0)?,
        subject: r.get(1)?,
        description: r.get(2)?,
        status: Status::from_code(&status).unwrap_or(Status::Open),
        priority: Priority::from_code(&priority).unwrap_or(Priority::Medium),
        category_id: r.get(5)?,
        category: r.get(6)?,
        customer_email: r.get(7)?,
        sentiment_score: r.get(8)?,
        created_at: r.get(9)?,
    })
}

/// Upsert the customer and insert the ticket in one transaction.
/// A `category_id` with no matching row fails on the foreign key and
/// nothing is written.
pub fn create_ticket(
    conn: &Connection,
    email: &str,
    user_id: i64,
    ticket: &NewTicket<'_>,
) -> Result<TicketSummary, TriageError> {
    let ts = now_ts();
    let tx = conn.unchecked_transaction()?;

    let customer_id = upsert_customer(&tx, email, user_id)?;
    tx.execute(
        "INSERT INTO tickets (customer_id, subject, description, status, priority,
                              category_id, created_at, updated_at, sentiment_score)
         VALUES (?1, ?2, ?3, 'O', ?4, ?5, ?6, ?6, ?7)",
        params![
            customer_id,
            ticket.subject,
            ticket.description,
            ticket.priority.code(),
            ticket.category_id,
            ts,
            f64::from(ticket.sentiment_score),
        ],
    )?;
    let id = tx.last_insert_rowid();
    let summary = tx.query_row(
        &format!("SELECT {TICKET_COLUMNS} WHERE t.id = ?1"),
        params![id],
        ticket_from_row,
    )?;

    tx.commit()?;
    Ok(summary)
}

/// All open tickets, newest first.
pub fn list_open_tickets(conn: &Connection) -> Result<Vec<TicketSummary>, TriageError> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {TICKET_COLUMNS} WHERE t.status = 'O' ORDER BY t.created_at DESC, t.id DESC"
    ))?;
    let rows = stmt
        .query_map([], ticket_from_row)?
        .collect::<Result<_, _>>()?;
    Ok(rows)
}

// --- Knowledge base ---

pub fn insert_kb_entry(
    conn: &Connection,
    title: &str,
    content: &str,
    embedding: &[f32],
    categories: &[i64],
) -> Result<i64, TriageError> {
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO knowledge_base (title, content, embedding, dimension) VALUES (?1, ?2, ?3, ?4)",
        params![title, content, encode_embedding(embedding), embedding.len() as i64],
    )?;
    let id = tx.last_insert_rowid();
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO knowledge_base_categories (kb_id, category_id) VALUES (?1, ?2)",
        )?;
        for category in categories {
            stmt.execute(params![id, category])?;
        }
    }
    tx.commit()?;
    Ok(id)
}

pub fn kb_categories(conn: &Connection, kb_id: i64) -> Result<Vec<i64>, TriageError> {
    let mut stmt = conn.prepare_cached(
        "SELECT category_id FROM knowledge_base_categories WHERE kb_id = ?1 ORDER BY category_id",
    )?;
    let ids = stmt
        .query_map(params![kb_id], |r| r.get(0))?
        .collect::<Result<_, _>>()?;
    Ok(ids)
}

pub fn list_kb(conn: &Connection) -> Result<Vec<KbEntry>, TriageError> {
    let rows: Vec<(i64, String, String)> = conn
        .prepare("SELECT id, title, content FROM knowledge_base ORDER BY id")?
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
        .collect::<Result<_, _>>()?;
    rows.into_iter()
        .map(|(id, title, content)| {
            Ok(KbEntry {
                id,
                title,
                content,
                categories: kb_categories(conn, id)?,
            })
        })
        .collect()
}

/// Every entry with its decoded embedding, ordered by id.
pub fn load_knowledge_base(conn: &Connection) -> Result<Vec<(KbEntry, Vec<f32>)>, TriageError> {
    let rows: Vec<(i64, String, String, Vec<u8>, i64)> = conn
        .prepare("SELECT id, title, content, embedding, dimension FROM knowledge_base ORDER BY id")?
        .query_map([], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })?
        .collect::<Result<_, _>>()?;

    let mut out = Vec::with_capacity(rows.len());
    for (id, title, content, blob, dimension) in rows {
        let embedding = decode_embedding(&blob)
            .map_err(|e| TriageError::Config(format!("knowledge_base {id}: {e}")))?;
        if embedding.len() as i64 != dimension {
            return Err(TriageError::Config(format!(
                "knowledge_base {id}: blob holds {} components, dimension column says {dimension}",
                embedding.len()
            )));
        }
        let categories = kb_categories(conn, id)?;
        out.push((
            KbEntry {
                id,
                title,
                content,
                categories,
            },
            embedding,
        ));
    }
    Ok(out)
}

/// Distinct stored embedding dimensions, ascending.
pub fn kb_dimensions(conn: &Connection) -> Result<Vec<usize>, TriageError> {
    let dims: Vec<i64> = conn
        .prepare("SELECT DISTINCT dimension FROM knowledge_base ORDER BY dimension")?
        .query_map([], |r| r.get(0))?
        .collect::<Result<_, _>>()?;
    Ok(dims.into_iter().map(|d| d as usize).collect())
}

pub fn count_knowledge_base(conn: &Connection) -> Result<i64, TriageError> {
    Ok(conn.query_row("SELECT COUNT(*) FROM knowledge_base", [], |r| r.get(0))?)
}

pub fn counts(conn: &Connection) -> Result<Counts, TriageError> {
    let count = |sql: &str| -> Result<i64, TriageError> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };
    Ok(Counts {
        customers: count("SELECT COUNT(*) FROM customers")?,
        tickets: count("SELECT COUNT(*) FROM tickets")?,
        open_tickets: count("SELECT COUNT(*) FROM tickets WHERE status = 'O'")?,
        categories: count("SELECT COUNT(*) FROM ticket_categories")?,
        kb_entries: count_knowledge_base(conn)?,
    })
}
