//! Ticket creation, dashboard listing and knowledge-base retrieval.
//!
//! `Desk` owns the store handle, the triage pipeline, the similarity index
//! and the open-ticket cache. Callers arrive already authenticated and hand
//! in a [`UserContext`].

use crate::cache::{OPEN_TICKETS_TTL, SearchCache, open_tickets_key};
use crate::config::{TriageConfig, load_config};
use crate::db::open_db;
use crate::inference::word_tokenize;
use crate::metrics;
use crate::pipeline::{InferenceService, TriagePipeline};
use crate::preview::preview;
use crate::similarity::{MemoryIndex, SimilarityIndex, SqliteIndex};
use crate::store::{self, NewTicket, Priority, TicketSummary};
use crate::TriageError;
use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Entries returned per retrieval.
pub const SIMILAR_SOLUTIONS: usize = 3;

/// Identity of the authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    pub user_id: i64,
    pub username: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimilarSolution {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub category_ids: Vec<i64>,
    pub distance: f64,
    /// `1 / (1 + distance)`, in (0, 1].
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub tickets: Vec<TicketSummary>,
    pub search_query: Option<String>,
    pub similar_solutions: Vec<SimilarSolution>,
}

pub struct Desk {
    db: Arc<Mutex<Connection>>,
    pipeline: TriagePipeline,
    index: Arc<dyn SimilarityIndex>,
    cache: SearchCache<Arc<Vec<TicketSummary>>>,
}

impl Desk {
    pub fn new(
        db: Arc<Mutex<Connection>>,
        pipeline: TriagePipeline,
        index: Arc<dyn SimilarityIndex>,
        cache: SearchCache<Arc<Vec<TicketSummary>>>,
    ) -> Self {
        Self {
            db,
            pipeline,
            index,
            cache,
        }
    }

    /// Load models, seed categories and build the configured index.
    pub fn open(conn: Connection, config: &TriageConfig) -> Result<Self, TriageError> {
        let service = Arc::new(InferenceService::from_config(config)?);
        store::ensure_categories(&conn, service.classifier.labels())?;
        check_kb_dimension(&conn, service.encoder.dimension())?;

        let snapshot = match config.retrieval.index.as_str() {
            "sqlite" => None,
            _ => Some(MemoryIndex::load(&conn, service.encoder.dimension())?),
        };
        let db = Arc::new(Mutex::new(conn));
        let index: Arc<dyn SimilarityIndex> = match snapshot {
            Some(memory) => Arc::new(memory),
            None => Arc::new(SqliteIndex::new(db.clone())),
        };

        let pipeline = TriagePipeline::from_config(service, config);
        Ok(Self::new(db, pipeline, index, SearchCache::new()))
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, TriageError> {
        self.db
            .lock()
            .map_err(|e| TriageError::Config(format!("db lock: {e}")))
    }

    /// Triage, persist, then invalidate the creator's open-ticket listing.
    /// A triage failure persists nothing.
    pub async fn create_ticket(
        &self,
        user: &UserContext,
        subject: &str,
        description: &str,
        priority: Priority,
    ) -> Result<TicketSummary, TriageError> {
        let triage = match self.pipeline.triage(subject, description).await {
            Ok(t) => t,
            Err(e) => {
                log::error!("ticket creation aborted for user {}: {e}", user.user_id);
                return Err(e);
            }
        };

        let ticket = {
            let conn = self.conn()?;
            store::create_ticket(
                &conn,
                &user.email,
                user.user_id,
                &NewTicket {
                    subject,
                    description,
                    priority,
                    category_id: triage.category_id,
                    sentiment_score: triage.sentiment_score,
                },
            )
            .inspect_err(|e| log::error!("ticket insert failed for user {}: {e}", user.user_id))?
        };

        self.cache.invalidate(&open_tickets_key(user.user_id));
        metrics::record_ticket_created();
        log::info!(
            "ticket {} created by {}: category {} sentiment {:.3} ({:?})",
            ticket.id,
            user.username,
            triage.category_id,
            triage.sentiment_score,
            preview(subject)
        );
        Ok(ticket)
    }

    /// Open tickets, optionally filtered by `search`, plus similar solutions
    /// for a non-empty search. Retrieval failures degrade to an empty list.
    pub async fn dashboard(
        &self,
        user: &UserContext,
        search: Option<&str>,
    ) -> Result<Dashboard, TriageError> {
        let base = self.open_tickets(user)?;
        let search = search.map(str::trim).filter(|q| !q.is_empty());

        let Some(query) = search else {
            return Ok(Dashboard {
                tickets: base.as_ref().clone(),
                search_query: None,
                similar_solutions: Vec::new(),
            });
        };

        let tickets = filter_tickets(&base, query);
        let similar_solutions = match self.retrieve(query).await {
            Ok(found) => found,
            Err(e) => {
                log::error!("similar-solution lookup failed: {e}");
                Vec::new()
            }
        };
        Ok(Dashboard {
            tickets,
            search_query: Some(query.to_string()),
            similar_solutions,
        })
    }

    /// Cached unfiltered listing; populated from the store on a miss unless
    /// the key was invalidated while the store was being read.
    fn open_tickets(&self, user: &UserContext) -> Result<Arc<Vec<TicketSummary>>, TriageError> {
        let key = open_tickets_key(user.user_id);
        if let Some(hit) = self.cache.get(&key) {
            log::debug!("cache hit {key}");
            metrics::record_cache_lookup(true);
            return Ok(hit);
        }
        log::debug!("cache miss {key}");
        metrics::record_cache_lookup(false);
        let generation = self.cache.generation(&key);
        let tickets = Arc::new(store::list_open_tickets(&*self.conn()?)?);
        if !self
            .cache
            .set_if_current(&key, tickets.clone(), OPEN_TICKETS_TTL, generation)
        {
            log::debug!("{key} invalidated during load, not cached");
        }
        Ok(tickets)
    }

    /// Up to three knowledge-base entries nearest to `query`.
    pub async fn retrieve(&self, query: &str) -> Result<Vec<SimilarSolution>, TriageError> {
        let vector = self.pipeline.encode(query).await?;
        let neighbors = self
            .pipeline
            .search(self.index.clone(), vector, SIMILAR_SOLUTIONS)
            .await?;
        log::info!(
            "retrieved {} solutions for {:?}",
            neighbors.len(),
            preview(query)
        );
        Ok(neighbors
            .into_iter()
            .map(|n| SimilarSolution {
                id: n.entry.id,
                title: n.entry.title,
                content: n.entry.content,
                category_ids: n.entry.categories,
                distance: n.distance,
                similarity: 1.0 / (1.0 + n.distance),
            })
            .collect())
    }
}

/// Stored KB vectors must match the encoder's dimension.
fn check_kb_dimension(conn: &Connection, dimension: usize) -> Result<(), TriageError> {
    match store::kb_dimensions(conn)?.into_iter().find(|d| *d != dimension) {
        Some(stored) => Err(TriageError::DimensionMismatch {
            expected: stored,
            actual: dimension,
        }),
        None => Ok(()),
    }
}

/// Tickets whose subject or description contains every query token.
fn filter_tickets(tickets: &[TicketSummary], query: &str) -> Vec<TicketSummary> {
    let terms = word_tokenize(query);
    if terms.is_empty() {
        return tickets.to_vec();
    }
    tickets
        .iter()
        .filter(|t| {
            let subject = word_tokenize(&t.subject);
            let description = word_tokenize(&t.description);
            terms
                .iter()
                .all(|term| subject.contains(term) || description.contains(term))
        })
        .cloned()
        .collect()
}

// --- CLI handlers ---

fn open_desk(db_path: &Path) -> Result<(Desk, TriageConfig), TriageError> {
    let config = load_config()?;
    let conn = open_db(db_path)?;
    let desk = Desk::open(conn, &config)?;
    Ok((desk, config))
}

pub fn handle_ticket(
    db_path: &Path,
    user: &UserContext,
    subject: &str,
    description: &str,
    priority: Priority,
) -> Result<(), TriageError> {
    let (desk, config) = open_desk(db_path)?;
    crate::runtime()?.block_on(async {
        let provider = metrics::init_meter_provider(&config.metrics);
        let result = desk.create_ticket(user, subject, description, priority).await;
        if let Some(p) = provider {
            let _ = p.shutdown();
        }
        println!("{}", serde_json::to_string_pretty(&result?)?);
        Ok::<(), TriageError>(())
    })
}

pub fn handle_dashboard(
    db_path: &Path,
    user: &UserContext,
    search: Option<&str>,
) -> Result<(), TriageError> {
    let (desk, _) = open_desk(db_path)?;
    let dashboard = crate::runtime()?.block_on(desk.dashboard(user, search))?;
    println!("{}", serde_json::to_string_pretty(&dashboard)?);
    Ok(())
}

pub fn handle_similar(db_path: &Path, query: &str) -> Result<(), TriageError> {
    let (desk, _) = open_desk(db_path)?;
    let found = crate::runtime()?.block_on(desk.retrieve(query))?;
    println!("{}", serde_json::to_string_pretty(&found)?);
    Ok(())
}
