//! Nearest-neighbor search over knowledge-base embeddings.
//!
//! Distance is Euclidean (L2). Results are ordered by ascending distance,
//! ties broken by ascending entry id, so the same query against the same
//! knowledge base always yields the same list. A query whose dimension
//! differs from the stored vectors fails with `DimensionMismatch` instead of
//! computing a meaningless distance.

use crate::TriageError;
use crate::store;
use rusqlite::Connection;
use serde::Serialize;
use std::sync::{Arc, Mutex};

/// Knowledge-base article without its embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KbEntry {
    pub id: i64,
    pub title: String,
    pub content: String,
    pub categories: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub entry: KbEntry,
    pub distance: f64,
}

pub trait SimilarityIndex: Send + Sync {
    /// The `k` entries nearest to `query`, nearest first.
    fn top_k(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, TriageError>;

    /// Number of indexed entries.
    fn len(&self) -> Result<usize, TriageError>;

    fn is_empty(&self) -> Result<bool, TriageError> {
        Ok(self.len()? == 0)
    }
}

/// Little-endian f32 blob, as stored in `knowledge_base.embedding`.
pub fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(vector.len() * 4);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>, String> {
    if blob.len() % 4 != 0 {
        return Err(format!("embedding blob length {} is not a multiple of 4", blob.len()));
    }
    let mut out = Vec::with_capacity(blob.len() / 4);
    for chunk in blob.chunks_exact(4) {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !value.is_finite() {
            return Err("embedding contains non-finite values".into());
        }
        out.push(value);
    }
    Ok(out)
}

/// Euclidean distance. Both slices must have the same length.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b)
        .map(|(&x, &y)| {
            let d = f64::from(x) - f64::from(y);
            d * d
        })
        .sum::<f64>()
        .sqrt()
}

fn check_query(query: &[f32], expected: usize) -> Result<(), TriageError> {
    if query.len() != expected {
        return Err(TriageError::DimensionMismatch {
            expected,
            actual: query.len(),
        });
    }
    if query.iter().any(|v| !v.is_finite()) {
        return Err(TriageError::Config("query vector contains non-finite values".into()));
    }
    Ok(())
}

fn rank(mut hits: Vec<Neighbor>, k: usize) -> Vec<Neighbor> {
    hits.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then(a.entry.id.cmp(&b.entry.id))
    });
    hits.truncate(k);
    hits
}

// --- In-memory brute force ---

/// Snapshot of the knowledge base scanned linearly on every query.
pub struct MemoryIndex {
    dimension: usize,
    entries: Vec<(KbEntry, Vec<f32>)>,
}

impl MemoryIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            entries: Vec::new(),
        }
    }

    /// Load every stored entry. Fails if any has a different dimension.
    pub fn load(conn: &Connection, dimension: usize) -> Result<Self, TriageError> {
        let mut index = Self::new(dimension);
        for (entry, embedding) in store::load_knowledge_base(conn)? {
            index.insert(entry, embedding)?;
        }
        log::info!(
            "loaded {} knowledge-base entries into memory index",
            index.entries.len()
        );
        Ok(index)
    }

    pub fn insert(&mut self, entry: KbEntry, embedding: Vec<f32>) -> Result<(), TriageError> {
        if embedding.len() != self.dimension {
            return Err(TriageError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            });
        }
        self.entries.push((entry, embedding));
        Ok(())
    }
}

impl SimilarityIndex for MemoryIndex {
    fn top_k(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, TriageError> {
        check_query(query, self.dimension)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let hits = self
            .entries
            .iter()
            .map(|(entry, embedding)| Neighbor {
                entry: entry.clone(),
                distance: l2_distance(query, embedding),
            })
            .collect();
        Ok(rank(hits, k))
    }

    fn len(&self) -> Result<usize, TriageError> {
        Ok(self.entries.len())
    }
}

// --- Store-side scan ---

/// Delegates the scan to SQLite through the `l2_distance` UDF.
/// Always reflects the current table contents.
pub struct SqliteIndex {
    db: Arc<Mutex<Connection>>,
}

impl SqliteIndex {
    /// `db` must have had [`crate::db::register_udfs`] applied.
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }
}

impl SimilarityIndex for SqliteIndex {
    fn top_k(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>, TriageError> {
        let conn = self
            .db
            .lock()
            .map_err(|e| TriageError::Config(format!("db lock: {e}")))?;

        let dimensions: Vec<i64> = conn
            .prepare("SELECT DISTINCT dimension FROM knowledge_base ORDER BY dimension")?
            .query_map([], |r| r.get(0))?
            .collect::<Result<_, _>>()?;
        let Some(&stored) = dimensions.first() else {
            return Ok(Vec::new());
        };
        if dimensions.len() > 1 {
            return Err(TriageError::Config(format!(
                "knowledge base holds mixed embedding dimensions {dimensions:?}"
            )));
        }
        check_query(query, stored as usize)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let blob = encode_embedding(query);
        let mut stmt = conn.prepare_cached(
            "SELECT id, title, content, l2_distance(embedding, ?1) AS distance
             FROM knowledge_base
             ORDER BY distance ASC, id ASC
             LIMIT ?2",
        )?;
        let rows: Vec<(i64, String, String, f64)> = stmt
            .query_map(rusqlite::params![blob, k as i64], |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
            })?
            .collect::<Result<_, _>>()?;

        let mut hits = Vec::with_capacity(rows.len());
        for (id, title, content, distance) in rows {
            hits.push(Neighbor {
                entry: KbEntry {
                    id,
                    title,
                    content,
                    categories: store::kb_categories(&conn, id)?,
                },
                distance,
            });
        }
        Ok(hits)
    }

    fn len(&self) -> Result<usize, TriageError> {
        let conn = self
            .db
            .lock()
            .map_err(|e| TriageError::Config(format!("db lock: {e}")))?;
        Ok(store::count_knowledge_base(&conn)? as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: i64) -> KbEntry {
        KbEntry {
            id,
            title: format!("article {id}"),
            content: String::new(),
            categories: vec![],
        }
    }

    fn index(vectors: &[(i64, [f32; 2])]) -> MemoryIndex {
        let mut idx = MemoryIndex::new(2);
        for (id, v) in vectors {
            idx.insert(entry(*id), v.to_vec()).unwrap();
        }
        idx
    }

    fn ids(hits: &[Neighbor]) -> Vec<i64> {
        hits.iter().map(|h| h.entry.id).collect()
    }

    #[test]
    fn orders_by_ascending_distance() {
        let idx = index(&[(1, [5.0, 0.0]), (2, [1.0, 0.0]), (3, [0.0, 3.0]), (4, [0.5, 0.0])]);
        let hits = idx.top_k(&[0.0, 0.0], 3).unwrap();
        assert_eq!(ids(&hits), vec![4, 2, 3]);
        assert!((hits[0].distance - 0.5).abs() < 1e-9);
        assert!((hits[2].distance - 3.0).abs() < 1e-9);
    }

    #[test]
    fn ties_break_by_ascending_id() {
        let idx = index(&[(9, [1.0, 0.0]), (3, [0.0, 1.0]), (5, [-1.0, 0.0])]);
        let hits = idx.top_k(&[0.0, 0.0], 3).unwrap();
        assert_eq!(ids(&hits), vec![3, 5, 9]);
    }

    #[test]
    fn fewer_entries_than_k() {
        let idx = index(&[(1, [1.0, 1.0])]);
        assert_eq!(idx.top_k(&[0.0, 0.0], 3).unwrap().len(), 1);
    }

    #[test]
    fn empty_index_returns_empty() {
        let idx = MemoryIndex::new(2);
        assert!(idx.top_k(&[0.0, 0.0], 3).unwrap().is_empty());
        assert!(idx.is_empty().unwrap());
    }

    #[test]
    fn query_dimension_mismatch() {
        let idx = index(&[(1, [1.0, 1.0])]);
        let err = idx.top_k(&[0.0, 0.0, 0.0], 3).unwrap_err();
        assert!(matches!(
            err,
            TriageError::DimensionMismatch { expected: 2, actual: 3 }
        ));
    }

    #[test]
    fn insert_dimension_mismatch() {
        let mut idx = MemoryIndex::new(2);
        assert!(matches!(
            idx.insert(entry(1), vec![1.0]),
            Err(TriageError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn repeated_queries_identical() {
        let idx = index(&[(1, [0.3, 0.1]), (2, [0.2, 0.2]), (3, [0.1, 0.3]), (4, [0.9, 0.9])]);
        let first = idx.top_k(&[0.2, 0.2], 3).unwrap();
        for _ in 0..10 {
            assert_eq!(idx.top_k(&[0.2, 0.2], 3).unwrap(), first);
        }
    }

    #[test]
    fn non_finite_query_rejected() {
        let idx = index(&[(1, [1.0, 1.0])]);
        assert!(idx.top_k(&[f32::NAN, 0.0], 1).is_err());
    }

    #[test]
    fn embedding_blob_round_trip() {
        let v = vec![0.25f32, -1.5, 3.0];
        assert_eq!(decode_embedding(&encode_embedding(&v)).unwrap(), v);
        assert!(decode_embedding(&[0, 1, 2]).is_err());
        assert!(decode_embedding(&f32::INFINITY.to_le_bytes()).is_err());
    }

    fn sqlite_index(vectors: &[(i64, [f32; 2])]) -> SqliteIndex {
        let conn = crate::db::open_memory_db().unwrap();
        for (id, v) in vectors {
            conn.execute(
                "INSERT INTO knowledge_base (id, title, content, embedding, dimension)
                 VALUES (?1, ?2, '', ?3, 2)",
                rusqlite::params![id, format!("article {id}"), encode_embedding(v)],
            )
            .unwrap();
        }
        SqliteIndex::new(Arc::new(Mutex::new(conn)))
    }

    #[test]
    fn sqlite_index_matches_memory_index() {
        let data = [(1, [5.0, 0.0]), (2, [1.0, 0.0]), (3, [0.0, 1.0]), (4, [0.5, 0.0]), (5, [-1.0, 0.0])];
        let mem = index(&data);
        let sql = sqlite_index(&data);
        let q = [0.0, 0.0];
        assert_eq!(ids(&sql.top_k(&q, 3).unwrap()), ids(&mem.top_k(&q, 3).unwrap()));
        assert_eq!(ids(&sql.top_k(&q, 3).unwrap()), vec![4, 2, 3]);
        assert_eq!(sql.len().unwrap(), 5);
    }

    #[test]
    fn sqlite_index_empty_and_mismatch() {
        let empty = sqlite_index(&[]);
        assert!(empty.top_k(&[0.0; 7], 3).unwrap().is_empty());

        let idx = sqlite_index(&[(1, [1.0, 1.0])]);
        assert!(matches!(
            idx.top_k(&[0.0; 3], 3),
            Err(TriageError::DimensionMismatch { expected: 2, actual: 3 })
        ));
    }
}
