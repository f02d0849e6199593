//! SQLite-backed research index.
//!
//! Persistent topic/keyword index over past research artefacts so later
//! turns can reuse intelligence instead of re-crawling. Topics are dotted
//! paths (`pet.hamster.syrian`); confidence decays exponentially from its
//! initial value, and entries past their expiry never surface.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::core::types::Intent;

pub const INDEX_DB_NAME: &str = "research_index.sqlite3";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchIndexEntry {
    pub id: String,
    pub turn: u32,
    pub session_id: String,
    /// Dotted topic path, e.g. `pet.hamster.syrian`.
    pub primary_topic: String,
    pub keywords: Vec<String>,
    pub intent: Intent,
    pub quality: f64,
    pub confidence_initial: f64,
    /// Per-day exponential decay rate.
    pub confidence_decay_rate: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Path to the full research document on disk.
    pub doc_path: String,
    pub content_types: Vec<String>,
}

impl ResearchIndexEntry {
    /// Confidence now: `initial × e^(−decay × age_days)`.
    pub fn current_confidence(&self, now: DateTime<Utc>) -> f64 {
        let age_days = (now - self.created_at).num_seconds().max(0) as f64 / 86_400.0;
        self.confidence_initial * (-self.confidence_decay_rate * age_days).exp()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if now >= exp)
    }
}

/// A hit with its composite ranking score.
#[derive(Debug, Clone)]
pub struct IndexMatch {
    pub entry: ResearchIndexEntry,
    pub score: f64,
}

pub struct ResearchIndex {
    conn: Mutex<Connection>,
}

impl ResearchIndex {
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("creating {}", state_dir.display()))?;
        let path = state_dir.join(INDEX_DB_NAME);
        let conn = Connection::open(&path)
            .with_context(|| format!("opening research index at {}", path.display()))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS research_index (
                id TEXT PRIMARY KEY,
                turn INTEGER NOT NULL,
                session_id TEXT NOT NULL,
                primary_topic TEXT NOT NULL,
                keywords TEXT NOT NULL,
                intent TEXT NOT NULL,
                quality REAL NOT NULL,
                confidence_initial REAL NOT NULL,
                confidence_decay_rate REAL NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                doc_path TEXT NOT NULL,
                content_types TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_research_topic ON research_index(primary_topic);
            CREATE INDEX IF NOT EXISTS idx_research_session ON research_index(session_id);",
        )
        .context("creating research index schema")?;
        info!("[ResearchIndex] opened {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory index for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory index")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS research_index (
                id TEXT PRIMARY KEY,
                turn INTEGER NOT NULL,
                session_id TEXT NOT NULL,
                primary_topic TEXT NOT NULL,
                keywords TEXT NOT NULL,
                intent TEXT NOT NULL,
                quality REAL NOT NULL,
                confidence_initial REAL NOT NULL,
                confidence_decay_rate REAL NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT,
                doc_path TEXT NOT NULL,
                content_types TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn upsert(&self, entry: &ResearchIndexEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO research_index
                (id, turn, session_id, primary_topic, keywords, intent, quality,
                 confidence_initial, confidence_decay_rate, created_at, expires_at,
                 doc_path, content_types)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(id) DO UPDATE SET
                turn = excluded.turn,
                primary_topic = excluded.primary_topic,
                keywords = excluded.keywords,
                intent = excluded.intent,
                quality = excluded.quality,
                confidence_initial = excluded.confidence_initial,
                confidence_decay_rate = excluded.confidence_decay_rate,
                expires_at = excluded.expires_at,
                doc_path = excluded.doc_path,
                content_types = excluded.content_types",
            rusqlite::params![
                entry.id,
                entry.turn,
                entry.session_id,
                entry.primary_topic,
                serde_json::to_string(&entry.keywords)?,
                entry.intent.as_str(),
                entry.quality,
                entry.confidence_initial,
                entry.confidence_decay_rate,
                entry.created_at.to_rfc3339(),
                entry.expires_at.map(|t| t.to_rfc3339()),
                entry.doc_path,
                serde_json::to_string(&entry.content_types)?,
            ],
        )
        .context("upserting research index entry")?;
        debug!("[ResearchIndex] upserted {} ({})", entry.id, entry.primary_topic);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<ResearchIndexEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT * FROM research_index WHERE id = ?1")?;
        let mut rows = stmt.query([id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_entry(row)?)),
            None => Ok(None),
        }
    }

    fn all_for_session(&self, session_id: Option<&str>) -> Result<Vec<ResearchIndexEntry>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        match session_id {
            Some(sid) => {
                let mut stmt =
                    conn.prepare("SELECT * FROM research_index WHERE session_id = ?1")?;
                let mut rows = stmt.query([sid])?;
                while let Some(row) = rows.next()? {
                    out.push(row_to_entry(row)?);
                }
            }
            None => {
                let mut stmt = conn.prepare("SELECT * FROM research_index")?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    out.push(row_to_entry(row)?);
                }
            }
        }
        Ok(out)
    }

    /// Search by topic path: exact match, descendants, and ancestors all
    /// count, with decreasing topical weight. Expired entries are dropped;
    /// results are ranked by topical match + quality + freshness + current
    /// confidence.
    pub fn search_by_topic(
        &self,
        topic: &str,
        intent: Option<Intent>,
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<IndexMatch>> {
        let now = Utc::now();
        let mut matches: Vec<IndexMatch> = self
            .all_for_session(session_id)?
            .into_iter()
            .filter(|e| !e.is_expired(now))
            .filter(|e| intent.map(|i| e.intent == i).unwrap_or(true))
            .filter_map(|entry| {
                let topical = topic_affinity(topic, &entry.primary_topic)?;
                let score = rank_score(&entry, topical, now);
                Some(IndexMatch { entry, score })
            })
            .collect();

        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(limit);
        Ok(matches)
    }

    /// Search by keyword overlap.
    pub fn search_by_keywords(
        &self,
        keywords: &[String],
        session_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<IndexMatch>> {
        let now = Utc::now();
        let lowered: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        let mut matches: Vec<IndexMatch> = self
            .all_for_session(session_id)?
            .into_iter()
            .filter(|e| !e.is_expired(now))
            .filter_map(|entry| {
                let overlap = entry
                    .keywords
                    .iter()
                    .filter(|k| lowered.contains(&k.to_lowercase()))
                    .count();
                if overlap == 0 {
                    return None;
                }
                let topical = 0.4 * overlap as f64 / lowered.len().max(1) as f64;
                let score = rank_score(&entry, topical, now);
                Some(IndexMatch { entry, score })
            })
            .collect();

        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(limit);
        Ok(matches)
    }

    /// Entries under the same parent topic but a different leaf
    /// (`pet.hamster.syrian` → `pet.hamster.dwarf`).
    pub fn find_related(&self, topic: &str, limit: usize) -> Result<Vec<IndexMatch>> {
        let Some((parent, _leaf)) = topic.rsplit_once('.') else {
            return Ok(Vec::new());
        };
        let now = Utc::now();
        let prefix = format!("{}.", parent);
        let mut matches: Vec<IndexMatch> = self
            .all_for_session(None)?
            .into_iter()
            .filter(|e| !e.is_expired(now))
            .filter(|e| e.primary_topic.starts_with(&prefix) && e.primary_topic != topic)
            .map(|entry| {
                let score = rank_score(&entry, 0.5, now);
                IndexMatch { entry, score }
            })
            .collect();

        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(limit);
        Ok(matches)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: u64 = conn.query_row("SELECT COUNT(*) FROM research_index", [], |r| r.get(0))?;
        Ok(count)
    }
}

/// Topical affinity in [0, 1]; `None` when the paths are unrelated.
fn topic_affinity(query: &str, entry_topic: &str) -> Option<f64> {
    if query == entry_topic {
        return Some(1.0);
    }
    // Entry is more specific than the query (descendant).
    if entry_topic.starts_with(&format!("{}.", query)) {
        return Some(0.8);
    }
    // Entry is a parent of the query.
    if query.starts_with(&format!("{}.", entry_topic)) {
        return Some(0.6);
    }
    None
}

/// Composite score: topical match dominates; quality, freshness, and
/// decayed confidence each contribute a bounded share.
fn rank_score(entry: &ResearchIndexEntry, topical: f64, now: DateTime<Utc>) -> f64 {
    let age_days = (now - entry.created_at).num_seconds().max(0) as f64 / 86_400.0;
    let freshness = (-age_days / 7.0).exp(); // ~weekly half-life-ish decay
    let confidence = entry.current_confidence(now);
    topical * 2.0 + entry.quality + freshness * 0.5 + confidence
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<ResearchIndexEntry> {
    let keywords_json: String = row.get("keywords")?;
    let content_types_json: String = row.get("content_types")?;
    let created_at: String = row.get("created_at")?;
    let expires_at: Option<String> = row.get("expires_at")?;
    let intent: String = row.get("intent")?;

    Ok(ResearchIndexEntry {
        id: row.get("id")?,
        turn: row.get("turn")?,
        session_id: row.get("session_id")?,
        primary_topic: row.get("primary_topic")?,
        keywords: serde_json::from_str(&keywords_json).unwrap_or_default(),
        intent: Intent::parse(&intent),
        quality: row.get("quality")?,
        confidence_initial: row.get("confidence_initial")?,
        confidence_decay_rate: row.get("confidence_decay_rate")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        expires_at: expires_at.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .ok()
        }),
        doc_path: row.get("doc_path")?,
        content_types: serde_json::from_str(&content_types_json).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(id: &str, topic: &str, session: &str) -> ResearchIndexEntry {
        ResearchIndexEntry {
            id: id.to_string(),
            turn: 1,
            session_id: session.to_string(),
            primary_topic: topic.to_string(),
            keywords: vec!["hamster".into(), "breeder".into()],
            intent: Intent::Commerce,
            quality: 0.8,
            confidence_initial: 0.9,
            confidence_decay_rate: 0.1,
            created_at: Utc::now(),
            expires_at: None,
            doc_path: format!("/docs/{}.md", id),
            content_types: vec!["intelligence".into()],
        }
    }

    #[test]
    fn upsert_and_roundtrip() {
        let index = ResearchIndex::open_in_memory().unwrap();
        let e = entry("r1", "pet.hamster.syrian", "s1");
        index.upsert(&e).unwrap();

        let loaded = index.get("r1").unwrap().unwrap();
        assert_eq!(loaded.primary_topic, "pet.hamster.syrian");
        assert_eq!(loaded.keywords, vec!["hamster", "breeder"]);
        assert_eq!(loaded.intent, Intent::Commerce);
        assert_eq!(loaded.doc_path, "/docs/r1.md");

        // Upsert with same id replaces.
        let mut e2 = entry("r1", "pet.hamster.dwarf", "s1");
        e2.quality = 0.5;
        index.upsert(&e2).unwrap();
        assert_eq!(index.count().unwrap(), 1);
        assert_eq!(index.get("r1").unwrap().unwrap().primary_topic, "pet.hamster.dwarf");
    }

    #[test]
    fn topic_search_covers_exact_descendant_ancestor() {
        let index = ResearchIndex::open_in_memory().unwrap();
        index.upsert(&entry("exact", "pet.hamster", "s1")).unwrap();
        index.upsert(&entry("descendant", "pet.hamster.syrian", "s1")).unwrap();
        index.upsert(&entry("ancestor", "pet", "s1")).unwrap();
        index.upsert(&entry("unrelated", "auto.truck", "s1")).unwrap();

        let matches = index.search_by_topic("pet.hamster", None, None, 10).unwrap();
        let ids: Vec<&str> = matches.iter().map(|m| m.entry.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], "exact"); // highest topical weight wins
        assert!(ids.contains(&"descendant"));
        assert!(ids.contains(&"ancestor"));
    }

    #[test]
    fn intent_and_session_filters() {
        let index = ResearchIndex::open_in_memory().unwrap();
        let mut info = entry("info", "pet.hamster", "s1");
        info.intent = Intent::Informational;
        index.upsert(&info).unwrap();
        index.upsert(&entry("com", "pet.hamster", "s2")).unwrap();

        let commerce = index
            .search_by_topic("pet.hamster", Some(Intent::Commerce), None, 10)
            .unwrap();
        assert_eq!(commerce.len(), 1);
        assert_eq!(commerce[0].entry.id, "com");

        let s1_only = index.search_by_topic("pet.hamster", None, Some("s1"), 10).unwrap();
        assert_eq!(s1_only.len(), 1);
        assert_eq!(s1_only[0].entry.id, "info");
    }

    #[test]
    fn expired_entries_never_surface() {
        let index = ResearchIndex::open_in_memory().unwrap();
        let mut e = entry("old", "pet.hamster", "s1");
        e.expires_at = Some(Utc::now() - Duration::hours(1));
        index.upsert(&e).unwrap();
        assert!(index.search_by_topic("pet.hamster", None, None, 10).unwrap().is_empty());
    }

    #[test]
    fn confidence_decays_exponentially() {
        let mut e = entry("c", "pet", "s1");
        e.created_at = Utc::now() - Duration::days(10);
        // 0.9 × e^(−0.1 × 10) = 0.9 × e^−1
        let expected = 0.9 * (-1.0_f64).exp();
        assert!((e.current_confidence(Utc::now()) - expected).abs() < 1e-3);
    }

    #[test]
    fn keyword_search_requires_overlap() {
        let index = ResearchIndex::open_in_memory().unwrap();
        index.upsert(&entry("k1", "pet.hamster", "s1")).unwrap();
        let hits = index
            .search_by_keywords(&["breeder".to_string()], None, 10)
            .unwrap();
        assert_eq!(hits.len(), 1);
        let misses = index
            .search_by_keywords(&["quantum".to_string()], None, 10)
            .unwrap();
        assert!(misses.is_empty());
    }

    #[test]
    fn find_related_returns_siblings() {
        let index = ResearchIndex::open_in_memory().unwrap();
        index.upsert(&entry("syrian", "pet.hamster.syrian", "s1")).unwrap();
        index.upsert(&entry("dwarf", "pet.hamster.dwarf", "s1")).unwrap();
        index.upsert(&entry("dog", "pet.dog.beagle", "s1")).unwrap();

        let related = index.find_related("pet.hamster.syrian", 10).unwrap();
        assert_eq!(related.len(), 1);
        assert_eq!(related[0].entry.id, "dwarf");
    }
}
