//! User-scoped response cache with hybrid retrieval.
//!
//! Caches final responses per `(session, intent)` fingerprint partition.
//! Each entry is a JSON file plus an `.npy` sidecar holding the cached
//! query's embedding; `index.json` maps fingerprints to entry ids. Retrieval
//! filters by intent and freshness (quality-weighted staleness grace), then
//! runs hybrid semantic+lexical ranking over the surviving candidates.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::embedding::EmbeddingService;
use super::fingerprint::compute_fingerprint;
use super::hybrid::{hybrid_search, HybridCandidate, HybridParams};
use crate::browser::session_store::atomic_write;
use crate::core::types::Intent;

pub const RESPONSE_CACHE_DIR_NAME: &str = "response_cache";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseCacheEntry {
    pub id: String,
    pub query: String,
    pub intent: Intent,
    /// Topic/domain label from topic extraction; informational only, never
    /// a hard filter (topic extraction is too volatile).
    pub topic: String,
    pub response: String,
    pub quality_score: f64,
    pub ttl_hours: i64,
    pub created_at: DateTime<Utc>,
    pub context_fingerprint: String,
    pub session_id: String,
}

/// A cache hit with its scores, ready for the caller to serve or discard.
#[derive(Debug, Clone)]
pub struct CacheCandidate {
    pub entry: ResponseCacheEntry,
    pub hybrid_score: f64,
    pub semantic_score: f64,
    pub keyword_score: f64,
    pub age_hours: f64,
}

pub struct ResponseCache {
    dir: PathBuf,
    embeddings: Arc<EmbeddingService>,
    enabled: bool,
    similarity_threshold: f32,
    default_ttl_hours: i64,
    /// fingerprint → entry ids
    index: Mutex<HashMap<String, Vec<String>>>,
}

impl ResponseCache {
    pub fn open(
        state_dir: &std::path::Path,
        embeddings: Arc<EmbeddingService>,
        enabled: bool,
        similarity_threshold: f32,
        default_ttl_hours: i64,
    ) -> Self {
        let dir = state_dir.join(RESPONSE_CACHE_DIR_NAME);
        let index = load_index(&dir);
        info!(
            "[ResponseCache] Initialized at {} ({} fingerprints)",
            dir.display(),
            index.len()
        );
        Self {
            dir,
            embeddings,
            enabled,
            similarity_threshold,
            default_ttl_hours,
            index: Mutex::new(index),
        }
    }

    pub fn default_ttl_hours(&self) -> i64 {
        self.default_ttl_hours
    }

    /// Find cached responses for this user+intent similar to `query`.
    pub async fn search(
        &self,
        query: &str,
        intent: Intent,
        session_id: &str,
    ) -> Vec<CacheCandidate> {
        if !self.enabled {
            debug!("[ResponseCache] disabled — skipping lookup");
            return Vec::new();
        }

        let fp = compute_fingerprint(session_id, intent);
        let mut ids = {
            let index = self.index.lock().await;
            index.get(&fp).cloned().unwrap_or_default()
        };

        // Legacy-fingerprint migration: entries written before the current
        // fingerprint algorithm are found by scanning for the session id.
        if ids.is_empty() {
            ids = self.scan_legacy_ids(&fp, session_id).await;
        }

        if ids.is_empty() {
            info!("[ResponseCache] No cached responses for fingerprint {}", fp);
            return Vec::new();
        }

        // Load entries and pre-filter on intent.
        let mut entries: Vec<(ResponseCacheEntry, Vec<f32>)> = Vec::new();
        for id in &ids {
            let Some(entry) = self.load_entry(id) else {
                continue;
            };
            if entry.intent != intent {
                debug!(
                    "[ResponseCache] Intent mismatch: {} != {}",
                    entry.intent.as_str(),
                    intent.as_str()
                );
                continue;
            }
            let Some(embedding) = self.load_embedding(id) else {
                warn!("[ResponseCache] Missing embedding for {}", id);
                continue;
            };
            entries.push((entry, embedding));
        }

        if entries.is_empty() {
            return Vec::new();
        }
        info!("[ResponseCache] {} candidates after pre-filter", entries.len());

        let Some(query_embedding) = self.embeddings.embed(query).await else {
            warn!("[ResponseCache] Embeddings unavailable, cannot perform hybrid search");
            return Vec::new();
        };

        let candidates: Vec<HybridCandidate> = entries
            .iter()
            .enumerate()
            .map(|(i, (entry, embedding))| HybridCandidate {
                text: entry.query.clone(),
                embedding: embedding.clone(),
                domain: Some(entry.topic.clone()),
                payload: i,
            })
            .collect();

        let params = HybridParams {
            min_embedding_score: self.similarity_threshold as f64,
            ..HybridParams::default()
        };
        // Topic labels are too volatile for a hard domain filter; semantic
        // similarity carries the topical burden.
        let matches = hybrid_search(query, &query_embedding, &candidates, None, params);

        let now = Utc::now();
        let mut out = Vec::new();
        for m in matches {
            let (entry, _) = &entries[m.payload];
            let age_hours = (now - entry.created_at).num_seconds() as f64 / 3600.0;
            let staleness_ratio = age_hours / entry.ttl_hours.max(1) as f64;

            // Quality-weighted staleness grace.
            let max_ratio = if entry.quality_score >= 0.90 {
                1.50
            } else if entry.quality_score >= 0.80 {
                1.20
            } else {
                1.00
            };
            if staleness_ratio > max_ratio {
                debug!(
                    "[ResponseCache] Too stale: age={:.1}h, ttl={}h, ratio={:.2} > {:.2}",
                    age_hours, entry.ttl_hours, staleness_ratio, max_ratio
                );
                continue;
            }

            out.push(CacheCandidate {
                entry: entry.clone(),
                hybrid_score: m.hybrid_score,
                semantic_score: m.semantic_score,
                keyword_score: m.keyword_score,
                age_hours,
            });
        }

        info!("[ResponseCache] Final: {} candidates (after staleness check)", out.len());
        out
    }

    /// Store a response. Returns the entry id, or `None` when caching is
    /// disabled or embeddings are unavailable.
    pub async fn set(
        &self,
        query: &str,
        intent: Intent,
        topic: &str,
        response: &str,
        quality_score: f64,
        ttl_hours: Option<i64>,
        session_id: &str,
    ) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let fp = compute_fingerprint(session_id, intent);
        let id = entry_id(query, intent, &fp);

        let Some(embedding) = self.embeddings.embed(query).await else {
            warn!("[ResponseCache] Embeddings unavailable, cannot cache");
            return None;
        };

        let entry = ResponseCacheEntry {
            id: id.clone(),
            query: query.to_string(),
            intent,
            topic: topic.to_string(),
            response: response.to_string(),
            quality_score,
            ttl_hours: ttl_hours.unwrap_or(self.default_ttl_hours),
            created_at: Utc::now(),
            context_fingerprint: fp.clone(),
            session_id: session_id.to_string(),
        };

        if let Err(e) = self.write_entry(&entry, &embedding) {
            warn!("[ResponseCache] Failed to store response: {}", e);
            return None;
        }

        {
            let mut index = self.index.lock().await;
            let ids = index.entry(fp).or_default();
            if !ids.contains(&id) {
                ids.push(id.clone());
            }
            if let Err(e) = self.write_index(&index) {
                warn!("[ResponseCache] Failed to save index: {}", e);
            }
        }

        info!(
            "[ResponseCache] stored {} (session={}, ttl={}h, quality={:.2})",
            id,
            crate::llm::truncate(session_id, 8),
            entry.ttl_hours,
            quality_score
        );
        Some(id)
    }

    async fn scan_legacy_ids(&self, current_fp: &str, session_id: &str) -> Vec<String> {
        let index = self.index.lock().await;
        let mut legacy = Vec::new();
        for (fp, ids) in index.iter() {
            if fp == current_fp {
                continue;
            }
            // Load one entry per bucket to check ownership.
            let Some(first) = ids.first() else { continue };
            let Some(entry) = self.load_entry(first) else {
                continue;
            };
            if entry.session_id == session_id {
                info!(
                    "[ResponseCache] Found {} legacy cache(s) with old fingerprint {} for session {}",
                    ids.len(),
                    fp,
                    crate::llm::truncate(session_id, 8)
                );
                legacy.extend(ids.iter().cloned());
            }
        }
        legacy
    }

    fn load_entry(&self, id: &str) -> Option<ResponseCacheEntry> {
        let path = self.dir.join(format!("{}.json", id));
        let content = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    fn load_embedding(&self, id: &str) -> Option<Vec<f32>> {
        let path = self.dir.join(format!("{}.npy", id));
        let bytes = std::fs::read(path).ok()?;
        read_npy_f32(&bytes)
    }

    fn write_entry(&self, entry: &ResponseCacheEntry, embedding: &[f32]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating {}", self.dir.display()))?;
        let npy = write_npy_f32(embedding);
        atomic_write(&self.dir.join(format!("{}.npy", entry.id)), &npy)?;
        let json = serde_json::to_string_pretty(entry).context("serializing cache entry")?;
        atomic_write(&self.dir.join(format!("{}.json", entry.id)), json.as_bytes())?;
        Ok(())
    }

    fn write_index(&self, index: &HashMap<String, Vec<String>>) -> Result<()> {
        let json = serde_json::to_string_pretty(index).context("serializing index")?;
        atomic_write(&self.dir.join("index.json"), json.as_bytes())
    }

    pub async fn stats(&self) -> (usize, usize) {
        let index = self.index.lock().await;
        let entries = index.values().map(|v| v.len()).sum();
        (index.len(), entries)
    }
}

fn entry_id(query: &str, intent: Intent, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update(b":");
    hasher.update(intent.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(fingerprint.as_bytes());
    let digest = hasher.finalize();
    digest
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn load_index(dir: &std::path::Path) -> HashMap<String, Vec<String>> {
    let path = dir.join("index.json");
    match std::fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

// ───────────────────────────────────────────────────────────────────────────
// NPY sidecar (v1 header, little-endian f32, 1-D)
// ───────────────────────────────────────────────────────────────────────────

fn write_npy_f32(vector: &[f32]) -> Vec<u8> {
    let header_body = format!(
        "{{'descr': '<f4', 'fortran_order': False, 'shape': ({},), }}",
        vector.len()
    );
    // Total header (magic 6 + version 2 + len 2 + body) padded to 64 bytes,
    // newline-terminated.
    let unpadded = 10 + header_body.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let mut header = header_body.into_bytes();
    header.extend(std::iter::repeat(b' ').take(padding));
    header.push(b'\n');

    let mut out = Vec::with_capacity(10 + header.len() + vector.len() * 4);
    out.extend_from_slice(b"\x93NUMPY");
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(&header);
    for v in vector {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn read_npy_f32(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() < 10 || &bytes[0..6] != b"\x93NUMPY" {
        return None;
    }
    let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
    let data_start = 10 + header_len;
    if bytes.len() < data_start {
        return None;
    }
    let data = &bytes[data_start..];
    if data.len() % 4 != 0 {
        return None;
    }
    Some(
        data.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn npy_roundtrip() {
        let vector = vec![0.1_f32, -2.5, 3.75, 0.0];
        let bytes = write_npy_f32(&vector);
        assert_eq!(&bytes[0..6], b"\x93NUMPY");
        // Header + magic aligned to 64.
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(read_npy_f32(&bytes).unwrap(), vector);
    }

    #[test]
    fn npy_rejects_garbage() {
        assert!(read_npy_f32(b"not numpy at all").is_none());
        assert!(read_npy_f32(&[]).is_none());
    }

    #[test]
    fn entry_id_is_stable_and_short() {
        let a = entry_id("q", Intent::Commerce, "fp");
        let b = entry_id("q", Intent::Commerce, "fp");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert_ne!(a, entry_id("q", Intent::Informational, "fp"));
    }
}
