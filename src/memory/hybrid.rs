//! Hybrid semantic + lexical retrieval.
//!
//! Pure embedding search drifts ("Syrian hamster breeders" matching "Syrian
//! Civil War"); pure keyword search misses paraphrases. Requiring BOTH a
//! semantic floor AND a keyword floor, then blending, keeps precision and
//! recall at once.

use tracing::{debug, info};

use super::embedding::cosine_similarity;
use crate::nlp::Bm25;

/// Default blend: 70% semantic, 30% keyword.
pub const DEFAULT_EMBEDDING_WEIGHT: f64 = 0.7;
pub const DEFAULT_MIN_EMBEDDING_SCORE: f64 = 0.5;
pub const DEFAULT_MIN_KEYWORD_SCORE: f64 = 0.1;

/// One retrieval candidate: the cached query text, its stored embedding,
/// and an opaque payload index the caller maps back to its entry.
pub struct HybridCandidate {
    pub text: String,
    pub embedding: Vec<f32>,
    pub domain: Option<String>,
    /// Caller-side index of the backing entry.
    pub payload: usize,
}

#[derive(Debug, Clone)]
pub struct HybridMatch {
    pub payload: usize,
    pub hybrid_score: f64,
    pub semantic_score: f64,
    pub keyword_score: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct HybridParams {
    pub top_k: usize,
    pub embedding_weight: f64,
    pub min_embedding_score: f64,
    pub min_keyword_score: f64,
}

impl Default for HybridParams {
    fn default() -> Self {
        Self {
            top_k: 5,
            embedding_weight: DEFAULT_EMBEDDING_WEIGHT,
            min_embedding_score: DEFAULT_MIN_EMBEDDING_SCORE,
            min_keyword_score: DEFAULT_MIN_KEYWORD_SCORE,
        }
    }
}

/// Rank candidates against a query embedding + query text.
///
/// Pipeline: optional domain filter → semantic threshold → BM25 with
/// degenerate-corpus normalization → adaptive keyword threshold (lenient
/// when ≤2 candidates survive the semantic pass) → weighted blend → top-k.
pub fn hybrid_search(
    query: &str,
    query_embedding: &[f32],
    candidates: &[HybridCandidate],
    domain_filter: Option<&str>,
    params: HybridParams,
) -> Vec<HybridMatch> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let filtered: Vec<&HybridCandidate> = match domain_filter {
        Some(domain) => {
            let kept: Vec<&HybridCandidate> = candidates
                .iter()
                .filter(|c| c.domain.as_deref() == Some(domain))
                .collect();
            info!(
                "[Hybrid] Domain filter={}, candidates: {} → {}",
                domain,
                candidates.len(),
                kept.len()
            );
            kept
        }
        None => candidates.iter().collect(),
    };
    if filtered.is_empty() {
        return Vec::new();
    }

    // Semantic pass.
    let semantic: Vec<(&HybridCandidate, f64)> = filtered
        .iter()
        .filter_map(|c| {
            let sim = cosine_similarity(query_embedding, &c.embedding) as f64;
            if sim >= params.min_embedding_score {
                Some((*c, sim))
            } else {
                None
            }
        })
        .collect();

    info!(
        "[Hybrid] Semantic pass: {}/{} above threshold ({})",
        semantic.len(),
        filtered.len(),
        params.min_embedding_score
    );
    if semantic.is_empty() {
        return Vec::new();
    }

    // Keyword pass over the semantic survivors.
    let corpus: Vec<String> = semantic.iter().map(|(c, _)| c.text.clone()).collect();
    let keyword_scores = Bm25::new(&corpus).normalized_scores(query);

    // Adaptive threshold: with very few candidates BM25's IDF is unreliable.
    let effective_min_keyword = if semantic.len() <= 2 {
        params.min_keyword_score.min(0.05)
    } else {
        params.min_keyword_score
    };

    let mut matches: Vec<HybridMatch> = semantic
        .iter()
        .zip(keyword_scores.iter())
        .filter_map(|((candidate, semantic_score), &keyword_score)| {
            if keyword_score < effective_min_keyword {
                debug!(
                    "[Hybrid] Filtered out: '{}' (keyword={:.2} < {:.2})",
                    crate::llm::truncate(&candidate.text, 50),
                    keyword_score,
                    effective_min_keyword
                );
                return None;
            }
            let hybrid_score = params.embedding_weight * semantic_score
                + (1.0 - params.embedding_weight) * keyword_score;
            Some(HybridMatch {
                payload: candidate.payload,
                hybrid_score,
                semantic_score: *semantic_score,
                keyword_score,
            })
        })
        .collect();

    matches.sort_by(|a, b| {
        b.hybrid_score
            .partial_cmp(&a.hybrid_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    if let Some(top) = matches.first() {
        info!(
            "[Hybrid] Final: {} results, top score: {:.3} (semantic={:.3}, keyword={:.3})",
            matches.len(),
            top.hybrid_score,
            top.semantic_score,
            top.keyword_score
        );
    } else {
        info!("[Hybrid] No results after keyword filtering");
    }

    matches.truncate(params.top_k);
    matches
}

/// Keyword-only fallback for when the embedding model is unavailable.
pub fn keyword_only_search(
    query: &str,
    candidates: &[HybridCandidate],
    top_k: usize,
) -> Vec<HybridMatch> {
    info!("[Hybrid] Using keyword-only fallback (no embeddings)");
    if candidates.is_empty() {
        return Vec::new();
    }

    let corpus: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
    let scores = Bm25::new(&corpus).normalized_scores(query);

    let mut matches: Vec<HybridMatch> = candidates
        .iter()
        .zip(scores.iter())
        .filter(|(_, &s)| s > 0.0)
        .map(|(c, &s)| HybridMatch {
            payload: c.payload,
            hybrid_score: s,
            semantic_score: 0.0,
            keyword_score: s,
        })
        .collect();
    matches.sort_by(|a, b| {
        b.hybrid_score
            .partial_cmp(&a.hybrid_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    matches.truncate(top_k);
    matches
}
