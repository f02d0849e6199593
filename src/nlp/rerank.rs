//! Lexical SERP reranking.
//!
//! Cheap TF-style scoring that orders SERP entries by query-term overlap
//! before the expensive fetch/read pipeline spends time on them.

use crate::core::types::SerpEntry;
use std::cmp::Ordering;
use tracing::debug;

pub struct Reranker {
    query_tokens: Vec<String>,
}

impl Reranker {
    pub fn new(query: &str) -> Self {
        Self {
            query_tokens: Self::tokenize(query),
        }
    }

    fn tokenize(text: &str) -> Vec<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|s| !s.is_empty() && s.len() > 2) // skip stop-ish short words
            .map(|s| s.to_string())
            .collect()
    }

    /// Relevance in [0, 1]: title matches weigh double snippet matches,
    /// blended with the raw match ratio.
    pub fn score(&self, entry: &SerpEntry) -> f32 {
        if self.query_tokens.is_empty() {
            return 0.5;
        }

        let title_tokens = Self::tokenize(&entry.title);
        let snippet_tokens = Self::tokenize(&entry.snippet);

        let mut score = 0.0;
        let mut matches = 0;
        for token in &self.query_tokens {
            if title_tokens.contains(token) {
                score += 0.4;
                matches += 1;
            } else if snippet_tokens.contains(token) {
                score += 0.2;
                matches += 1;
            }
        }

        let max_score = self.query_tokens.len() as f32 * 0.4;
        let normalized = if max_score > 0.0 {
            (score / max_score).min(1.0)
        } else {
            0.5
        };
        let match_ratio = matches as f32 / self.query_tokens.len() as f32;
        ((normalized + match_ratio) / 2.0).clamp(0.0, 1.0)
    }

    pub fn rerank(&self, entries: Vec<SerpEntry>, threshold: Option<f32>) -> Vec<SerpEntry> {
        let mut scored: Vec<(SerpEntry, f32)> = entries
            .into_iter()
            .map(|e| {
                let s = self.score(&e);
                (e, s)
            })
            .collect();

        if let Some(min) = threshold {
            scored.retain(|(_, s)| *s >= min);
        }

        scored.sort_by(|(_, a), (_, b)| b.partial_cmp(a).unwrap_or(Ordering::Equal));
        debug!("[Rerank] {} entries after rerank (threshold: {:?})", scored.len(), threshold);
        scored.into_iter().map(|(e, _)| e).collect()
    }

    pub fn rerank_top(&self, entries: Vec<SerpEntry>, top_n: usize) -> Vec<SerpEntry> {
        let mut reranked = self.rerank(entries, None);
        reranked.truncate(top_n);
        reranked
    }
}
