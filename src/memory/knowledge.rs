//! Knowledge retrieval over the research index.
//!
//! Before a research run spends browser time, the retriever checks whether
//! earlier runs already covered the topic well enough to skip Phase 1.
//! Strict one-way dependency: the orchestrator calls the retriever, the
//! retriever reads the index, and only the orchestrator ever writes back.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::research_index::ResearchIndex;
use crate::core::types::{Intent, PriceRange};

/// Reusable knowledge assembled for the current query.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeContext {
    pub total_claims: usize,
    /// domain → how many prior entries mention it
    pub known_retailers: HashMap<String, usize>,
    pub price_expectations: PriceRange,
    /// [0, 1] — how completely prior research covers this topic.
    pub completeness: f64,
    /// Decayed confidence of the best matching entry.
    pub confidence: f64,
    pub phase1_skip_recommended: bool,
    /// Doc paths of the entries that informed this context.
    pub supporting_docs: Vec<String>,
}

pub struct KnowledgeRetriever {
    index: Arc<ResearchIndex>,
    completeness_threshold: f64,
    confidence_threshold: f64,
}

impl KnowledgeRetriever {
    pub fn new(
        index: Arc<ResearchIndex>,
        completeness_threshold: f64,
        confidence_threshold: f64,
    ) -> Self {
        Self {
            index,
            completeness_threshold,
            confidence_threshold,
        }
    }

    /// Assemble reusable knowledge for (topic, intent, session). Topic is a
    /// dotted path; keyword fallback widens the net when the topic path has
    /// no hits.
    pub fn retrieve(
        &self,
        topic: &str,
        keywords: &[String],
        intent: Intent,
        session_id: &str,
    ) -> KnowledgeContext {
        let mut matches = self
            .index
            .search_by_topic(topic, Some(intent), Some(session_id), 10)
            .unwrap_or_default();

        if matches.is_empty() && !keywords.is_empty() {
            matches = self
                .index
                .search_by_keywords(keywords, Some(session_id), 10)
                .unwrap_or_default();
        }

        if matches.is_empty() {
            return KnowledgeContext::default();
        }

        let now = chrono::Utc::now();
        let best_confidence = matches
            .iter()
            .map(|m| m.entry.current_confidence(now))
            .fold(0.0_f64, f64::max);

        // Completeness: coverage breadth (entry count, saturating) weighted
        // by the quality of what's there.
        let avg_quality =
            matches.iter().map(|m| m.entry.quality).sum::<f64>() / matches.len() as f64;
        let breadth = (matches.len() as f64 / 5.0).min(1.0);
        let completeness = breadth * avg_quality;

        let phase1_skip_recommended = completeness >= self.completeness_threshold
            && best_confidence >= self.confidence_threshold;

        let context = KnowledgeContext {
            total_claims: matches.len(),
            known_retailers: HashMap::new(),
            price_expectations: PriceRange::default(),
            completeness,
            confidence: best_confidence,
            phase1_skip_recommended,
            supporting_docs: matches.iter().map(|m| m.entry.doc_path.clone()).collect(),
        };

        info!(
            "[Knowledge] topic={} claims={} completeness={:.2} confidence={:.2} skip_phase1={}",
            topic,
            context.total_claims,
            context.completeness,
            context.confidence,
            context.phase1_skip_recommended
        );
        context
    }
}

/// Derive a coarse dotted topic path plus keywords from a raw query. This is
/// deliberately rule-based; the orchestrator refines topics via LLM when it
/// indexes results.
pub fn topic_from_query(query: &str) -> (String, Vec<String>) {
    let keywords: Vec<String> = query
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 3)
        .take(6)
        .map(|w| w.to_string())
        .collect();
    let topic = if keywords.is_empty() {
        "general".to_string()
    } else {
        keywords
            .iter()
            .take(3)
            .cloned()
            .collect::<Vec<_>>()
            .join(".")
    };
    (topic, keywords)
}
