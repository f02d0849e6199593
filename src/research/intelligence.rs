//! Phase 1 — intelligence gathering.
//!
//! SERP the query (and auto-generated subtasks), read the top results
//! through the sanitize→read pipeline, then synthesize the per-page
//! summaries into one Intelligence document: discovered specs, candidate
//! retailers, price expectations, community insights, hard requirements,
//! and deal breakers.

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::browser::fetcher::{FetchOutcome, PageFetcher};
use crate::content::page_reader::PageReader;
use crate::content::sanitize::{sanitize_html, DEFAULT_TOKEN_BUDGET};
use crate::core::events::{emit, EventSink};
use crate::core::types::{Intelligence, SourceReport};
use crate::llm::{extract_json_object, LlmInvoker, LlmRole};
use crate::nlp::Reranker;
use crate::search::SearchProvider;

#[derive(Debug, Clone, Default)]
pub struct Phase1Result {
    pub intelligence: Intelligence,
    pub sources: Vec<SourceReport>,
    pub sources_visited: usize,
    /// Set when all engines were blocked and nothing could be gathered.
    pub all_blocked: bool,
}

pub struct IntelligenceGatherer {
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<PageFetcher>,
    reader: Arc<PageReader>,
    llm: Arc<dyn LlmInvoker>,
    events: Option<Arc<dyn EventSink>>,
}

impl IntelligenceGatherer {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<PageFetcher>,
        reader: Arc<PageReader>,
        llm: Arc<dyn LlmInvoker>,
        events: Option<Arc<dyn EventSink>>,
    ) -> Self {
        Self {
            search,
            fetcher,
            reader,
            llm,
            events,
        }
    }

    /// Run Phase 1. `subtasks` may be caller-provided; otherwise they are
    /// generated from the query (LLM with a rule fallback).
    pub async fn gather(
        &self,
        query: &str,
        goal: &str,
        max_sources: usize,
        session_id: &str,
        subtasks: Option<Vec<String>>,
        cancel: &CancellationToken,
    ) -> Phase1Result {
        emit(
            &self.events,
            "phase1_started",
            serde_json::json!({"query": query, "max_sources": max_sources}),
        );

        let subtasks = match subtasks {
            Some(s) if !s.is_empty() => s,
            _ => self.generate_subtasks(query, goal).await,
        };
        info!("[Phase1] {} subtasks for '{}'", subtasks.len(), query);

        let mut sources: Vec<SourceReport> = Vec::new();
        let mut summaries: Vec<String> = Vec::new();
        let mut visited: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut saw_block = false;
        let mut any_serp = false;
        let per_subtask = (max_sources / subtasks.len().max(1)).max(1);

        'subtasks: for subtask in &subtasks {
            if cancel.is_cancelled() || sources.len() >= max_sources {
                break;
            }

            let entries = match self.search.search(subtask).await {
                Ok(entries) => {
                    any_serp = true;
                    entries
                }
                Err(e) => {
                    warn!("[Phase1] search failed for '{}': {}", subtask, e);
                    saw_block = true;
                    continue;
                }
            };

            let reranker = Reranker::new(subtask);
            let top = reranker.rerank_top(entries, per_subtask);

            for entry in top {
                if cancel.is_cancelled() || sources.len() >= max_sources {
                    break 'subtasks;
                }
                // Subtasks overlap heavily on top results; read each URL once.
                if !visited.insert(entry.url.clone()) {
                    continue;
                }

                let outcome = match self.fetcher.fetch(&entry.url, session_id).await {
                    Ok(o) => o,
                    Err(e) => {
                        warn!("[Phase1] fetch failed for {}: {}", entry.url, e);
                        continue;
                    }
                };
                let fetched = match outcome {
                    FetchOutcome::Success(f) => f,
                    FetchOutcome::Blocked { kind, .. } => {
                        warn!("[Phase1] {} blocked ({}) — skipping source", entry.url, kind);
                        continue;
                    }
                };

                let sanitized = sanitize_html(&fetched.html, DEFAULT_TOKEN_BUDGET);
                let reading = self.reader.read(&entry.url, &sanitized, goal, None).await;
                fetched.page.close().await;

                if !reading.is_relevant() {
                    info!(
                        "[Phase1] {} below relevance floor ({:.2})",
                        entry.url, reading.relevance_score
                    );
                    continue;
                }

                let summary = if reading.summary.is_empty() {
                    crate::llm::truncate(&sanitized.full_text(), 500)
                } else {
                    reading.summary.clone()
                };
                summaries.push(format!(
                    "[{} | {}] {}",
                    entry.url,
                    reading.page_type.as_str(),
                    summary
                ));
                sources.push(SourceReport {
                    url: entry.url.clone(),
                    summary,
                    page_type: reading.page_type.as_str().to_string(),
                    reliability: reading.confidence.max(reading.relevance_score),
                });
                emit(
                    &self.events,
                    "phase1_source_read",
                    serde_json::json!({"url": entry.url, "type": reading.page_type.as_str()}),
                );
            }
        }

        let intelligence = if summaries.is_empty() {
            Intelligence::default()
        } else {
            self.synthesize(query, goal, &summaries).await
        };

        emit(
            &self.events,
            "phase1_complete",
            serde_json::json!({"sources": sources.len()}),
        );

        Phase1Result {
            sources_visited: sources.len(),
            all_blocked: saw_block && !any_serp && sources.is_empty(),
            intelligence,
            sources,
        }
    }

    /// Subtask generation: LLM first, rule fallback (base query + a
    /// community-angle variant).
    async fn generate_subtasks(&self, query: &str, goal: &str) -> Vec<String> {
        let prompt = format!(
            "Research goal: \"{goal}\"\nBase query: \"{query}\"\n\n\
             Produce 2-3 focused web-search queries that together cover the \
             goal (facts, community experience, where to buy when relevant).\n\
             Respond with JSON: {{\"queries\": [\"…\"]}}"
        );
        match self.llm.call(&prompt, LlmRole::GoalGenerator, 200, 0.3).await {
            Ok(response) => {
                if let Some(value) = extract_json_object(&response) {
                    let queries: Vec<String> = value
                        .get("queries")
                        .and_then(|v| v.as_array())
                        .map(|arr| {
                            arr.iter()
                                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                                .filter(|s| !s.trim().is_empty())
                                .take(3)
                                .collect()
                        })
                        .unwrap_or_default();
                    if !queries.is_empty() {
                        return queries;
                    }
                }
                self.fallback_subtasks(query)
            }
            Err(e) => {
                warn!("[Phase1] subtask generation failed: {} — using fallback", e);
                self.fallback_subtasks(query)
            }
        }
    }

    fn fallback_subtasks(&self, query: &str) -> Vec<String> {
        vec![
            query.to_string(),
            format!("{} recommendations reviews", query),
        ]
    }

    /// Merge per-page summaries into one Intelligence document.
    async fn synthesize(&self, query: &str, goal: &str, summaries: &[String]) -> Intelligence {
        let prompt = format!(
            "Research goal: \"{goal}\" (query: \"{query}\")\n\n\
             Source summaries:\n{}\n\n\
             Merge these into one intelligence document. Respond with JSON:\n\
             {{\"specs_discovered\": {{\"attr\": {{\"value\": \"…\", \"confidence\": 0.0-1.0, \"source_url\": \"…\"}}}},\n \
             \"retailers\": {{\"domain.com\": {{\"relevance\": 0.0-1.0, \"reasons\": [\"…\"]}}}},\n \
             \"price_range\": {{\"min\": number|null, \"max\": number|null}},\n \
             \"forum_recommendations\": [\"…\"], \"user_insights\": [\"…\"],\n \
             \"hard_requirements\": [\"…\"], \"acceptable_alternatives\": [\"…\"], \"deal_breakers\": [\"…\"]}}",
            summaries.join("\n\n")
        );

        match self.llm.call(&prompt, LlmRole::Synthesizer, 1500, 0.1).await {
            Ok(response) => match extract_json_object(&response)
                .and_then(|v| serde_json::from_value::<Intelligence>(v).ok())
            {
                Some(intelligence) => intelligence,
                None => {
                    warn!("[Phase1] synthesis response unparseable — returning empty intelligence");
                    Intelligence::default()
                }
            },
            Err(e) => {
                warn!("[Phase1] synthesis failed: {}", e);
                Intelligence::default()
            }
        }
    }
}

/// Summarize a single page toward a goal; used by deep-mode refinement when
/// it revisits sources.
pub async fn summarize_page(
    llm: &dyn LlmInvoker,
    url: &str,
    text: &str,
    goal: &str,
) -> Result<String> {
    let prompt = format!(
        "Goal: \"{goal}\"\nURL: {url}\n\nContent:\n{}\n\nSummarize what this page \
         contributes to the goal in 2-3 sentences.",
        crate::llm::truncate(text, 6_000)
    );
    llm.call(&prompt, LlmRole::PageSummarizer, 200, 0.1).await
}
