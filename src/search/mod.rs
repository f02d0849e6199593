//! Multi-engine human-style search with failover.
//!
//! One query fans over the configured engines in health order. Each attempt:
//! warmup (engine home + short idle + small scroll, when a browser is
//! available), global rate-limiter token, SERP fetch, block detection. A
//! block reports to *both* the global limiter and the per-engine tracker and
//! fails over to the next engine; the same engine is never retried within a
//! single call.

pub mod engine_health;
pub mod engines;
pub mod rate_limiter;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::browser::BrowserCapability;
use crate::core::error::{BlockKind, ResearchError};
use crate::core::types::SerpEntry;
use self::engine_health::EngineHealthTracker;
use self::rate_limiter::SearchRateLimiter;

/// Search capability consumed by Phase 1 and Phase 2. Mockable seam.
#[async_trait::async_trait]
pub trait SearchProvider: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SerpEntry>, ResearchError>;
}

pub struct HumanSearch {
    client: reqwest::Client,
    limiter: Arc<SearchRateLimiter>,
    tracker: Arc<EngineHealthTracker>,
    engines: Vec<String>,
    max_results: usize,
    /// Used for warmup only; SERP fetches go through stealth HTTP.
    browser: Option<Arc<dyn BrowserCapability>>,
    serp_cache: moka::future::Cache<String, Vec<SerpEntry>>,
}

impl HumanSearch {
    pub fn new(
        client: reqwest::Client,
        limiter: Arc<SearchRateLimiter>,
        tracker: Arc<EngineHealthTracker>,
        engines: Vec<String>,
        max_results: usize,
        browser: Option<Arc<dyn BrowserCapability>>,
    ) -> Self {
        Self {
            client,
            limiter,
            tracker,
            engines,
            max_results,
            browser,
            serp_cache: moka::future::Cache::builder()
                .max_capacity(2_000)
                .time_to_live(Duration::from_secs(60 * 10))
                .build(),
        }
    }

    /// Warmup: visit the engine home like a person would before typing a
    /// query. Best effort; failures never abort the search attempt.
    async fn warmup(&self, engine: &str) {
        let Some(browser) = &self.browser else {
            return;
        };
        let home = match engine {
            "google" => engines::google::HOME_URL,
            "bing" => engines::bing::HOME_URL,
            "duckduckgo" | "ddg" => engines::duckduckgo::HOME_URL,
            "brave" => engines::brave::HOME_URL,
            _ => return,
        };

        let opts = crate::browser::PageOptions::ephemeral();
        let page = match browser.new_page(&opts).await {
            Ok(p) => p,
            Err(e) => {
                debug!("[Search] warmup page unavailable: {}", e);
                return;
            }
        };

        let result: anyhow::Result<()> = async {
            page.goto(home).await?;
            let idle_ms = {
                use rand::prelude::*;
                rand::rng().random_range(800..=2200)
            };
            tokio::time::sleep(Duration::from_millis(idle_ms)).await;
            let (down, up) = {
                use rand::prelude::*;
                let mut rng = rand::rng();
                (rng.random_range(150..=500), rng.random_range(40..=120))
            };
            page.evaluate(&format!(
                "window.scrollBy({{top: {}, behavior: 'smooth'}});",
                down
            ))
            .await?;
            tokio::time::sleep(Duration::from_millis(300)).await;
            page.evaluate(&format!(
                "window.scrollBy({{top: -{}, behavior: 'smooth'}});",
                up
            ))
            .await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            debug!("[Search] warmup on {} failed (non-fatal): {}", engine, e);
        }
        page.close().await;
    }

    async fn run_engine(
        &self,
        engine: &str,
        query: &str,
    ) -> Result<Vec<SerpEntry>, engines::EngineError> {
        match engine {
            "duckduckgo" | "ddg" => {
                engines::duckduckgo::search(&self.client, query, self.max_results).await
            }
            "bing" => engines::bing::search(&self.client, query, self.max_results).await,
            "google" => engines::google::search(&self.client, query, self.max_results).await,
            "brave" => engines::brave::search(&self.client, query, self.max_results).await,
            other => {
                debug!("[Search] unknown search engine requested: {}", other);
                Ok(Vec::new())
            }
        }
    }
}

#[async_trait::async_trait]
impl SearchProvider for HumanSearch {
    async fn search(&self, query: &str) -> Result<Vec<SerpEntry>, ResearchError> {
        if let Some(cached) = self.serp_cache.get(query).await {
            debug!("[Search] SERP cache hit for '{}'", crate::llm::truncate(query, 40));
            return Ok(cached);
        }

        let healthy = self.tracker.get_healthy_engines(&self.engines);
        if healthy.is_empty() {
            // No outbound navigation at all: surface blocked immediately.
            return Err(ResearchError::blocked("all engines", BlockKind::BotDetection));
        }

        let mut saw_block = false;
        for engine in &healthy {
            self.warmup(engine).await;
            self.limiter.acquire(query, engine).await;

            match self.run_engine(engine, query).await {
                Ok(results) => {
                    self.limiter.report_success().await;
                    self.tracker.report_success(engine);
                    let deduped = dedup_results(results);
                    info!(
                        "[Search] {} returned {} results for '{}'",
                        engine,
                        deduped.len(),
                        crate::llm::truncate(query, 40)
                    );
                    self.serp_cache.insert(query.to_string(), deduped.clone()).await;
                    return Ok(deduped);
                }
                Err(engines::EngineError::Blocked { reason }) => {
                    saw_block = true;
                    warn!("[Search] engine '{}' blocked: {} — failing over", engine, reason);
                    self.limiter.report_rate_limit(engine).await;
                    self.tracker.report_failure(engine, &reason);
                }
                Err(e) => {
                    warn!("[Search] engine '{}' failed: {}", engine, e);
                    self.tracker.report_failure(engine, "error");
                }
            }
        }

        if saw_block {
            Err(ResearchError::blocked("all engines", BlockKind::BotDetection))
        } else {
            // Transient failures everywhere: an empty SERP is a valid outcome.
            Ok(Vec::new())
        }
    }
}

/// Deduplicate SERP entries by normalized URL, preserving first-seen order.
pub fn dedup_results(results: Vec<SerpEntry>) -> Vec<SerpEntry> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(results.len());
    for r in results {
        if r.url.is_empty() {
            continue;
        }
        if seen.insert(normalize_url_key(&r.url)) {
            out.push(r);
        }
    }
    out
}

/// Key used for SERP dedup: scheme/host lowercased, fragment dropped,
/// trailing slash trimmed.
fn normalize_url_key(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut u) => {
            u.set_fragment(None);
            let mut s = u.to_string();
            while s.ends_with('/') {
                s.pop();
            }
            s.to_lowercase()
        }
        Err(_) => raw.trim_end_matches('/').to_lowercase(),
    }
}
