//! Explicit construction of the research core.
//!
//! Every process-wide service (rate limiter, engine health, registries,
//! caches, index) is built once here and shared via `Arc` — no module-level
//! globals, no implicit initialization. Collaborator capabilities (LLM,
//! browser, search, intervention, events) default to production
//! implementations and can each be swapped at build time, which is also the
//! seam the integration tests use.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::browser::cdp::CdpBrowser;
use crate::browser::fetcher::{FetcherPolicy, PageFetcher};
use crate::browser::intervention::{InterventionSink, ManualInterventionSink};
use crate::browser::session_store::SessionStore;
use crate::browser::BrowserCapability;
use crate::content::page_reader::PageReader;
use crate::core::config::CoreConfig;
use crate::core::error::ResearchError;
use crate::core::events::EventSink;
use crate::core::types::{ResearchRequest, ResearchResult};
use crate::llm::{LlmInvoker, OpenAiInvoker};
use crate::memory::{EmbeddingService, KnowledgeRetriever, ResearchIndex, ResponseCache};
use crate::navigator::GoalDirectedNavigator;
use crate::registry::{SchemaRegistry, SiteKnowledgeCache, VendorRegistry};
use crate::research::{
    IntelligenceGatherer, RequirementsReasoner, ResearchOrchestrator, VendorSearch,
};
use crate::search::engine_health::EngineHealthTracker;
use crate::search::rate_limiter::SearchRateLimiter;
use crate::search::{HumanSearch, SearchProvider};

pub struct CoreBuilder {
    config: CoreConfig,
    llm: Option<Arc<dyn LlmInvoker>>,
    browser: Option<Arc<dyn BrowserCapability>>,
    search: Option<Arc<dyn SearchProvider>>,
    intervention: Option<Arc<dyn InterventionSink>>,
    events: Option<Arc<dyn EventSink>>,
    embeddings: Option<Arc<EmbeddingService>>,
}

impl CoreBuilder {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            llm: None,
            browser: None,
            search: None,
            intervention: None,
            events: None,
            embeddings: None,
        }
    }

    pub fn with_embeddings(mut self, embeddings: Arc<EmbeddingService>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmInvoker>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_browser(mut self, browser: Arc<dyn BrowserCapability>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn with_search(mut self, search: Arc<dyn SearchProvider>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_intervention(mut self, sink: Arc<dyn InterventionSink>) -> Self {
        self.intervention = Some(sink);
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn build(self) -> Result<ResearchCore> {
        let config = self.config;
        let state_dir = config.resolve_state_dir();
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("creating state dir {}", state_dir.display()))?;
        info!("[Core] state dir: {}", state_dir.display());

        // Capabilities (injectable).
        let llm: Arc<dyn LlmInvoker> = self
            .llm
            .unwrap_or_else(|| Arc::new(OpenAiInvoker::new(&config.llm)));
        let browser: Arc<dyn BrowserCapability> =
            self.browser.unwrap_or_else(|| Arc::new(CdpBrowser::new()));
        let intervention: Arc<dyn InterventionSink> = self
            .intervention
            .unwrap_or_else(|| Arc::new(ManualInterventionSink::new()));
        let events = self.events;

        // Shared mutable services, one instance each.
        let limiter = Arc::new(SearchRateLimiter::new(
            config.search.resolve_min_delay(),
            config.search.resolve_backoff_on_block(),
            config.search.resolve_max_backoff(),
        ));
        let tracker = Arc::new(EngineHealthTracker::new(
            config.search.resolve_base_cooldown(),
            config.search.resolve_max_cooldown(),
        ));
        let search: Arc<dyn SearchProvider> = match self.search {
            Some(s) => s,
            None => Arc::new(HumanSearch::new(
                reqwest::Client::new(),
                limiter.clone(),
                tracker.clone(),
                config.search.resolve_engines(),
                config.search.resolve_max_results(),
                Some(browser.clone()),
            )),
        };

        let sessions = Arc::new(SessionStore::new(state_dir.join("sessions")));
        let fetcher = Arc::new(PageFetcher::new(
            browser.clone(),
            sessions,
            Some(intervention.clone()),
            events.clone(),
            FetcherPolicy {
                fetch_timeout: config.research.resolve_fetch_timeout(),
                intervention_timeout: config.research.resolve_intervention_timeout(),
                blocker_confidence_threshold: config.research.resolve_blocker_confidence(),
                human_assist: config.research.resolve_human_assist(),
                settle: config.research.resolve_fetch_settle(),
            },
        ));

        let schemas = Arc::new(SchemaRegistry::open(&state_dir));
        let vendors = Arc::new(VendorRegistry::open(&state_dir));
        let site_notes = Arc::new(SiteKnowledgeCache::open(&state_dir));

        let embeddings = self
            .embeddings
            .unwrap_or_else(|| Arc::new(EmbeddingService::new()));
        let response_cache = Arc::new(ResponseCache::open(
            &state_dir,
            embeddings,
            config.cache.resolve_enabled(),
            config.cache.resolve_similarity_threshold(),
            config.cache.resolve_ttl_hours(),
        ));
        let index = Arc::new(ResearchIndex::open(&state_dir)?);
        let knowledge = Arc::new(KnowledgeRetriever::new(
            index.clone(),
            config.cache.resolve_completeness_threshold(),
            config.cache.resolve_confidence_threshold(),
        ));

        let reader = Arc::new(PageReader::new(llm.clone()));
        let navigator = Arc::new(GoalDirectedNavigator::new(
            llm.clone(),
            config.research.resolve_navigator_max_steps(),
        ));
        let gatherer = Arc::new(IntelligenceGatherer::new(
            search.clone(),
            fetcher.clone(),
            reader,
            llm.clone(),
            events.clone(),
        ));
        let vendor_search = Arc::new(VendorSearch::new(
            search,
            fetcher,
            navigator,
            vendors.clone(),
            schemas.clone(),
            site_notes.clone(),
            llm.clone(),
            events.clone(),
            config.research.resolve_vendor_timeout(),
            config.research.resolve_vendor_concurrency(),
        ));
        let reasoner = Arc::new(RequirementsReasoner::new(llm.clone()));

        let orchestrator = Arc::new(ResearchOrchestrator::new(
            llm,
            gatherer,
            vendor_search,
            reasoner,
            knowledge,
            index.clone(),
            response_cache.clone(),
            vendors.clone(),
            events,
            config.research.resolve_max_passes(),
        ));

        Ok(ResearchCore {
            orchestrator,
            schemas,
            vendors,
            site_notes,
            index,
            response_cache,
            limiter,
            tracker,
            intervention,
        })
    }
}

/// Process-wide research core. Cheap to clone references out of; all inner
/// services are `Arc`-shared and internally synchronized.
pub struct ResearchCore {
    orchestrator: Arc<ResearchOrchestrator>,
    pub schemas: Arc<SchemaRegistry>,
    pub vendors: Arc<VendorRegistry>,
    pub site_notes: Arc<SiteKnowledgeCache>,
    pub index: Arc<ResearchIndex>,
    pub response_cache: Arc<ResponseCache>,
    pub limiter: Arc<SearchRateLimiter>,
    pub tracker: Arc<EngineHealthTracker>,
    pub intervention: Arc<dyn InterventionSink>,
}

impl ResearchCore {
    pub fn builder(config: CoreConfig) -> CoreBuilder {
        CoreBuilder::new(config)
    }

    /// The single public research operation.
    pub async fn research(
        &self,
        request: &ResearchRequest,
    ) -> Result<ResearchResult, ResearchError> {
        self.research_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Research with an external cancellation token; cancellation is honored
    /// at every suspension point and partial findings are returned.
    pub async fn research_with_cancel(
        &self,
        request: &ResearchRequest,
        cancel: &CancellationToken,
    ) -> Result<ResearchResult, ResearchError> {
        self.orchestrator.research(request, cancel).await
    }
}
