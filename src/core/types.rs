use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ───────────────────────────────────────────────────────────────────────────
// Query & intent
// ───────────────────────────────────────────────────────────────────────────

/// Classified purpose of a query. Intent is the single source of truth for
/// phase routing: non-commerce intents never trigger vendor extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Navigation,
    SiteSearch,
    Commerce,
    Informational,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intent::Navigation => "navigation",
            Intent::SiteSearch => "site_search",
            Intent::Commerce => "commerce",
            Intent::Informational => "informational",
        }
    }

    pub fn parse(s: &str) -> Intent {
        match s.trim().to_ascii_lowercase().as_str() {
            "navigation" => Intent::Navigation,
            "site_search" | "site-search" => Intent::SiteSearch,
            "commerce" | "transactional" | "purchase" => Intent::Commerce,
            _ => Intent::Informational,
        }
    }

    pub fn is_commerce(&self) -> bool {
        matches!(self, Intent::Commerce)
    }
}

/// Research execution mode. `Standard` runs the selected phases once; `Deep`
/// iterates passes until the satisfaction evaluator says COMPLETE or the
/// safety cap is hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResearchMode {
    Standard,
    Deep,
}

impl Default for ResearchMode {
    fn default() -> Self {
        ResearchMode::Standard
    }
}

/// A single research invocation as received from the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchRequest {
    pub query: String,
    /// Natural-language research goal ("find Syrian hamster breeders under $40").
    /// Defaults to the query when empty.
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub mode: ResearchMode,
    pub session_id: String,
    pub intent: Intent,
    /// Free-form user constraint map (budget, location, exclusions…).
    #[serde(default)]
    pub constraints: HashMap<String, String>,
    /// Soft cap on sources visited across the run. 0 = use strategy defaults.
    #[serde(default)]
    pub budget: usize,
    /// Skip the response cache and re-run research from scratch.
    #[serde(default)]
    pub force_refresh: bool,
    #[serde(default)]
    pub turn_number: u32,
}

impl ResearchRequest {
    pub fn new(query: impl Into<String>, session_id: impl Into<String>, intent: Intent) -> Self {
        Self {
            query: query.into(),
            goal: String::new(),
            mode: ResearchMode::Standard,
            session_id: session_id.into(),
            intent,
            constraints: HashMap::new(),
            budget: 0,
            force_refresh: false,
            turn_number: 0,
        }
    }

    /// Effective goal: explicit goal or the raw query.
    pub fn effective_goal(&self) -> &str {
        if self.goal.trim().is_empty() {
            &self.query
        } else {
            &self.goal
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// SERP
// ───────────────────────────────────────────────────────────────────────────

/// One parsed search-engine result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SerpEntry {
    pub url: String,
    pub title: String,
    pub snippet: String,
    #[serde(default)]
    pub engine: Option<String>,
}

// ───────────────────────────────────────────────────────────────────────────
// Intelligence (Phase 1 output)
// ───────────────────────────────────────────────────────────────────────────

/// One discovered spec attribute with provenance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecFinding {
    pub value: String,
    pub confidence: f64,
    #[serde(default)]
    pub source_url: String,
}

/// A retailer surfaced during intelligence gathering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetailerHint {
    pub relevance: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

/// Synthesized intelligence document produced by Phase 1.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Intelligence {
    #[serde(default)]
    pub specs_discovered: HashMap<String, SpecFinding>,
    /// domain → hint
    #[serde(default)]
    pub retailers: HashMap<String, RetailerHint>,
    #[serde(default)]
    pub price_range: PriceRange,
    #[serde(default)]
    pub forum_recommendations: Vec<String>,
    #[serde(default)]
    pub user_insights: Vec<String>,
    #[serde(default)]
    pub hard_requirements: Vec<String>,
    #[serde(default)]
    pub acceptable_alternatives: Vec<String>,
    #[serde(default)]
    pub deal_breakers: Vec<String>,
}

impl Intelligence {
    pub fn is_empty(&self) -> bool {
        self.specs_discovered.is_empty()
            && self.retailers.is_empty()
            && self.forum_recommendations.is_empty()
            && self.hard_requirements.is_empty()
    }
}

/// A source page consumed during Phase 1 with its reading outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceReport {
    pub url: String,
    pub summary: String,
    pub page_type: String,
    pub reliability: f64,
}

// ───────────────────────────────────────────────────────────────────────────
// Findings & results
// ───────────────────────────────────────────────────────────────────────────

/// One validated product/offer finding emitted by Phase 2. Never mutated
/// after emission; `vendor` is always the host of `url`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Finding {
    pub name: String,
    #[serde(default)]
    pub price: Option<f64>,
    pub vendor: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
    pub confidence: f64,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
}

/// Aggregate counters for one research invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResearchStats {
    pub sources_visited: usize,
    pub vendors_visited: usize,
    pub vendors_blocked: usize,
    pub passes_executed: usize,
    pub findings_rejected: usize,
    pub cache_hit: bool,
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// Which phases a strategy executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhasePlan {
    Phase1Only,
    Phase2Only,
    Phase1AndPhase2,
}

impl PhasePlan {
    pub fn runs_phase1(&self) -> bool {
        !matches!(self, PhasePlan::Phase2Only)
    }

    pub fn runs_phase2(&self) -> bool {
        !matches!(self, PhasePlan::Phase1Only)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PhasePlan::Phase1Only => "phase1_only",
            PhasePlan::Phase2Only => "phase2_only",
            PhasePlan::Phase1AndPhase2 => "phase1_and_phase2",
        }
    }
}

/// Final output of `ResearchCore::research`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchResult {
    pub query: String,
    pub intent: Intent,
    pub mode: ResearchMode,
    pub strategy_used: PhasePlan,
    pub passes: usize,
    pub findings: Vec<Finding>,
    /// Findings that failed deterministic post-filters, kept for downstream
    /// context (relaxation, explanations).
    #[serde(default)]
    pub rejected_findings: Vec<Finding>,
    #[serde(default)]
    pub intelligence: Option<Intelligence>,
    #[serde(default)]
    pub sources: Vec<SourceReport>,
    pub stats: ResearchStats,
    pub intelligence_cached: bool,
    /// Top blocker/quarantine reasons when the run came back empty.
    #[serde(default)]
    pub failure_reasons: Vec<String>,
}

// ───────────────────────────────────────────────────────────────────────────
// Helpers
// ───────────────────────────────────────────────────────────────────────────

/// Host of a URL, normalized (lowercase, `www.` stripped). Falls back to the
/// raw input when the URL does not parse.
pub fn normalize_host(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(u) => u
            .host_str()
            .map(normalize_domain)
            .unwrap_or_else(|| url.to_string()),
        Err(_) => normalize_domain(url),
    }
}

/// Lowercase a domain and strip a leading `www.`.
pub fn normalize_domain(domain: &str) -> String {
    let d = domain.trim().to_ascii_lowercase();
    d.strip_prefix("www.").unwrap_or(&d).to_string()
}
