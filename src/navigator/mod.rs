//! Goal-directed page navigation.
//!
//! Instead of classifying sites up front, the navigator reasons about each
//! page: PERCEIVE structured signals, DECIDE via LLM (extract / navigate /
//! give up / retry), GUARD against filter-losing navigation, ACT, then
//! VALIDATE that what was extracted actually matches the goal. A failed
//! validation feeds its reason back into the next decision instead of
//! returning junk.
//!
//! Example recovery flow: land on a pet-supply homepage looking for
//! hamsters, extract, get water bottles, validation rejects, the retry
//! decision finds the "Hamsters" nav link, extract again from the right
//! page.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

use crate::browser::PageHandle;
use crate::core::types::PriceRange;
use crate::llm::{extract_json_object, LlmInvoker, LlmRole};
use crate::research::requirements::ProductRequirements;

/// Minimum fraction of extracted products that must match requirements for
/// a requirements-based validation to pass.
pub const MATCH_RATIO_FLOOR: f64 = 0.3;

/// Target words that suggest a navigation would wipe applied filters.
const RISKY_TARGETS: &[&str] = &[
    "filter", "sort", "refine", "all ", "clear", "reset", "category", "browse",
];

// ───────────────────────────────────────────────────────────────────────────
// Types
// ───────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavigationAction {
    Extract,
    Navigate,
    GiveUp,
    Retry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NavContentType {
    ProductListing,
    ProductDetail,
    ContactVendor,
    Marketplace,
    Informational,
}

/// A product candidate produced by an extraction callback. `url` is the
/// page/product URL as seen by the browser, never an LLM claim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedProduct {
    pub title: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub specs: HashMap<String, String>,
    #[serde(default)]
    pub description: String,
}

/// Structured understanding of a page, captured without any LLM call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PagePerception {
    pub url: String,
    pub title: String,
    pub main_heading: String,
    pub nav_links: Vec<NavLink>,
    pub content_headings: Vec<String>,
    pub price_count: usize,
    pub has_cart: bool,
    pub has_product_grid: bool,
    pub has_contact_form: bool,
    pub body_preview: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NavLink {
    pub text: String,
    pub href: String,
}

/// The LLM's decision about what to do on the current page.
#[derive(Debug, Clone)]
pub struct NavigationDecision {
    pub action: NavigationAction,
    pub reason: String,
    pub target: Option<String>,
    pub alternative: Option<String>,
    pub content_type: Option<NavContentType>,
    pub extraction_hints: serde_json::Value,
}

impl NavigationDecision {
    pub fn give_up(reason: impl Into<String>) -> Self {
        Self {
            action: NavigationAction::GiveUp,
            reason: reason.into(),
            target: None,
            alternative: None,
            content_type: None,
            extraction_hints: serde_json::json!({}),
        }
    }

    /// Parse an LLM response object. "click" aliases navigate; anything
    /// unrecognized becomes give_up.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let action = match value
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or("give_up")
            .to_ascii_lowercase()
            .as_str()
        {
            "extract" => NavigationAction::Extract,
            "navigate" | "click" => NavigationAction::Navigate,
            "retry" => NavigationAction::Retry,
            _ => NavigationAction::GiveUp,
        };

        let hints = value
            .get("extraction_hints")
            .or_else(|| value.get("hints"))
            .cloned()
            .unwrap_or_else(|| serde_json::json!({}));

        let content_type = hints
            .get("content_type")
            .and_then(|v| v.as_str())
            .map(|s| match s {
                "product_detail" => NavContentType::ProductDetail,
                "contact_vendor" => NavContentType::ContactVendor,
                "marketplace" => NavContentType::Marketplace,
                "informational" => NavContentType::Informational,
                _ => NavContentType::ProductListing,
            });

        Self {
            action,
            reason: value
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or("No reason provided")
                .to_string(),
            target: value
                .get("target")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            alternative: value
                .get("alternative")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            content_type,
            extraction_hints: hints,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionValidationOutcome {
    pub matches_goal: bool,
    pub match_score: f64,
    pub reason: String,
    pub suggested_action: NavigationAction,
    pub navigation_hint: Option<String>,
}

/// Final navigator output.
#[derive(Debug, Clone)]
pub struct NavigatorResult {
    pub success: bool,
    pub products: Vec<ExtractedProduct>,
    pub content_type: NavContentType,
    pub steps_taken: usize,
    pub navigation_path: Vec<String>,
    pub validation_notes: String,
}

// ───────────────────────────────────────────────────────────────────────────
// URL context
// ───────────────────────────────────────────────────────────────────────────

/// What the URL already tells us about applied state: search terms, filters,
/// page kind. Navigating away from a filtered URL can silently lose the
/// filters, so this feeds both the decision prompt and the guard.
#[derive(Debug, Clone, Default)]
pub struct UrlContext {
    /// "search_results" | "category" | "product" | "homepage" | "unknown"
    pub url_type: &'static str,
    pub is_filtered: bool,
    pub search_query: Option<String>,
    pub price_filter: Option<PriceRange>,
    pub other_filters: Vec<String>,
    pub warnings: Vec<String>,
}

pub fn analyze_url_context(raw_url: &str) -> UrlContext {
    let mut ctx = UrlContext {
        url_type: "unknown",
        ..Default::default()
    };
    let Ok(url) = Url::parse(raw_url) else {
        return ctx;
    };

    let path = url.path().to_lowercase();
    let params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let has_param = |name: &str| params.iter().any(|(k, _)| k == name);

    let search_paths = ["/s", "/search", "/results", "/pl", "/find", "/query"];
    let category_paths = ["/category/", "/browse/", "/c/", "/dept/", "/shop/"];
    let product_paths = ["/dp/", "/product/", "/item/", "/p/", "/pd/", "/ip/"];
    let search_params = ["q", "k", "query", "keyword", "search", "st", "ntt", "term", "text"];

    if search_paths.iter().any(|p| path.contains(p))
        || search_params.iter().any(|p| has_param(p))
    {
        ctx.url_type = "search_results";
    } else if product_paths.iter().any(|p| path.contains(p)) {
        ctx.url_type = "product";
    } else if category_paths.iter().any(|p| path.contains(p)) {
        ctx.url_type = "category";
    } else if matches!(path.as_str(), "/" | "" | "/index.html" | "/home") {
        ctx.url_type = "homepage";
    }

    for name in search_params {
        if let Some((_, v)) = params.iter().find(|(k, _)| k == name) {
            ctx.search_query = Some(v.clone());
            break;
        }
    }

    // Generic price params only; site-specific parsing is learned state, not
    // code.
    let mut price = PriceRange::default();
    for (k, v) in &params {
        match k.as_str() {
            "minPrice" | "price_min" | "lowPrice" => {
                if let Ok(n) = v.parse::<f64>() {
                    price.min = Some(n);
                    ctx.is_filtered = true;
                }
            }
            "maxPrice" | "price_max" | "highPrice" => {
                if let Ok(n) = v.parse::<f64>() {
                    price.max = Some(n);
                    ctx.is_filtered = true;
                }
            }
            _ => {}
        }
    }
    if price.min.is_some() || price.max.is_some() {
        if let Some(max) = price.max {
            ctx.warnings.push(format!(
                "Price filter applied: max ${:.0}. Navigating away may LOSE this filter!",
                max
            ));
        }
        ctx.price_filter = Some(price);
    }

    let filter_keywords = ["brand", "category", "color", "size", "rating", "shipping", "seller", "condition"];
    for (k, v) in &params {
        let k_lower = k.to_lowercase();
        if filter_keywords.iter().any(|kw| k_lower.contains(kw)) {
            ctx.other_filters
                .push(format!("{}={}", k, crate::llm::truncate(v, 50)));
            ctx.is_filtered = true;
        }
    }

    if ctx.other_filters.len() > 2 || ctx.price_filter.is_some() {
        ctx.warnings.push(
            "This page has filters applied. Navigating to 'Filters', 'Sort', or category links \
             may lose them and return irrelevant results."
                .to_string(),
        );
    }

    ctx
}

/// True when a decision target looks like it would wipe applied filters.
pub fn is_filter_risky_target(target: &str) -> bool {
    let lower = target.to_lowercase();
    RISKY_TARGETS.iter().any(|risky| lower.contains(risky))
}

// ───────────────────────────────────────────────────────────────────────────
// Extraction callback
// ───────────────────────────────────────────────────────────────────────────

/// Supplied by the caller (Phase 2): schema-driven or general extraction
/// against the live page, given the decision's hints.
#[async_trait::async_trait]
pub trait ExtractionCallback: Send + Sync {
    async fn extract(
        &self,
        page: &dyn PageHandle,
        hints: &serde_json::Value,
    ) -> Result<Vec<ExtractedProduct>>;
}

// ───────────────────────────────────────────────────────────────────────────
// Navigator
// ───────────────────────────────────────────────────────────────────────────

pub struct GoalDirectedNavigator {
    llm: Arc<dyn LlmInvoker>,
    max_steps: usize,
}

impl GoalDirectedNavigator {
    pub fn new(llm: Arc<dyn LlmInvoker>, max_steps: usize) -> Self {
        Self {
            llm,
            max_steps: max_steps.max(1),
        }
    }

    /// Navigate through the site to find and extract goal-relevant content.
    /// `page` must already be on the starting URL.
    pub async fn find_and_extract(
        &self,
        page: &dyn PageHandle,
        goal: &str,
        extraction: &dyn ExtractionCallback,
        requirements: Option<&ProductRequirements>,
        cancel: &CancellationToken,
    ) -> NavigatorResult {
        let mut visited: HashSet<String> = HashSet::new();
        let mut navigation_path: Vec<String> = Vec::new();
        let mut retry_context: Option<String> = None;

        info!("[Navigator] Starting goal-directed navigation for: {}", goal);

        for step in 0..self.max_steps {
            if cancel.is_cancelled() {
                return NavigatorResult {
                    success: false,
                    products: Vec::new(),
                    content_type: NavContentType::Informational,
                    steps_taken: step,
                    navigation_path,
                    validation_notes: "cancelled".to_string(),
                };
            }

            let current_url = page.current_url().await;
            if !navigation_path.contains(&current_url) {
                navigation_path.push(current_url.clone());
            }

            // Cycle detection: same URL minus query params revisited.
            let url_key = current_url.split('?').next().unwrap_or("").to_string();
            if step > 0 && !visited.insert(url_key) {
                warn!("[Navigator] Already visited {}, stopping", current_url);
                break;
            } else if step == 0 {
                visited.insert(current_url.split('?').next().unwrap_or("").to_string());
            }

            info!(
                "[Navigator] Step {}/{}: Perceiving {}",
                step + 1,
                self.max_steps,
                crate::llm::truncate(&current_url, 60)
            );
            let perception = match self.perceive(page).await {
                Ok(p) => p,
                Err(e) => {
                    warn!("[Navigator] perception failed: {}", e);
                    break;
                }
            };

            let url_ctx = analyze_url_context(&current_url);
            let mut decision = self
                .decide(&perception, goal, &url_ctx, requirements, retry_context.take())
                .await;

            info!(
                "[Navigator] Decision: {:?} - {}",
                decision.action,
                crate::llm::truncate(&decision.reason, 100)
            );

            // GUARD: on a price-filtered URL, a filter-wiping navigation is
            // overridden into extraction. Losing an applied maxPrice filter
            // costs more than extracting a mediocre page.
            if decision.action == NavigationAction::Navigate {
                if url_ctx.is_filtered && url_ctx.price_filter.is_some() {
                    let target_risky = decision
                        .target
                        .as_deref()
                        .map(is_filter_risky_target)
                        .unwrap_or(false);
                    if target_risky {
                        warn!(
                            "[Navigator] GUARDRAIL: Blocking navigation to '{}' - would likely lose price filter. Forcing EXTRACT instead.",
                            decision.target.as_deref().unwrap_or("")
                        );
                        decision = NavigationDecision {
                            action: NavigationAction::Extract,
                            reason: "guard: preserving applied price filter".to_string(),
                            target: None,
                            alternative: None,
                            content_type: Some(NavContentType::ProductListing),
                            extraction_hints: serde_json::json!({
                                "content_type": "product_listing",
                                "has_prices": perception.price_count > 0,
                                "notes": "guard prevented filter-losing navigation",
                            }),
                        };
                    }
                }
            }

            match decision.action {
                NavigationAction::Extract => {
                    let products = match extraction.extract(page, &decision.extraction_hints).await
                    {
                        Ok(p) => p,
                        Err(e) => {
                            warn!("[Navigator] extraction errored: {}", e);
                            Vec::new()
                        }
                    };

                    if products.is_empty() {
                        warn!("[Navigator] Extraction returned no products");
                        retry_context = Some("Extraction returned no results".to_string());
                        continue;
                    }

                    let validation = self
                        .validate_extraction(&products, goal, &perception, requirements)
                        .await;
                    info!(
                        "[Navigator] Validation: matches={}, score={:.2}, reason={}",
                        validation.matches_goal,
                        validation.match_score,
                        crate::llm::truncate(&validation.reason, 80)
                    );

                    if validation.matches_goal {
                        info!(
                            "[Navigator] SUCCESS: Extracted {} matching products in {} steps",
                            products.len(),
                            step + 1
                        );
                        return NavigatorResult {
                            success: true,
                            products,
                            content_type: decision
                                .content_type
                                .unwrap_or(NavContentType::ProductListing),
                            steps_taken: step + 1,
                            navigation_path,
                            validation_notes: validation.reason,
                        };
                    }

                    // Mismatch. Retry through DECIDE with the rejection
                    // reason unless this was the last step.
                    warn!("[Navigator] Extraction MISMATCH: {}", validation.reason);
                    if step + 1 >= self.max_steps {
                        return NavigatorResult {
                            success: false,
                            products,
                            content_type: decision
                                .content_type
                                .unwrap_or(NavContentType::ProductListing),
                            steps_taken: step + 1,
                            navigation_path,
                            validation_notes: format!("MISMATCH: {}", validation.reason),
                        };
                    }
                    let retry = self
                        .decide_retry(&perception, goal, &validation)
                        .await;
                    match retry.action {
                        NavigationAction::Navigate => {
                            if let Some(target) = retry.target.as_deref() {
                                info!("[Navigator] Retrying: navigating to {}", target);
                                if !self.navigate_to_target(page, target, retry.alternative.as_deref()).await {
                                    retry_context =
                                        Some(format!("navigation to '{}' failed", target));
                                }
                            }
                        }
                        _ => {
                            info!("[Navigator] Giving up after mismatch: {}", retry.reason);
                            break;
                        }
                    }
                }
                NavigationAction::Navigate => {
                    let Some(target) = decision.target.as_deref() else {
                        retry_context = Some("navigate decision had no target".to_string());
                        continue;
                    };
                    info!("[Navigator] Navigating to: {}", target);
                    if !self
                        .navigate_to_target(page, target, decision.alternative.as_deref())
                        .await
                    {
                        warn!("[Navigator] Navigation failed, trying to continue...");
                        retry_context = Some(format!("could not click '{}'", target));
                    }
                }
                NavigationAction::Retry => {
                    // A bare RETRY from the decision prompt re-enters with
                    // its reason as context.
                    retry_context = Some(decision.reason.clone());
                }
                NavigationAction::GiveUp => {
                    info!("[Navigator] Giving up: {}", decision.reason);
                    break;
                }
            }
        }

        warn!(
            "[Navigator] FAILED: Could not find goal-matching content in {} pages",
            navigation_path.len()
        );
        NavigatorResult {
            success: false,
            products: Vec::new(),
            content_type: NavContentType::Informational,
            steps_taken: navigation_path.len(),
            navigation_path,
            validation_notes: "Could not find goal-matching content".to_string(),
        }
    }

    /// PERCEIVE: structured page signals via one in-page script, no LLM.
    async fn perceive(&self, page: &dyn PageHandle) -> Result<PagePerception> {
        let script = r#"(() => {
            const navSelectors = 'nav a, header a, [class*="menu"] a, [class*="nav"] a, [role="navigation"] a';
            const navLinks = Array.from(document.querySelectorAll(navSelectors))
                .slice(0, 25)
                .map(a => ({text: (a.innerText || '').trim().slice(0, 60), href: a.getAttribute('href') || ''}))
                .filter(l => l.text.length > 0);

            const headings = Array.from(document.querySelectorAll('h1, h2, h3'))
                .slice(0, 15)
                .map(h => (h.innerText || '').trim().slice(0, 80))
                .filter(t => t.length > 0);

            const bodyText = (document.body ? document.body.innerText : '') || '';
            const priceMatches = bodyText.match(/[$€£]\s?\d[\d,.]*/g) || [];

            return {
                url: location.href,
                title: document.title || '',
                main_heading: headings.length ? headings[0] : '',
                nav_links: navLinks,
                content_headings: headings,
                price_count: priceMatches.length,
                has_cart: !!document.querySelector('[class*="cart"], [id*="cart"], [href*="cart"]'),
                has_product_grid: !!document.querySelector('[class*="product"], [class*="grid"] [class*="item"], [data-sku]'),
                has_contact_form: !!document.querySelector('form [type="email"], form [name*="contact"]'),
                body_preview: bodyText.replace(/\s+/g, ' ').slice(0, 800),
            };
        })()"#;

        let value = page.evaluate(script).await?;
        serde_json::from_value(value).map_err(|e| anyhow!("perception parse failed: {}", e))
    }

    /// DECIDE: LLM call over (goal, perception, URL context, requirements).
    async fn decide(
        &self,
        perception: &PagePerception,
        goal: &str,
        url_ctx: &UrlContext,
        requirements: Option<&ProductRequirements>,
        extra_context: Option<String>,
    ) -> NavigationDecision {
        let nav_text = perception
            .nav_links
            .iter()
            .take(15)
            .map(|l| format!("  - '{}' → {}", l.text, crate::llm::truncate(&l.href, 60)))
            .collect::<Vec<_>>()
            .join("\n");

        let requirements_block = requirements
            .map(|r| format!("\nRequirements:\n{}\n", r.to_prompt_context()))
            .unwrap_or_default();
        let warnings_block = if url_ctx.warnings.is_empty() {
            String::new()
        } else {
            format!("\nURL warnings:\n- {}\n", url_ctx.warnings.join("\n- "))
        };
        let context_block = extra_context
            .map(|c| format!("\nPrevious attempt: {}\n", c))
            .unwrap_or_default();

        let prompt = format!(
            "Goal: \"{goal}\"\n\
             Current page: {} ({})\n\
             Title: {}\n\
             Main heading: {}\n\
             Prices visible: {}\n\
             Has cart: {} | product grid: {} | contact form: {}\n\
             URL type: {} | search query in URL: {:?} | filtered: {}\n\
             {requirements_block}{warnings_block}{context_block}\n\
             Navigation links:\n{nav_text}\n\n\
             Body preview:\n{}\n\n\
             Decide the next action. Respond with JSON:\n\
             {{\"action\": \"extract|navigate|give_up|retry\", \"reason\": \"…\", \
             \"target\": \"link text to click (for navigate)\", \"alternative\": \"backup link text\", \
             \"extraction_hints\": {{\"content_type\": \"product_listing|product_detail|contact_vendor|marketplace|informational\"}}}}",
            perception.url,
            url_ctx.url_type,
            perception.title,
            perception.main_heading,
            perception.price_count,
            perception.has_cart,
            perception.has_product_grid,
            perception.has_contact_form,
            url_ctx.url_type,
            url_ctx.search_query,
            url_ctx.is_filtered,
            crate::llm::truncate(&perception.body_preview, 600),
        );

        match self.llm.call(&prompt, LlmRole::NavigationDecider, 400, 0.2).await {
            Ok(response) => match extract_json_object(&response) {
                Some(value) => NavigationDecision::from_json(&value),
                None => NavigationDecision::give_up("decision response had no JSON"),
            },
            Err(e) => NavigationDecision::give_up(format!("decision LLM failed: {}", e)),
        }
    }

    /// VALIDATE: requirements-based deterministic matching when available,
    /// LLM judgment otherwise.
    async fn validate_extraction(
        &self,
        products: &[ExtractedProduct],
        goal: &str,
        perception: &PagePerception,
        requirements: Option<&ProductRequirements>,
    ) -> ExtractionValidationOutcome {
        if products.is_empty() {
            return ExtractionValidationOutcome {
                matches_goal: false,
                match_score: 0.0,
                reason: "No products extracted".to_string(),
                suggested_action: NavigationAction::Navigate,
                navigation_hint: None,
            };
        }

        if let Some(req) = requirements {
            let mut matches = 0usize;
            for product in products {
                let (title_ok, _) = req.quick_title_check(&product.title);
                if !title_ok {
                    continue;
                }
                // Specs only gate when present; bare listings pass on title.
                if !product.specs.is_empty() && !req.validate_specs(&product.specs).0 {
                    continue;
                }
                matches += 1;
            }
            let ratio = matches as f64 / products.len() as f64;
            let matches_goal = ratio >= MATCH_RATIO_FLOOR;
            info!(
                "[Navigator] Requirements validation: {}/{} products match",
                matches,
                products.len()
            );
            return ExtractionValidationOutcome {
                matches_goal,
                match_score: ratio,
                reason: format!("{} of {} products match requirements", matches, products.len()),
                suggested_action: if matches_goal {
                    NavigationAction::Extract
                } else {
                    NavigationAction::Navigate
                },
                navigation_hint: None,
            };
        }

        // LLM fallback validation.
        let titles: Vec<String> = products
            .iter()
            .take(10)
            .map(|p| format!("  - {}", crate::llm::truncate(&p.title, 100)))
            .collect();
        let prompt = format!(
            "Goal: \"{goal}\"\n\nExtracted items ({} total):\n{}\n\nPage: {} ({})\n\n\
             Do the extracted items match the goal? Respond with JSON:\n\
             {{\"matches_goal\": bool, \"match_score\": 0.0-1.0, \"reason\": \"…\", \
             \"suggested_action\": \"continue|navigate|retry|give_up\", \"navigation_hint\": \"…\"}}",
            products.len(),
            titles.join("\n"),
            perception.title,
            perception.url,
        );

        match self.llm.call(&prompt, LlmRole::ExtractionValidator, 300, 0.0).await {
            Ok(response) => match extract_json_object(&response) {
                Some(value) => {
                    let action = match value
                        .get("suggested_action")
                        .and_then(|v| v.as_str())
                        .unwrap_or("give_up")
                    {
                        "continue" => NavigationAction::Extract,
                        "navigate" => NavigationAction::Navigate,
                        "retry" => NavigationAction::Retry,
                        _ => NavigationAction::GiveUp,
                    };
                    ExtractionValidationOutcome {
                        matches_goal: value
                            .get("matches_goal")
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false),
                        match_score: value
                            .get("match_score")
                            .and_then(|v| v.as_f64())
                            .unwrap_or(0.0),
                        reason: value
                            .get("reason")
                            .and_then(|v| v.as_str())
                            .unwrap_or("No reason provided")
                            .to_string(),
                        suggested_action: action,
                        navigation_hint: value
                            .get("navigation_hint")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string()),
                    }
                }
                // Unparseable response: assume match so valid results are
                // not thrown away on a formatting hiccup.
                None => ExtractionValidationOutcome {
                    matches_goal: true,
                    match_score: 0.5,
                    reason: "Could not validate, assuming match".to_string(),
                    suggested_action: NavigationAction::Extract,
                    navigation_hint: None,
                },
            },
            Err(e) => ExtractionValidationOutcome {
                matches_goal: true,
                match_score: 0.5,
                reason: format!("Validation error: {}", e),
                suggested_action: NavigationAction::Extract,
                navigation_hint: None,
            },
        }
    }

    /// RETRY decision after a validation mismatch: find a better path.
    async fn decide_retry(
        &self,
        perception: &PagePerception,
        goal: &str,
        validation: &ExtractionValidationOutcome,
    ) -> NavigationDecision {
        let nav_text = perception
            .nav_links
            .iter()
            .take(15)
            .map(|l| format!("  - '{}' → {}", l.text, crate::llm::truncate(&l.href, 60)))
            .collect::<Vec<_>>()
            .join("\n");

        let hint_block = validation
            .navigation_hint
            .as_deref()
            .map(|h| format!("Hint: {}\n", h))
            .unwrap_or_default();

        let prompt = format!(
            "Goal: \"{goal}\"\n\
             Problem: {}\n{hint_block}\n\
             Current page: {} ({})\n\n\
             Navigation links available:\n{nav_text}\n\n\
             The last extraction did not match the goal. Find an alternative \
             navigation path. Respond with JSON:\n\
             {{\"action\": \"navigate|give_up\", \"reason\": \"…\", \"target\": \"link text\", \"alternative\": \"backup link text\"}}",
            validation.reason, perception.title, perception.url,
        );

        match self.llm.call(&prompt, LlmRole::RetryDecider, 300, 0.2).await {
            Ok(response) => match extract_json_object(&response) {
                Some(value) => NavigationDecision::from_json(&value),
                None => NavigationDecision::give_up("Could not find alternative navigation"),
            },
            Err(e) => NavigationDecision::give_up(format!("retry decision failed: {}", e)),
        }
    }

    /// ACT/NAVIGATE: click a link by exact text → partial text → href slug,
    /// then the alternative target through the same ladder.
    async fn navigate_to_target(
        &self,
        page: &dyn PageHandle,
        target: &str,
        alternative: Option<&str>,
    ) -> bool {
        if self.click_link(page, target).await {
            return true;
        }
        if let Some(alt) = alternative {
            info!("[Navigator] Primary failed, trying alternative: {}", alt);
            if self.click_link(page, alt).await {
                return true;
            }
        }
        false
    }

    async fn click_link(&self, page: &dyn PageHandle, target: &str) -> bool {
        let slug = target
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-");
        let script = format!(
            r#"(() => {{
                const target = {target_json};
                const slug = {slug_json};
                const anchors = Array.from(document.querySelectorAll('a'));
                const norm = t => (t || '').trim().toLowerCase();

                let el = anchors.find(a => norm(a.innerText) === norm(target));
                if (!el) el = anchors.find(a => norm(a.innerText).includes(norm(target)));
                if (!el && slug.length > 2) el = anchors.find(a => (a.getAttribute('href') || '').toLowerCase().includes(slug));
                if (!el) return false;
                el.click();
                return true;
            }})()"#,
            target_json = serde_json::to_string(target).unwrap_or_else(|_| "\"\"".into()),
            slug_json = serde_json::to_string(&slug).unwrap_or_else(|_| "\"\"".into()),
        );

        match page.evaluate(&script).await {
            Ok(value) => {
                let clicked = value.as_bool().unwrap_or(false);
                if clicked {
                    // Give the navigation a moment to land.
                    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
                }
                clicked
            }
            Err(e) => {
                warn!("[Navigator] click script failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_context_detects_price_filter_and_search() {
        let ctx = analyze_url_context("https://shop.example.com/s?q=gpu&maxPrice=500&brand=nvidia");
        assert_eq!(ctx.url_type, "search_results");
        assert!(ctx.is_filtered);
        assert_eq!(ctx.search_query.as_deref(), Some("gpu"));
        assert_eq!(ctx.price_filter.unwrap().max, Some(500.0));
        assert!(!ctx.warnings.is_empty());
        assert!(ctx.other_filters.iter().any(|f| f.contains("brand")));
    }

    #[test]
    fn url_context_types() {
        assert_eq!(analyze_url_context("https://x.test/").url_type, "homepage");
        assert_eq!(
            analyze_url_context("https://x.test/product/123").url_type,
            "product"
        );
        assert_eq!(
            analyze_url_context("https://x.test/category/pets").url_type,
            "category"
        );
        assert_eq!(analyze_url_context("not a url").url_type, "unknown");
    }

    #[test]
    fn risky_targets_match_filter_vocabulary() {
        assert!(is_filter_risky_target("Filters"));
        assert!(is_filter_risky_target("Sort by price"));
        assert!(is_filter_risky_target("Clear all"));
        assert!(is_filter_risky_target("Browse categories"));
        assert!(!is_filter_risky_target("Hamsters"));
        assert!(!is_filter_risky_target("Next page"));
    }

    #[test]
    fn decision_from_json_maps_aliases() {
        let v = serde_json::json!({"action": "click", "reason": "go deeper", "target": "Hamsters"});
        let d = NavigationDecision::from_json(&v);
        assert_eq!(d.action, NavigationAction::Navigate);
        assert_eq!(d.target.as_deref(), Some("Hamsters"));

        let v = serde_json::json!({"action": "dance"});
        assert_eq!(NavigationDecision::from_json(&v).action, NavigationAction::GiveUp);

        let v = serde_json::json!({
            "action": "extract",
            "reason": "products visible",
            "hints": {"content_type": "marketplace"}
        });
        let d = NavigationDecision::from_json(&v);
        assert_eq!(d.action, NavigationAction::Extract);
        assert_eq!(d.content_type, Some(NavContentType::Marketplace));
    }
}
