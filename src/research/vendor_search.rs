//! Phase 2 — vendor extraction.
//!
//! Selects candidate vendors (Phase-1 retailers ∪ registry knowledge ∪ SERP
//! for the optimized query), ranks them by relevance × health, and runs the
//! goal-directed navigator against each inside a per-vendor budget, with
//! bounded concurrency. Every finding is tagged with the host of the URL the
//! browser actually visited — an LLM-claimed vendor name is never trusted.
//! Deterministic post-filters (budget, excluded terms, deal breakers) split
//! the aggregate into passing and rejected lists.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::browser::fetcher::{FetchOutcome, PageFetcher};
use crate::browser::PageHandle;
use crate::content::sanitize::{sanitize_html, DEFAULT_TOKEN_BUDGET};
use crate::core::error::BlockKind;
use crate::core::events::{emit, EventSink};
use crate::core::types::{normalize_host, Finding, Intelligence};
use crate::llm::{extract_json_object, LlmInvoker, LlmRole};
use crate::navigator::{
    ExtractedProduct, ExtractionCallback, GoalDirectedNavigator, NavigatorResult,
};
use crate::registry::{SchemaRegistry, SiteKnowledgeCache, VendorRegistry};
use crate::research::requirements::RequirementsReasoning;
use crate::search::SearchProvider;

#[derive(Debug, Clone, Default)]
pub struct Phase2Result {
    pub findings: Vec<Finding>,
    pub rejected: Vec<Finding>,
    pub vendors_visited: usize,
    pub vendors_blocked: usize,
    pub failure_reasons: Vec<String>,
}

pub struct VendorSearch {
    search: Arc<dyn SearchProvider>,
    fetcher: Arc<PageFetcher>,
    navigator: Arc<GoalDirectedNavigator>,
    vendors: Arc<VendorRegistry>,
    schemas: Arc<SchemaRegistry>,
    site_notes: Arc<SiteKnowledgeCache>,
    llm: Arc<dyn LlmInvoker>,
    events: Option<Arc<dyn EventSink>>,
    vendor_timeout: Duration,
    concurrency: usize,
}

impl VendorSearch {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        search: Arc<dyn SearchProvider>,
        fetcher: Arc<PageFetcher>,
        navigator: Arc<GoalDirectedNavigator>,
        vendors: Arc<VendorRegistry>,
        schemas: Arc<SchemaRegistry>,
        site_notes: Arc<SiteKnowledgeCache>,
        llm: Arc<dyn LlmInvoker>,
        events: Option<Arc<dyn EventSink>>,
        vendor_timeout: Duration,
        concurrency: usize,
    ) -> Self {
        Self {
            search,
            fetcher,
            navigator,
            vendors,
            schemas,
            site_notes,
            llm,
            events,
            vendor_timeout,
            concurrency: concurrency.max(1),
        }
    }

    /// Run Phase 2 for a commerce goal.
    pub async fn search_products(
        &self,
        goal: &str,
        intelligence: &Intelligence,
        reasoning: &RequirementsReasoning,
        session_id: &str,
        max_vendors: usize,
        cancel: &CancellationToken,
    ) -> Phase2Result {
        emit(
            &self.events,
            "phase2_started",
            serde_json::json!({"goal": goal, "max_vendors": max_vendors}),
        );

        let candidates = self
            .select_vendors(intelligence, &reasoning.optimized_query, max_vendors)
            .await;
        if candidates.is_empty() {
            warn!("[Phase2] no usable vendor candidates");
            return Phase2Result {
                failure_reasons: vec!["no usable vendors discovered".to_string()],
                ..Default::default()
            };
        }
        info!(
            "[Phase2] visiting {} vendors: {}",
            candidates.len(),
            candidates.join(", ")
        );

        // Per-vendor tasks under a shared concurrency cap. join_all keeps the
        // selection order, which fixes the tie-break order of aggregation.
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let futures: Vec<_> = candidates
            .iter()
            .map(|domain| {
                let domain = domain.clone();
                let semaphore = semaphore.clone();
                async move {
                    let _permit = semaphore.acquire().await.ok()?;
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let started = Instant::now();
                    let outcome = tokio::time::timeout(
                        self.vendor_timeout,
                        self.process_vendor(&domain, goal, reasoning, session_id, cancel),
                    )
                    .await;
                    Some(match outcome {
                        Ok(result) => result,
                        Err(_) => {
                            warn!(
                                "[Phase2] vendor {} timed out after {:.0}s",
                                domain,
                                started.elapsed().as_secs_f64()
                            );
                            self.vendors.record_visit(&domain, false, 0.0, None);
                            VendorOutcome {
                                domain: domain.clone(),
                                findings: Vec::new(),
                                blocked: None,
                                note: Some(format!("{}: per-vendor budget exhausted", domain)),
                            }
                        }
                    })
                }
            })
            .collect();

        let outcomes: Vec<Option<VendorOutcome>> = futures::future::join_all(futures).await;

        let mut all_findings: Vec<Finding> = Vec::new();
        let mut failure_reasons: Vec<String> = Vec::new();
        let mut vendors_visited = 0usize;
        let mut vendors_blocked = 0usize;

        for outcome in outcomes.into_iter().flatten() {
            vendors_visited += 1;
            if outcome.blocked.is_some() {
                vendors_blocked += 1;
            }
            if let Some(note) = outcome.note {
                failure_reasons.push(note);
            }
            all_findings.extend(outcome.findings);
        }

        let (mut findings, mut rejected) = apply_post_filters(all_findings, reasoning);

        // Strict filtering emptied the list but candidates exist: walk the
        // relaxation tiers and re-filter the rejects before giving up.
        if findings.is_empty() && !rejected.is_empty() {
            let mut relaxed = reasoning.clone();
            while findings.is_empty() && relaxed.requirements.can_relax() {
                if relaxed.requirements.relax().is_none() {
                    break;
                }
                let (pass, fail) = apply_post_filters(std::mem::take(&mut rejected), &relaxed);
                findings = pass;
                rejected = fail;
            }
        }

        info!(
            "[Phase2] {} findings pass filters, {} rejected ({} vendors visited, {} blocked)",
            findings.len(),
            rejected.len(),
            vendors_visited,
            vendors_blocked
        );
        emit(
            &self.events,
            "phase2_complete",
            serde_json::json!({"findings": findings.len(), "rejected": rejected.len()}),
        );

        Phase2Result {
            findings,
            rejected,
            vendors_visited,
            vendors_blocked,
            failure_reasons,
        }
    }

    /// Candidate selection: intelligence retailers, registry knowledge, and
    /// a SERP pass over the optimized query, ranked by relevance × health
    /// and filtered through usability (quarantine auto-expiry included).
    async fn select_vendors(
        &self,
        intelligence: &Intelligence,
        optimized_query: &str,
        max_vendors: usize,
    ) -> Vec<String> {
        let mut scores: HashMap<String, f64> = HashMap::new();

        for (domain, hint) in &intelligence.retailers {
            let domain = crate::core::types::normalize_domain(domain);
            scores.insert(domain, hint.relevance.clamp(0.0, 1.0));
        }

        for vendor in self.vendors.get_usable_vendors(None, max_vendors * 2) {
            let health = if vendor.total_visits == 0 {
                0.5
            } else {
                vendor.success_rate()
            };
            let entry = scores.entry(vendor.domain.clone()).or_insert(0.4);
            *entry += health * 0.5;
        }

        match self.search.search(optimized_query).await {
            Ok(entries) => {
                for (rank, entry) in entries.iter().take(10).enumerate() {
                    let domain = normalize_host(&entry.url);
                    if domain.is_empty() {
                        continue;
                    }
                    let serp_score = 0.5 * (1.0 - rank as f64 / 10.0);
                    let slot = scores.entry(domain.clone()).or_insert(0.0);
                    *slot += serp_score;
                    self.vendors.add_or_update(
                        &domain,
                        "",
                        &[],
                        "",
                        "serp_discovery",
                        optimized_query,
                    );
                }
            }
            Err(e) => warn!("[Phase2] vendor discovery SERP failed: {}", e),
        }

        // Health multiplier + usability gate.
        let mut ranked: Vec<(String, f64)> = scores
            .into_iter()
            .filter(|(domain, _)| self.vendors.is_usable(domain))
            .map(|(domain, relevance)| {
                let health = self
                    .vendors
                    .get(&domain)
                    .map(|v| {
                        if v.total_visits == 0 {
                            1.0
                        } else {
                            v.success_rate().max(0.1)
                        }
                    })
                    .unwrap_or(1.0);
                (domain, relevance * health)
            })
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(max_vendors);
        ranked.into_iter().map(|(d, _)| d).collect()
    }

    async fn process_vendor(
        &self,
        domain: &str,
        goal: &str,
        reasoning: &RequirementsReasoning,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> VendorOutcome {
        let started = Instant::now();
        let url = format!("https://{}/", domain);

        let fetched = match self.fetcher.fetch(&url, session_id).await {
            Ok(FetchOutcome::Success(f)) => f,
            Ok(FetchOutcome::Blocked { kind, confidence }) => {
                let hint = self.vendors.record_visit(domain, false, 0.0, Some(kind));
                if let Some(strategy) = hint {
                    self.site_notes.add_note(
                        domain,
                        &format!("blocked ({}, conf {:.2}); try {}", kind, confidence, strategy),
                        "fetcher",
                    );
                }
                return VendorOutcome {
                    domain: domain.to_string(),
                    findings: Vec::new(),
                    blocked: Some(kind),
                    note: Some(format!("{}: blocked ({})", domain, kind)),
                };
            }
            Err(e) => {
                self.vendors.record_visit(domain, false, 0.0, None);
                return VendorOutcome {
                    domain: domain.to_string(),
                    findings: Vec::new(),
                    blocked: None,
                    note: Some(format!("{}: fetch failed ({})", domain, e)),
                };
            }
        };

        let extractor = SchemaFirstExtractor {
            schemas: self.schemas.clone(),
            llm: self.llm.clone(),
            domain: domain.to_string(),
        };
        let nav_result: NavigatorResult = self
            .navigator
            .find_and_extract(
                fetched.page.as_ref(),
                goal,
                &extractor,
                Some(&reasoning.requirements),
                cancel,
            )
            .await;

        // Vendor attribution comes from the page the browser is actually on,
        // never from extraction output.
        let page_url = fetched.page.current_url().await;
        let actual_domain = {
            let host = normalize_host(&page_url);
            if host.is_empty() {
                domain.to_string()
            } else {
                host
            }
        };
        fetched.page.close().await;

        let elapsed_ms = started.elapsed().as_millis() as f64;
        let hint = self
            .vendors
            .record_visit(domain, nav_result.success, elapsed_ms, None);
        if let Some(strategy) = hint {
            self.site_notes.add_note(
                domain,
                &format!("extraction failing; next recovery: {}", strategy),
                "navigator",
            );
        }

        let findings: Vec<Finding> = nav_result
            .products
            .iter()
            .map(|product| {
                let finding_url = if product.url.trim().is_empty() {
                    page_url.clone()
                } else {
                    resolve_product_url(&page_url, &product.url)
                };
                let vendor = {
                    let host = normalize_host(&finding_url);
                    if host.is_empty() {
                        actual_domain.clone()
                    } else {
                        host
                    }
                };
                Finding {
                    name: product.title.clone(),
                    price: product.price,
                    vendor,
                    url: finding_url,
                    description: product.description.clone(),
                    confidence: if nav_result.success { 0.8 } else { 0.4 },
                    strengths: Vec::new(),
                    weaknesses: if nav_result.success {
                        Vec::new()
                    } else {
                        vec![nav_result.validation_notes.clone()]
                    },
                }
            })
            .collect();

        let note = if findings.is_empty() {
            Some(format!("{}: {}", domain, nav_result.validation_notes))
        } else {
            None
        };

        VendorOutcome {
            domain: domain.to_string(),
            findings,
            blocked: None,
            note,
        }
    }
}

struct VendorOutcome {
    #[allow(dead_code)]
    domain: String,
    findings: Vec<Finding>,
    blocked: Option<BlockKind>,
    note: Option<String>,
}

/// Deterministic post-filters: budget bounds, excluded terms, deal
/// breakers. Rejected findings are kept for downstream context.
pub fn apply_post_filters(
    findings: Vec<Finding>,
    reasoning: &RequirementsReasoning,
) -> (Vec<Finding>, Vec<Finding>) {
    let mut passing = Vec::new();
    let mut rejected = Vec::new();

    for finding in findings {
        let haystack = format!("{} {}", finding.name, finding.description).to_lowercase();

        let excluded = reasoning
            .excluded_terms
            .iter()
            .any(|t| haystack.contains(&t.to_lowercase()));
        if excluded {
            rejected.push(finding);
            continue;
        }

        let (title_ok, _) = reasoning.requirements.quick_title_check(&finding.name);
        if !title_ok {
            rejected.push(finding);
            continue;
        }

        if let Some(price) = finding.price {
            if let Some(max) = reasoning.requirements.budget.max {
                if price > max {
                    rejected.push(finding);
                    continue;
                }
            }
            if let Some(min) = reasoning.requirements.budget.min {
                if price < min {
                    rejected.push(finding);
                    continue;
                }
            }
        }

        passing.push(finding);
    }

    (passing, rejected)
}

fn resolve_product_url(page_url: &str, product_url: &str) -> String {
    if product_url.starts_with("http://") || product_url.starts_with("https://") {
        return product_url.to_string();
    }
    match url::Url::parse(page_url).and_then(|base| base.join(product_url)) {
        Ok(joined) => joined.to_string(),
        Err(_) => product_url.to_string(),
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Schema-first extraction
// ───────────────────────────────────────────────────────────────────────────

/// Extraction callback: learned-schema DOM extraction first, general LLM
/// extraction as fallback, method stats recorded either way so schema drift
/// is visible to the registry.
pub struct SchemaFirstExtractor {
    pub schemas: Arc<SchemaRegistry>,
    pub llm: Arc<dyn LlmInvoker>,
    pub domain: String,
}

impl SchemaFirstExtractor {
    fn page_type_from_hints(hints: &serde_json::Value) -> &'static str {
        match hints.get("content_type").and_then(|v| v.as_str()) {
            Some("product_detail") => "pdp",
            _ => "listing",
        }
    }

    async fn extract_with_schema(
        &self,
        page: &dyn PageHandle,
        schema: &crate::registry::SiteSchema,
    ) -> anyhow::Result<Vec<ExtractedProduct>> {
        let card = schema
            .product_card_selector
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("schema has no product card selector"))?;
        let script = format!(
            r#"(() => {{
                const cards = Array.from(document.querySelectorAll({card}));
                const pick = (root, sel) => {{
                    if (!sel) return null;
                    const el = root.querySelector(sel);
                    return el ? (el.innerText || el.getAttribute('alt') || '').trim() : null;
                }};
                return cards.slice(0, 30).map(c => {{
                    const linkSel = {link};
                    const link = linkSel ? c.querySelector(linkSel) : c.querySelector('a');
                    return {{
                        title: pick(c, {title}) || (link ? (link.innerText || '').trim() : ''),
                        price_text: pick(c, {price}),
                        url: link ? (link.href || '') : '',
                    }};
                }}).filter(p => p.title && p.title.length > 0);
            }})()"#,
            card = serde_json::to_string(card)?,
            link = serde_json::to_string(&schema.product_link_selector)?,
            title = serde_json::to_string(&schema.title_selector)?,
            price = serde_json::to_string(&schema.price_selector)?,
        );

        let value = page.evaluate(&script).await?;
        let raw: Vec<serde_json::Value> = serde_json::from_value(value)?;
        Ok(raw
            .into_iter()
            .filter_map(|item| {
                let title = item.get("title")?.as_str()?.trim().to_string();
                if title.is_empty() {
                    return None;
                }
                Some(ExtractedProduct {
                    title,
                    price: item
                        .get("price_text")
                        .and_then(|v| v.as_str())
                        .and_then(parse_price),
                    url: item
                        .get("url")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    specs: HashMap::new(),
                    description: String::new(),
                })
            })
            .collect())
    }

    async fn extract_general(
        &self,
        page: &dyn PageHandle,
        hints: &serde_json::Value,
    ) -> anyhow::Result<Vec<ExtractedProduct>> {
        let html = page.content().await?;
        let page_url = page.current_url().await;
        let sanitized = sanitize_html(&html, DEFAULT_TOKEN_BUDGET);

        let prompt = format!(
            "URL: {}\nHints: {}\n\nPage content:\n{}\n\n\
             Extract every product/offer listed. Respond with JSON:\n\
             {{\"products\": [{{\"title\": \"…\", \"price\": number|null, \"url\": \"…\", \
             \"specs\": {{}}, \"description\": \"…\"}}]}}",
            page_url,
            hints,
            crate::llm::truncate(&sanitized.full_text(), 10_000),
        );
        let response = self.llm.call(&prompt, LlmRole::PageReader, 1500, 0.0).await?;
        let value = extract_json_object(&response)
            .ok_or_else(|| anyhow::anyhow!("no JSON in extraction response"))?;
        let products: Vec<ExtractedProduct> = value
            .get("products")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        Ok(products
            .into_iter()
            .filter(|p| !p.title.trim().is_empty())
            .collect())
    }
}

#[async_trait::async_trait]
impl ExtractionCallback for SchemaFirstExtractor {
    async fn extract(
        &self,
        page: &dyn PageHandle,
        hints: &serde_json::Value,
    ) -> anyhow::Result<Vec<ExtractedProduct>> {
        let page_type = Self::page_type_from_hints(hints);

        if let Some(schema) = self.schemas.get(&self.domain, page_type) {
            if !schema.needs_recalibration() {
                match self.extract_with_schema(page, &schema).await {
                    Ok(products) if !products.is_empty() => {
                        self.schemas
                            .record_extraction(&self.domain, page_type, true, "schema");
                        info!(
                            "[Phase2] schema extraction: {} products from {}",
                            products.len(),
                            self.domain
                        );
                        return Ok(products);
                    }
                    Ok(_) => {
                        self.schemas
                            .record_extraction(&self.domain, page_type, false, "schema");
                    }
                    Err(e) => {
                        warn!("[Phase2] schema extraction failed on {}: {}", self.domain, e);
                        self.schemas
                            .record_extraction(&self.domain, page_type, false, "schema");
                    }
                }
            }
        }

        // General fallback; method stats recorded only when a schema record
        // exists to attach them to.
        match self.extract_general(page, hints).await {
            Ok(products) => {
                if self.schemas.get(&self.domain, page_type).is_some() {
                    self.schemas.record_extraction(
                        &self.domain,
                        page_type,
                        !products.is_empty(),
                        "general",
                    );
                }
                Ok(products)
            }
            Err(e) => {
                if self.schemas.get(&self.domain, page_type).is_some() {
                    self.schemas
                        .record_extraction(&self.domain, page_type, false, "general");
                }
                Err(e)
            }
        }
    }
}

/// Parse "$1,299.99", "€35", "35.00 USD" and similar into a number.
pub fn parse_price(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    // Treat commas as thousands separators.
    cleaned.replace(',', "").parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::PriceRange;
    use crate::research::requirements::ProductRequirements;

    fn finding(name: &str, price: Option<f64>, vendor: &str) -> Finding {
        Finding {
            name: name.to_string(),
            price,
            vendor: vendor.to_string(),
            url: format!("https://{}/p/1", vendor),
            description: String::new(),
            confidence: 0.8,
            strengths: Vec::new(),
            weaknesses: Vec::new(),
        }
    }

    fn reasoning_with(budget_max: Option<f64>) -> RequirementsReasoning {
        RequirementsReasoning {
            excluded_terms: vec!["plush".to_string()],
            requirements: ProductRequirements {
                category: "hamster".to_string(),
                deal_breakers: vec!["gerbil".to_string()],
                budget: PriceRange {
                    min: None,
                    max: budget_max,
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn post_filters_enforce_budget() {
        let reasoning = reasoning_with(Some(40.0));
        let (pass, reject) = apply_post_filters(
            vec![
                finding("Syrian hamster", Some(35.0), "a.example"),
                finding("Syrian hamster deluxe", Some(55.0), "b.example"),
                finding("Syrian hamster unpriced", None, "c.example"),
            ],
            &reasoning,
        );
        assert_eq!(pass.len(), 2);
        assert_eq!(reject.len(), 1);
        assert_eq!(reject[0].price, Some(55.0));
    }

    #[test]
    fn post_filters_reject_excluded_terms_and_deal_breakers() {
        let reasoning = reasoning_with(None);
        let (pass, reject) = apply_post_filters(
            vec![
                finding("Plush hamster toy", Some(10.0), "a.example"),
                finding("Mongolian gerbil", Some(20.0), "b.example"),
                finding("Syrian hamster", Some(30.0), "c.example"),
            ],
            &reasoning,
        );
        assert_eq!(pass.len(), 1);
        assert_eq!(pass[0].name, "Syrian hamster");
        assert_eq!(reject.len(), 2);
    }

    #[test]
    fn price_parsing_handles_currency_noise() {
        assert_eq!(parse_price("$1,299.99"), Some(1299.99));
        assert_eq!(parse_price("€35"), Some(35.0));
        assert_eq!(parse_price("from 35.00 USD"), Some(35.0));
        assert_eq!(parse_price("call for price"), None);
    }

    #[test]
    fn product_url_resolution() {
        assert_eq!(
            resolve_product_url("https://shop.example/cat", "/p/42"),
            "https://shop.example/p/42"
        );
        assert_eq!(
            resolve_product_url("https://shop.example/cat", "https://other.example/x"),
            "https://other.example/x"
        );
    }
}
