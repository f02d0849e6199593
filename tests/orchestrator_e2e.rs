//! End-to-end research scenarios over scripted collaborators: commerce with
//! vendor extraction and caching, informational Phase-1-only runs, empty
//! SERPs, fully blocked engines, and deep-mode pass accounting.

mod common;

use std::sync::Arc;

use common::{serp, ArcMockBrowser, MockBrowser, MockLlm, MockSearch, MockSite};
use forage::core::config::CoreConfig;
use forage::core::types::{PhasePlan, ResearchMode};
use forage::llm::LlmRole;
use forage::memory::EmbeddingService;
use forage::{Intent, ResearchCore, ResearchError, ResearchRequest};

fn test_config(dir: &tempfile::TempDir) -> CoreConfig {
    let raw = format!(
        r#"{{
            "state_dir": {:?},
            "research": {{"fetch_settle_ms": 0, "vendor_timeout_secs": 20}},
            "search": {{"min_delay_secs": 0.0}}
        }}"#,
        dir.path().to_string_lossy()
    );
    serde_json::from_str(&raw).unwrap()
}

fn build_core(
    dir: &tempfile::TempDir,
    llm: Arc<MockLlm>,
    browser: Arc<MockBrowser>,
    search: Arc<MockSearch>,
) -> ResearchCore {
    ResearchCore::builder(test_config(dir))
        .with_llm(llm)
        .with_browser(Arc::new(ArcMockBrowser(browser)))
        .with_search(search)
        .with_embeddings(Arc::new(EmbeddingService::hashed(64)))
        .build()
        .unwrap()
}

fn forum_site() -> MockSite {
    MockSite::normal(
        "Hamster Forum",
        "Thread: Syrian hamster breeders in California? 12 replies. Posted by hamfan. \
         Ethical breeders usually charge $20-$40.",
    )
}

/// Scripts shared by the commerce scenarios.
fn script_commerce(llm: &MockLlm) {
    llm.script_always(
        LlmRole::RelevanceScanner,
        r#"{"relevance_score": 0.8, "reason": "on topic"}"#,
    );
    llm.script_always(
        LlmRole::ExtractionValidator,
        r#"{"is_valid": true, "confidence": 0.8, "cleaned_data": null, "summary": "Breeders discussed with price points.", "key_points": ["$20-$40 typical"]}"#,
    );
    llm.script_always(
        LlmRole::Synthesizer,
        r#"{"specs_discovered": {"breed": {"value": "syrian", "confidence": 0.9, "source_url": "https://forum.example/t/1"}},
            "retailers": {"hamstery.example": {"relevance": 0.9, "reasons": ["recommended on forum"]}},
            "price_range": {"min": 20, "max": 40},
            "forum_recommendations": ["buy from ethical breeders"],
            "user_insights": [], "hard_requirements": ["must be syrian breed"],
            "acceptable_alternatives": ["golden hamster"], "deal_breakers": ["dwarf"]}"#,
    );
    llm.script_always(
        LlmRole::RequirementsReasoner,
        r#"{"category": "hamster", "must_be": ["live syrian hamster"],
            "wrong_category": ["cage", "food"], "excluded_terms": ["plush", "toy"],
            "budget": {"min": null, "max": 40},
            "required_specs": {}, "acceptable_alternatives": {"breed": ["golden hamster", "syrian"]},
            "deal_breakers": ["dwarf"], "relaxation_tiers": [],
            "optimized_query": "syrian hamster breeder california buy"}"#,
    );
    llm.script_always(
        LlmRole::NavigationDecider,
        r#"{"action": "extract", "reason": "product listing visible", "extraction_hints": {"content_type": "product_listing"}}"#,
    );
    // General (non-schema) vendor extraction and phase-1 page reading both
    // run through the page-reader role.
    llm.script_always(
        LlmRole::PageReader,
        r#"{"products": [
            {"title": "Syrian hamster, golden", "price": 35, "url": "/hamsters/golden", "specs": {}, "description": "hand-tamed syrian"},
            {"title": "Syrian hamster, long-haired", "price": 55, "url": "/hamsters/longhair", "specs": {}, "description": "show quality"}
        ]}"#,
    );
}

fn commerce_world() -> (Arc<MockBrowser>, Arc<MockSearch>) {
    let browser = Arc::new(MockBrowser::new());
    browser.add_site("https://forum.example/t/1", forum_site());
    let mut vendor = MockSite::normal("California Hamstery", "Syrian hamsters for sale");
    vendor.price_count = 5;
    browser.add_site("https://hamstery.example/", vendor);

    let search = Arc::new(MockSearch::with_results(vec![
        serp(
            "https://forum.example/t/1",
            "Syrian hamster breeders in California? — Hamster Forum",
            "Ethical breeders usually charge $20-$40",
        ),
        serp(
            "https://hamstery.example/",
            "California Hamstery — Syrian hamsters",
            "Registered syrian hamster breeder",
        ),
    ]));
    (browser, search)
}

#[tokio::test]
async fn commerce_cache_miss_runs_both_phases() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlm::new());
    script_commerce(&llm);
    let (browser, search) = commerce_world();
    let core = build_core(&dir, llm, browser, search.clone());

    let request = ResearchRequest::new(
        "Find Syrian hamster breeders in California under $40",
        "sess-commerce",
        Intent::Commerce,
    );
    let result = core.research(&request).await.unwrap();

    assert_eq!(result.strategy_used, PhasePlan::Phase1AndPhase2);
    assert!(search.call_count() >= 1, "at least one engine search");
    assert!(result.stats.vendors_visited >= 1, "at least one vendor visited");
    assert!(!result.findings.is_empty());
    for finding in &result.findings {
        assert!(
            finding.price.unwrap_or(0.0) <= 40.0,
            "budget filter violated: {:?}",
            finding
        );
        assert_eq!(
            finding.vendor,
            forage::types::normalize_host(&finding.url),
            "vendor must equal the URL host"
        );
    }
    // The over-budget product landed in the rejected list, not the findings.
    assert!(result
        .rejected_findings
        .iter()
        .any(|f| f.price == Some(55.0)));
    assert!(!result.stats.cache_hit);
    assert!(result.intelligence.is_some());
}

#[tokio::test]
async fn second_identical_call_is_served_from_cache() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlm::new());
    script_commerce(&llm);
    let (browser, search) = commerce_world();
    let core = build_core(&dir, llm, browser, search.clone());

    let request = ResearchRequest::new(
        "Find Syrian hamster breeders in California under $40",
        "sess-cached",
        Intent::Commerce,
    );
    let first = core.research(&request).await.unwrap();
    assert!(!first.stats.cache_hit);
    let searches_after_first = search.call_count();

    let second = core.research(&request).await.unwrap();
    assert!(second.stats.cache_hit);
    assert_eq!(second.findings.len(), first.findings.len());
    // No new outbound work for the cached call.
    assert_eq!(search.call_count(), searches_after_first);
}

#[tokio::test]
async fn preference_change_between_calls_still_hits_cache() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlm::new());
    script_commerce(&llm);
    let (browser, search) = commerce_world();
    let core = build_core(&dir, llm, browser, search);

    let mut first_request =
        ResearchRequest::new("find some for me", "sess-prefs", Intent::Commerce);
    first_request
        .constraints
        .insert("budget".to_string(), "$40".to_string());
    let first = core.research(&first_request).await.unwrap();
    assert!(!first.stats.cache_hit);

    // Identical call except the budget preference changed: the fingerprint
    // is a pure function of (session, intent) so this must hit.
    let mut second_request =
        ResearchRequest::new("find some for me", "sess-prefs", Intent::Commerce);
    second_request
        .constraints
        .insert("budget".to_string(), "$60".to_string());
    let second = core.research(&second_request).await.unwrap();
    assert!(second.stats.cache_hit);
}

#[tokio::test]
async fn informational_query_stays_phase1_only() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlm::new());
    llm.script_always(
        LlmRole::RelevanceScanner,
        r#"{"relevance_score": 0.9, "reason": "directly answers the question"}"#,
    );
    llm.script_always(
        LlmRole::PageReader,
        r#"{"topic": "syrian hamster size", "recommendations": [], "warnings": [], "consensus": "6-7 inches", "mentioned_vendors": []}"#,
    );
    llm.script_always(
        LlmRole::ExtractionValidator,
        r#"{"is_valid": true, "confidence": 0.85, "cleaned_data": null, "summary": "Adults reach about 6 inches and 150 grams.", "key_points": ["6 inches"]}"#,
    );
    // Phase selector deliberately wrong: even if the model asks for
    // phase2, the intent override must clamp to phase1_only.
    llm.script_always(
        LlmRole::PhaseSelector,
        r#"{"phases": "phase1_and_phase2", "max_sources_phase1": 5, "max_sources_phase2": 5, "reason": "model overreach", "confidence": 0.9}"#,
    );

    let browser = Arc::new(MockBrowser::new());
    browser.add_site(
        "https://hamstercare.example/size",
        MockSite::normal("How big do Syrian hamsters get?", "Adults reach 6 inches."),
    );
    let search = Arc::new(MockSearch::with_results(vec![serp(
        "https://hamstercare.example/size",
        "How big do Syrian hamsters get?",
        "size guide",
    )]));
    let core = build_core(&dir, llm, browser, search);

    let request = ResearchRequest::new(
        "How big do Syrian hamsters get?",
        "sess-info",
        Intent::Informational,
    );
    let result = core.research(&request).await.unwrap();

    assert_eq!(result.strategy_used, PhasePlan::Phase1Only);
    assert_eq!(result.stats.vendors_visited, 0);
    // Findings are synthesized from sources so the shape stays uniform.
    assert!(!result.findings.is_empty());
    assert!(result.findings.iter().all(|f| f.price.is_none()));
    // No vendor registry mutations on an informational run.
    assert!(core.vendors.get_all().is_empty());
}

#[tokio::test]
async fn empty_serp_returns_valid_empty_result() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlm::new());
    let browser = Arc::new(MockBrowser::new());
    let search = Arc::new(MockSearch::new()); // always returns zero entries
    let core = build_core(&dir, llm, browser, search);

    let request = ResearchRequest::new("anything at all", "sess-empty", Intent::Informational);
    let result = core.research(&request).await.unwrap();

    assert!(result.findings.is_empty());
    assert_eq!(result.stats.sources_visited, 0);
}

#[tokio::test]
async fn zero_healthy_engines_surfaces_blocked() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlm::new());
    let browser = Arc::new(MockBrowser::new());
    let search = Arc::new(MockSearch::new());
    search.set_blocked(true);
    let core = build_core(&dir, llm, browser, search);

    let request = ResearchRequest::new("blocked query", "sess-blocked", Intent::Informational);
    let err = core.research(&request).await.unwrap_err();
    assert!(matches!(err, ResearchError::Blocked { .. }), "got {:?}", err);
}

#[tokio::test]
async fn deep_mode_stops_on_complete_decision() {
    let dir = tempfile::tempdir().unwrap();
    let llm = Arc::new(MockLlm::new());
    llm.script_always(
        LlmRole::RelevanceScanner,
        r#"{"relevance_score": 0.8, "reason": "ok"}"#,
    );
    llm.script_always(LlmRole::PageReader, r#"{"summary": "facts", "facts": [], "links_of_interest": []}"#);
    llm.script_always(
        LlmRole::ExtractionValidator,
        r#"{"is_valid": true, "confidence": 0.7, "cleaned_data": null, "summary": "useful", "key_points": []}"#,
    );
    // CONTINUE on passes 1-3, COMPLETE on pass 4.
    for _ in 0..3 {
        llm.script(
            LlmRole::SatisfactionEvaluator,
            r#"{"decision": "CONTINUE", "criteria": {"coverage": {"met": false}, "quality": {"met": true}, "completeness": {"met": false}, "contradictions": {"met": true}}, "missing": ["more sources"]}"#,
        );
    }
    llm.script(
        LlmRole::SatisfactionEvaluator,
        r#"{"decision": "COMPLETE", "criteria": {"coverage": {"met": true}, "quality": {"met": true}, "completeness": {"met": true}, "contradictions": {"met": true}}, "missing": []}"#,
    );

    let browser = Arc::new(MockBrowser::new());
    browser.add_site(
        "https://source.example/a",
        MockSite::normal("Source", "facts about the topic"),
    );
    let search = Arc::new(MockSearch::with_results(vec![serp(
        "https://source.example/a",
        "Source",
        "facts",
    )]));
    let core = build_core(&dir, llm.clone(), browser, search);

    let mut request = ResearchRequest::new("deep topic", "sess-deep", Intent::Informational);
    request.mode = ResearchMode::Deep;
    let result = core.research(&request).await.unwrap();

    assert_eq!(result.passes, 4, "exactly four passes before COMPLETE");
    assert_eq!(result.stats.passes_executed, 4);
    assert_eq!(llm.calls_for(LlmRole::SatisfactionEvaluator), 4);
}

#[tokio::test]
async fn deep_mode_with_single_pass_behaves_like_standard() {
    let dir = tempfile::tempdir().unwrap();

    let make_request = |session: &str, mode| {
        let mut r = ResearchRequest::new("single pass topic", session, Intent::Informational);
        r.mode = mode;
        r
    };

    let run = |session: String, mode| {
        let dir_path = dir.path().to_path_buf();
        async move {
            let llm = Arc::new(MockLlm::new());
            // Evaluator always says CONTINUE; the pass cap must still stop
            // deep mode after one pass.
            llm.script_always(
                LlmRole::SatisfactionEvaluator,
                r#"{"decision": "CONTINUE", "criteria": {"coverage": {"met": false}, "quality": {"met": false}, "completeness": {"met": false}, "contradictions": {"met": true}}, "missing": []}"#,
            );
            let browser = Arc::new(MockBrowser::new());
            let search = Arc::new(MockSearch::new());
            let raw = format!(
                r#"{{"state_dir": {:?}, "research": {{"fetch_settle_ms": 0, "max_passes": 1}}, "cache": {{"enabled": false}}}}"#,
                dir_path.join(&session).to_string_lossy()
            );
            let config: CoreConfig = serde_json::from_str(&raw).unwrap();
            let core = ResearchCore::builder(config)
                .with_llm(llm)
                .with_browser(Arc::new(ArcMockBrowser(browser)))
                .with_search(search)
                .with_embeddings(Arc::new(EmbeddingService::hashed(64)))
                .build()
                .unwrap();
            core.research(&make_request(&session, mode)).await.unwrap()
        }
    };

    let deep = run("deep-1".to_string(), ResearchMode::Deep).await;
    let standard = run("std-1".to_string(), ResearchMode::Standard).await;

    assert_eq!(deep.stats.passes_executed, 1);
    assert_eq!(standard.stats.passes_executed, 1);
    assert_eq!(deep.strategy_used, standard.strategy_used);
    assert_eq!(deep.findings.len(), standard.findings.len());
}
