//! Navigator behavior against a scripted browser: the filter-preserving
//! guard, the mismatch→retry loop, and cycle detection.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use common::{MockBrowser, MockLlm, MockPage, MockSite};
use forage::browser::PageHandle;
use forage::core::types::PriceRange;
use forage::llm::LlmRole;
use forage::navigator::{
    ExtractedProduct, ExtractionCallback, GoalDirectedNavigator,
};
use forage::research::requirements::ProductRequirements;

/// Callback that returns a fixed product list and counts invocations.
struct FixedExtraction {
    products: Vec<ExtractedProduct>,
    calls: AtomicUsize,
}

impl FixedExtraction {
    fn new(products: Vec<ExtractedProduct>) -> Self {
        Self {
            products,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ExtractionCallback for FixedExtraction {
    async fn extract(
        &self,
        _page: &dyn PageHandle,
        _hints: &serde_json::Value,
    ) -> anyhow::Result<Vec<ExtractedProduct>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.products.clone())
    }
}

fn product(title: &str, price: f64) -> ExtractedProduct {
    ExtractedProduct {
        title: title.to_string(),
        price: Some(price),
        url: "/p/1".to_string(),
        specs: HashMap::new(),
        description: String::new(),
    }
}

fn gpu_requirements() -> ProductRequirements {
    ProductRequirements {
        category: "laptop".to_string(),
        query: "gaming laptop".to_string(),
        budget: PriceRange {
            min: None,
            max: Some(500.0),
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn guard_forces_extract_on_filtered_url() {
    // Scenario: search-results URL carrying maxPrice=500; the decision
    // suggests NAVIGATE to "Filters". The guard must fire and force EXTRACT
    // instead, preserving the applied filter.
    let browser = Arc::new(MockBrowser::new());
    let url = "https://shop.example.com/s?q=laptop&maxPrice=500";
    let mut site = MockSite::normal("Laptops under $500", "many laptops listed");
    site.price_count = 12;
    site.links = vec![
        ("Filters".to_string(), "https://shop.example.com/filters".to_string()),
        ("Home".to_string(), "https://shop.example.com/".to_string()),
    ];
    browser.add_site(url, site);

    let llm = Arc::new(MockLlm::new());
    llm.script_always(
        LlmRole::NavigationDecider,
        r#"{"action": "navigate", "reason": "open filter panel", "target": "Filters"}"#,
    );

    let navigator = GoalDirectedNavigator::new(llm.clone(), 5);
    let extraction = FixedExtraction::new(vec![
        product("Budget gaming laptop", 450.0),
        product("Entry laptop", 499.0),
    ]);
    let requirements = gpu_requirements();
    let page = MockPage::at(browser, url);

    let result = navigator
        .find_and_extract(
            &page,
            "gaming laptops under $500",
            &extraction,
            Some(&requirements),
            &CancellationToken::new(),
        )
        .await;

    assert!(result.success, "guard extraction should validate: {}", result.validation_notes);
    assert_eq!(extraction.calls.load(Ordering::SeqCst), 1);
    // Never left the filtered URL.
    assert_eq!(page.current_url().await, url);
    assert_eq!(result.navigation_path, vec![url.to_string()]);
    // Every extracted product respects the preserved filter.
    assert!(result.products.iter().all(|p| p.price.unwrap_or(0.0) <= 500.0));
}

#[tokio::test]
async fn mismatch_retries_through_navigation() {
    // Homepage extraction yields accessories; requirements reject them; the
    // retry decision navigates to the category page where extraction
    // matches.
    let browser = Arc::new(MockBrowser::new());
    let home = "https://critters.example/";
    let category = "https://critters.example/hamsters";

    let mut home_site = MockSite::normal("Critter Supplies", "featured products");
    home_site.price_count = 6;
    home_site.links = vec![("Hamsters".to_string(), category.to_string())];
    browser.add_site(home, home_site);

    let mut category_site = MockSite::normal("Hamsters", "live hamsters for sale");
    category_site.price_count = 4;
    browser.add_site(category, category_site);

    let llm = Arc::new(MockLlm::new());
    llm.script_always(
        LlmRole::NavigationDecider,
        r#"{"action": "extract", "reason": "products visible", "extraction_hints": {"content_type": "product_listing"}}"#,
    );
    llm.script_always(
        LlmRole::RetryDecider,
        r#"{"action": "navigate", "reason": "hamster category exists", "target": "Hamsters"}"#,
    );

    // First extraction: wrong items. Second: hamsters.
    struct TwoPhase {
        calls: AtomicUsize,
    }
    #[async_trait::async_trait]
    impl ExtractionCallback for TwoPhase {
        async fn extract(
            &self,
            _page: &dyn PageHandle,
            _hints: &serde_json::Value,
        ) -> anyhow::Result<Vec<ExtractedProduct>> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(vec![product("Water bottle", 8.0), product("Food dish", 5.0)])
            } else {
                Ok(vec![product("Syrian hamster", 35.0)])
            }
        }
    }

    let requirements = ProductRequirements {
        category: "hamster".to_string(),
        query: "syrian hamster".to_string(),
        ..Default::default()
    };
    let navigator = GoalDirectedNavigator::new(llm, 5);
    let extraction = TwoPhase {
        calls: AtomicUsize::new(0),
    };
    let page = MockPage::at(browser, home);

    let result = navigator
        .find_and_extract(
            &page,
            "syrian hamsters for sale",
            &extraction,
            Some(&requirements),
            &CancellationToken::new(),
        )
        .await;

    assert!(result.success);
    assert_eq!(result.products.len(), 1);
    assert_eq!(result.products[0].title, "Syrian hamster");
    assert_eq!(page.current_url().await, category);
    assert!(result.navigation_path.contains(&home.to_string()));
    assert!(result.steps_taken >= 2);
}

#[tokio::test]
async fn cycle_detection_stops_revisits() {
    // The decider keeps navigating to a link that lands on the same URL
    // (query params differ); the navigator must terminate via its visited
    // set rather than burning all steps.
    let browser = Arc::new(MockBrowser::new());
    let url = "https://loop.example/list";
    let mut site = MockSite::normal("Looping list", "same page forever");
    site.links = vec![("Next".to_string(), "https://loop.example/list?page=2".to_string())];
    browser.add_site(url, site.clone());
    browser.add_site("https://loop.example/list?page=2", site);

    let llm = Arc::new(MockLlm::new());
    llm.script_always(
        LlmRole::NavigationDecider,
        r#"{"action": "navigate", "reason": "keep paging", "target": "Next"}"#,
    );

    let navigator = GoalDirectedNavigator::new(llm, 5);
    let extraction = FixedExtraction::new(Vec::new());
    let page = MockPage::at(browser, url);

    let result = navigator
        .find_and_extract(
            &page,
            "anything",
            &extraction,
            None,
            &CancellationToken::new(),
        )
        .await;

    assert!(!result.success);
    // Terminated by the revisit check, not by exhausting max_steps worth of
    // distinct pages.
    assert!(result.navigation_path.len() <= 2);
}

#[tokio::test]
async fn give_up_terminates_immediately() {
    let browser = Arc::new(MockBrowser::new());
    browser.add_site(
        "https://nothing.example/",
        MockSite::normal("Unrelated", "no products here"),
    );

    let llm = Arc::new(MockLlm::new());
    llm.script_always(
        LlmRole::NavigationDecider,
        r#"{"action": "give_up", "reason": "site has no relevant content"}"#,
    );

    let navigator = GoalDirectedNavigator::new(llm.clone(), 5);
    let extraction = FixedExtraction::new(Vec::new());
    let page = MockPage::at(browser, "https://nothing.example/");

    let result = navigator
        .find_and_extract(
            &page,
            "syrian hamsters",
            &extraction,
            None,
            &CancellationToken::new(),
        )
        .await;

    assert!(!result.success);
    assert!(result.products.is_empty());
    assert_eq!(extraction.calls.load(Ordering::SeqCst), 0);
    assert_eq!(llm.calls_for(LlmRole::NavigationDecider), 1);
}

#[tokio::test]
async fn cancellation_returns_partial_immediately() {
    let browser = Arc::new(MockBrowser::new());
    browser.add_site("https://x.example/", MockSite::normal("X", "y"));

    let llm = Arc::new(MockLlm::new());
    let navigator = GoalDirectedNavigator::new(llm, 5);
    let extraction = FixedExtraction::new(Vec::new());
    let page = MockPage::at(browser, "https://x.example/");

    let token = CancellationToken::new();
    token.cancel();
    let result = navigator
        .find_and_extract(&page, "goal", &extraction, None, &token)
        .await;

    assert!(!result.success);
    assert_eq!(result.validation_notes, "cancelled");
    assert_eq!(result.steps_taken, 0);
}
