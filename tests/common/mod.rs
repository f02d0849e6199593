//! Shared test doubles: scripted LLM, scripted search, and a scripted
//! browser whose pages answer the perception / click / schema-extraction
//! scripts the production code evaluates.
#![allow(dead_code)]

use anyhow::{anyhow, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use forage::browser::{BrowserCapability, PageHandle, PageOptions};
use forage::core::error::ResearchError;
use forage::core::types::SerpEntry;
use forage::llm::{LlmInvoker, LlmRole};
use forage::search::SearchProvider;

// ───────────────────────────────────────────────────────────────────────────
// Scripted LLM
// ───────────────────────────────────────────────────────────────────────────

enum ScriptEntry {
    Queue(VecDeque<String>),
    Always(String),
}

/// Role-keyed scripted invoker. Unscripted roles error, which exercises the
/// production fallback paths (rule-based strategy, degraded readings).
#[derive(Default)]
pub struct MockLlm {
    scripts: Mutex<HashMap<&'static str, ScriptEntry>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one response for a role (consumed in order).
    pub fn script(&self, role: LlmRole, response: &str) {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts
            .entry(role.as_str())
            .or_insert_with(|| ScriptEntry::Queue(VecDeque::new()))
        {
            ScriptEntry::Queue(q) => q.push_back(response.to_string()),
            entry @ ScriptEntry::Always(_) => {
                let mut q = VecDeque::new();
                q.push_back(response.to_string());
                *entry = ScriptEntry::Queue(q);
            }
        }
    }

    /// Always answer a role with the same response.
    pub fn script_always(&self, role: LlmRole, response: &str) {
        self.scripts
            .lock()
            .unwrap()
            .insert(role.as_str(), ScriptEntry::Always(response.to_string()));
    }

    pub fn calls_for(&self, role: LlmRole) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r == role.as_str())
            .count()
    }
}

#[async_trait::async_trait]
impl LlmInvoker for MockLlm {
    async fn call(
        &self,
        prompt: &str,
        role: LlmRole,
        _max_tokens: u32,
        _temperature: f32,
    ) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((role.as_str().to_string(), prompt.to_string()));

        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(role.as_str()) {
            Some(ScriptEntry::Always(response)) => Ok(response.clone()),
            Some(ScriptEntry::Queue(q)) => q
                .pop_front()
                .ok_or_else(|| anyhow!("script queue exhausted for role {}", role.as_str())),
            None => Err(anyhow!("no script for role {}", role.as_str())),
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Scripted search
// ───────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockSearch {
    pub default_results: Mutex<Vec<SerpEntry>>,
    pub blocked: AtomicBool,
    pub calls: Mutex<Vec<String>>,
}

impl MockSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_results(results: Vec<SerpEntry>) -> Self {
        let search = Self::new();
        *search.default_results.lock().unwrap() = results;
        search
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl SearchProvider for MockSearch {
    async fn search(&self, query: &str) -> Result<Vec<SerpEntry>, ResearchError> {
        self.calls.lock().unwrap().push(query.to_string());
        if self.blocked.load(Ordering::SeqCst) {
            return Err(ResearchError::blocked(
                "all engines",
                forage::BlockKind::BotDetection,
            ));
        }
        Ok(self.default_results.lock().unwrap().clone())
    }
}

pub fn serp(url: &str, title: &str, snippet: &str) -> SerpEntry {
    SerpEntry {
        url: url.to_string(),
        title: title.to_string(),
        snippet: snippet.to_string(),
        engine: Some("mock".to_string()),
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Scripted browser
// ───────────────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct MockSite {
    pub html: String,
    pub title: String,
    /// (link text, absolute href)
    pub links: Vec<(String, String)>,
    pub price_count: usize,
    /// Products answered to schema-driven DOM extraction scripts.
    pub schema_products: Option<serde_json::Value>,
    /// When set, the site serves a CAPTCHA page until a cookie with this
    /// name is present.
    pub blocked_until_cookie: Option<String>,
}

impl MockSite {
    pub fn normal(title: &str, body: &str) -> Self {
        Self {
            html: format!(
                "<html><head><title>{}</title></head><body><h1>{}</h1><p>{}</p>{}</body></html>",
                title,
                title,
                body,
                // Bulk filler so blocker heuristics see a real-sized page.
                "<p>content filler</p>".repeat(300),
            ),
            title: title.to_string(),
            ..Default::default()
        }
    }
}

const CAPTCHA_HTML: &str = r#"<html><body>Please verify you are human <iframe src="https://challenges.cloudflare.com/x"></iframe></body></html>"#;

pub struct MockBrowser {
    sites: Mutex<HashMap<String, MockSite>>,
    pub pages_opened: AtomicUsize,
}

impl MockBrowser {
    pub fn new() -> Self {
        Self {
            sites: Mutex::new(HashMap::new()),
            pages_opened: AtomicUsize::new(0),
        }
    }

    pub fn add_site(&self, url: &str, site: MockSite) {
        self.sites.lock().unwrap().insert(url.to_string(), site);
    }

    fn site_for(&self, url: &str) -> MockSite {
        let sites = self.sites.lock().unwrap();
        if let Some(site) = sites.get(url) {
            return site.clone();
        }
        // Prefix match tolerates trailing slashes and query strings.
        let trimmed = url.trim_end_matches('/');
        for (key, site) in sites.iter() {
            if key.trim_end_matches('/') == trimmed || url.starts_with(key.as_str()) {
                return site.clone();
            }
        }
        MockSite::normal("Not Found", "nothing here")
    }
}

impl Default for MockBrowser {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MockPage {
    sites: Arc<MockBrowser>,
    current: Mutex<String>,
    cookies: Mutex<Vec<serde_json::Value>>,
}

impl MockPage {
    pub fn at(browser: Arc<MockBrowser>, url: &str) -> Self {
        Self {
            sites: browser,
            current: Mutex::new(url.to_string()),
            cookies: Mutex::new(Vec::new()),
        }
    }

    fn site(&self) -> MockSite {
        let url = self.current.lock().unwrap().clone();
        self.sites.site_for(&url)
    }

    fn is_blocked(&self, site: &MockSite) -> bool {
        match &site.blocked_until_cookie {
            Some(name) => !self
                .cookies
                .lock()
                .unwrap()
                .iter()
                .any(|c| c.get("name").and_then(|v| v.as_str()) == Some(name.as_str())),
            None => false,
        }
    }
}

#[async_trait::async_trait]
impl PageHandle for MockPage {
    async fn goto(&self, url: &str) -> Result<()> {
        *self.current.lock().unwrap() = url.to_string();
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        let site = self.site();
        if self.is_blocked(&site) {
            return Ok(CAPTCHA_HTML.to_string());
        }
        Ok(site.html)
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let site = self.site();
        let url = self.current.lock().unwrap().clone();
        let blocked = self.is_blocked(&site);

        // Perception script.
        if script.contains("navSelectors") {
            let nav_links: Vec<serde_json::Value> = if blocked {
                Vec::new()
            } else {
                site.links
                    .iter()
                    .map(|(text, href)| serde_json::json!({"text": text, "href": href}))
                    .collect()
            };
            return Ok(serde_json::json!({
                "url": url,
                "title": site.title,
                "main_heading": site.title,
                "nav_links": nav_links,
                "content_headings": [site.title],
                "price_count": if blocked { 0 } else { site.price_count },
                "has_cart": site.price_count > 0,
                "has_product_grid": site.schema_products.is_some(),
                "has_contact_form": false,
                "body_preview": if blocked { "verify you are human".to_string() } else { forage::llm::truncate(&site.html, 400) },
            }));
        }

        // Schema-driven extraction script.
        if script.contains("price_text") {
            return Ok(site
                .schema_products
                .clone()
                .unwrap_or_else(|| serde_json::json!([])));
        }

        // Click script: pull the embedded target string and follow a link.
        if script.contains("const target =") {
            let re = regex::Regex::new(r#"const target = ("(?:[^"\\]|\\.)*")"#).unwrap();
            let target: String = re
                .captures(script)
                .and_then(|c| serde_json::from_str(&c[1]).ok())
                .unwrap_or_default();
            let target_lower = target.to_lowercase();
            let hit = site.links.iter().find(|(text, _)| {
                let t = text.to_lowercase();
                t == target_lower || t.contains(&target_lower)
            });
            return match hit {
                Some((_, href)) => {
                    *self.current.lock().unwrap() = href.clone();
                    Ok(serde_json::json!(true))
                }
                None => Ok(serde_json::json!(false)),
            };
        }

        // Scroll and everything else.
        Ok(serde_json::Value::Null)
    }

    async fn current_url(&self) -> String {
        self.current.lock().unwrap().clone()
    }

    async fn screenshot_b64(&self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn set_cookies(&self, cookies: &[serde_json::Value]) -> Result<()> {
        self.cookies.lock().unwrap().extend(cookies.iter().cloned());
        Ok(())
    }

    async fn get_cookies(&self) -> Result<Vec<serde_json::Value>> {
        Ok(self.cookies.lock().unwrap().clone())
    }

    async fn close(&self) {}
}

/// `BrowserCapability` needs pages to reference the shared site map, so the
/// browser is used through this Arc wrapper.
pub struct ArcMockBrowser(pub Arc<MockBrowser>);

#[async_trait::async_trait]
impl BrowserCapability for ArcMockBrowser {
    async fn new_page(&self, _opts: &PageOptions) -> Result<Box<dyn PageHandle>> {
        self.0.pages_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockPage::at(self.0.clone(), "about:blank")))
    }
}
