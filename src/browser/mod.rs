//! Headless-browser capability.
//!
//! The core consumes browsers through the `BrowserCapability`/`PageHandle`
//! traits so the navigator, fetcher, and search warmup can be driven by a
//! real CDP browser in production and by scripted fakes in tests. The
//! default implementation lives in `cdp.rs` (chromiumoxide).

pub mod cdp;
pub mod fetcher;
pub mod intervention;
pub mod session_store;
pub mod stealth;

use anyhow::Result;

/// Options for opening a page: fingerprint + stealth patches. Stealth init
/// scripts must run before any page script on every navigation, so they are
/// installed at page creation, not after.
#[derive(Debug, Clone)]
pub struct PageOptions {
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
    pub init_scripts: Vec<String>,
    pub mobile: bool,
}

impl PageOptions {
    /// Anonymous one-shot page with the full stealth patch set.
    pub fn ephemeral() -> Self {
        Self {
            user_agent: None,
            viewport: (1280, 900),
            init_scripts: stealth::stealth_init_scripts(),
            mobile: false,
        }
    }

    /// Page bound to a reproducible per-(user, session) fingerprint.
    pub fn for_session(user_id: &str, session_id: &str) -> Self {
        let profile = stealth::FingerprintProfile::derive(user_id, session_id);
        Self {
            user_agent: Some(profile.user_agent.clone()),
            viewport: (profile.viewport_width, profile.viewport_height),
            init_scripts: stealth::stealth_init_scripts(),
            mobile: false,
        }
    }

    /// Mobile Safari profile, used as a vendor recovery strategy.
    pub fn mobile() -> Self {
        Self {
            user_agent: Some(stealth::MOBILE_USER_AGENT.to_string()),
            viewport: (390, 844),
            init_scripts: stealth::stealth_init_scripts(),
            mobile: true,
        }
    }
}

/// A live page. All methods are suspension points.
#[async_trait::async_trait]
pub trait PageHandle: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;
    async fn content(&self) -> Result<String>;
    /// Evaluate JS in the page, returning the JSON-serialized result.
    async fn evaluate(&self, script: &str) -> Result<serde_json::Value>;
    async fn current_url(&self) -> String;
    /// Base64 JPEG screenshot; `None` when the backend cannot capture.
    async fn screenshot_b64(&self) -> Result<Option<String>>;
    async fn set_cookies(&self, cookies: &[serde_json::Value]) -> Result<()>;
    async fn get_cookies(&self) -> Result<Vec<serde_json::Value>>;
    /// Close must always be called on task exit; unclosed pages on
    /// cancellation are torn down by the pool owner.
    async fn close(&self);
}

#[async_trait::async_trait]
pub trait BrowserCapability: Send + Sync {
    async fn new_page(&self, opts: &PageOptions) -> Result<Box<dyn PageHandle>>;
}
