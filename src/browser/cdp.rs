//! chromiumoxide-backed implementation of the browser capability.
//!
//! One shared headless browser process, lazily launched; each `new_page`
//! opens a fresh tab, installs the stealth patch set, and applies the
//! requested user agent before the caller navigates anywhere.

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::Browser;
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::{BrowserCapability, PageHandle, PageOptions};

// ── Browser executable discovery ─────────────────────────────────────────────

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. `CHROME_EXECUTABLE` env var.
/// 2. PATH scan (package-manager installs on all platforms).
/// 3. OS-specific well-known install paths.
pub fn find_chrome_executable() -> Option<String> {
    if let Some(p) = crate::core::config::chrome_executable_override() {
        return Some(p);
    }

    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = [
            "brave-browser",
            "brave",
            "google-chrome",
            "chromium",
            "chromium-browser",
            "chrome",
        ];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/brave-browser",
            "/usr/bin/brave",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/bin/google-chrome",
            "/usr/local/bin/chromium",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\BraveSoftware\Brave-Browser\Application\brave.exe",
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

pub fn native_browser_available() -> bool {
    find_chrome_executable().is_some()
}

/// Headless config tuned for containers and stealth: no GPU, no telemetry,
/// shared-memory hints, no first-run chrome.
fn build_headless_config(exe: &str, width: u32, height: u32) -> Result<BrowserConfig> {
    BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width,
            height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(width, height)
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage")
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--disable-sync")
        .arg("--disable-translate")
        .arg("--disable-crash-reporter")
        .arg("--disable-breakpad")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--hide-scrollbars")
        .arg("--mute-audio")
        .build()
        .map_err(|e| anyhow!("Failed to build browser config: {}", e))
}

// ── Shared browser + page handles ────────────────────────────────────────────

pub struct CdpBrowser {
    inner: Mutex<Option<Arc<Browser>>>,
}

impl CdpBrowser {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    async fn browser(&self) -> Result<Arc<Browser>> {
        let mut guard = self.inner.lock().await;
        if let Some(b) = guard.as_ref() {
            return Ok(b.clone());
        }

        let exe = find_chrome_executable().ok_or_else(|| {
            anyhow!(
                "No browser found. Install Brave, Chrome, or Chromium, or set CHROME_EXECUTABLE."
            )
        })?;
        info!("[Cdp] Launching headless browser: {}", exe);

        let config = build_headless_config(&exe, 1280, 900)?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| anyhow!("Failed to launch browser ({}): {}", exe, e))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("[Cdp] handler error: {}", e);
                }
            }
        });

        let browser = Arc::new(browser);
        *guard = Some(browser.clone());
        Ok(browser)
    }
}

impl Default for CdpBrowser {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BrowserCapability for CdpBrowser {
    async fn new_page(&self, opts: &PageOptions) -> Result<Box<dyn PageHandle>> {
        let browser = self.browser().await?;
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| anyhow!("Failed to create page: {}", e))?;

        // Stealth patches must be in place before the first navigation.
        for script in &opts.init_scripts {
            page.execute(
                chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams::new(
                    script.clone(),
                ),
            )
            .await
            .map_err(|e| anyhow!("Failed to inject init script: {}", e))?;
        }

        if let Some(ua) = &opts.user_agent {
            page.execute(
                chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams::new(
                    ua.clone(),
                ),
            )
            .await
            .map_err(|e| anyhow!("Failed to set user agent: {}", e))?;
        }

        debug!(
            "[Cdp] page ready ({} init scripts, ua override: {})",
            opts.init_scripts.len(),
            opts.user_agent.is_some()
        );
        Ok(Box::new(CdpPage { page }))
    }
}

struct CdpPage {
    page: chromiumoxide::Page,
}

#[async_trait::async_trait]
impl PageHandle for CdpPage {
    async fn goto(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .map(|_| ())
            .map_err(|e| anyhow!("Navigation to {} failed: {}", url, e))
    }

    async fn content(&self) -> Result<String> {
        self.page
            .content()
            .await
            .map_err(|e| anyhow!("Failed to get page content: {}", e))
    }

    async fn evaluate(&self, script: &str) -> Result<serde_json::Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .map_err(|e| anyhow!("Evaluate failed: {}", e))?;
        Ok(result
            .into_value::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null))
    }

    async fn current_url(&self) -> String {
        self.page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    async fn screenshot_b64(&self) -> Result<Option<String>> {
        let params = chromiumoxide::page::ScreenshotParams::builder().build();
        match self.page.screenshot(params).await {
            Ok(bytes) => Ok(Some(
                base64::engine::general_purpose::STANDARD.encode(bytes),
            )),
            Err(e) => {
                debug!("[Cdp] screenshot unavailable: {}", e);
                Ok(None)
            }
        }
    }

    async fn set_cookies(&self, cookies: &[serde_json::Value]) -> Result<()> {
        use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetCookiesParams};

        let cookie_params: Vec<CookieParam> = cookies
            .iter()
            .filter_map(|v| serde_json::from_value::<CookieParam>(v.clone()).ok())
            .collect();

        if cookie_params.is_empty() {
            return Ok(());
        }

        let count = cookie_params.len();
        self.page
            .execute(SetCookiesParams::new(cookie_params))
            .await
            .map(|_| ())
            .with_context(|| format!("Failed to inject {} cookies", count))
    }

    async fn get_cookies(&self) -> Result<Vec<serde_json::Value>> {
        let cookies = self
            .page
            .get_cookies()
            .await
            .map_err(|e| anyhow!("Failed to read cookies: {}", e))?;
        Ok(cookies
            .into_iter()
            .filter_map(|c| serde_json::to_value(c).ok())
            .collect())
    }

    async fn close(&self) {
        if let Err(e) = self.page.clone().close().await {
            debug!("[Cdp] page close error (non-fatal): {}", e);
        }
    }
}
