//! Page fetcher with blocker detection and human-assist recovery.
//!
//! Pipeline per fetch: open a stealth page under the session's fingerprint →
//! inject stored cookies for the domain → navigate with a bounded timeout →
//! classify blockers from the rendered content → either hand the live page
//! to the caller, or (confident block + human assist enabled) park on an
//! intervention and retry once with the resolver's cookies. After any
//! successful fetch the page's cookie jar is persisted for the session.

use aho_corasick::AhoCorasick;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::intervention::{InterventionSink, PendingIntervention};
use super::session_store::SessionStore;
use super::{BrowserCapability, PageHandle, PageOptions};
use crate::core::error::{BlockKind, ResearchError};
use crate::core::events::{emit, EventSink};
use crate::core::types::normalize_host;

/// A fetched page the caller now owns; `page` must be closed by the caller.
pub struct FetchedPage {
    pub page: Box<dyn PageHandle>,
    pub html: String,
    pub final_url: String,
}

pub enum FetchOutcome {
    Success(FetchedPage),
    Blocked { kind: BlockKind, confidence: f64 },
}

#[derive(Clone)]
pub struct FetcherPolicy {
    pub fetch_timeout: Duration,
    pub intervention_timeout: Duration,
    pub blocker_confidence_threshold: f64,
    pub human_assist: bool,
    /// Post-navigation settle wait before capturing content.
    pub settle: Duration,
}

impl Default for FetcherPolicy {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(30),
            intervention_timeout: Duration::from_secs(120),
            blocker_confidence_threshold: 0.6,
            human_assist: true,
            settle: Duration::from_millis(1500),
        }
    }
}

pub struct PageFetcher {
    browser: Arc<dyn BrowserCapability>,
    sessions: Arc<SessionStore>,
    intervention: Option<Arc<dyn InterventionSink>>,
    events: Option<Arc<dyn EventSink>>,
    policy: FetcherPolicy,
}

impl PageFetcher {
    pub fn new(
        browser: Arc<dyn BrowserCapability>,
        sessions: Arc<SessionStore>,
        intervention: Option<Arc<dyn InterventionSink>>,
        events: Option<Arc<dyn EventSink>>,
        policy: FetcherPolicy,
    ) -> Self {
        Self {
            browser,
            sessions,
            intervention,
            events,
            policy,
        }
    }

    /// Fetch `url` inside the `(session_id, domain)` browsing context.
    pub async fn fetch(
        &self,
        url: &str,
        session_id: &str,
    ) -> Result<FetchOutcome, ResearchError> {
        self.fetch_with_options(url, session_id, PageOptions::for_session(session_id, &normalize_host(url)))
            .await
    }

    /// Fetch with explicit page options (mobile-viewport recovery etc.).
    pub async fn fetch_with_options(
        &self,
        url: &str,
        session_id: &str,
        opts: PageOptions,
    ) -> Result<FetchOutcome, ResearchError> {
        let page = self
            .browser
            .new_page(&opts)
            .await
            .map_err(|e| ResearchError::Browser(e.to_string()))?;

        let injected = self.sessions.auto_inject(session_id, page.as_ref(), url).await;
        if injected {
            debug!("[Fetcher] stored cookies injected for {}", url);
        }

        match self.navigate_and_classify(page.as_ref(), url).await {
            Ok((html, final_url, None)) => {
                self.persist(session_id, page.as_ref(), url).await;
                Ok(FetchOutcome::Success(FetchedPage { page, html, final_url }))
            }
            Ok((html, final_url, Some((kind, confidence)))) => {
                self.handle_block(page, url, session_id, html, final_url, kind, confidence)
                    .await
            }
            Err(e) => {
                page.close().await;
                Err(e)
            }
        }
    }

    async fn navigate_and_classify(
        &self,
        page: &dyn PageHandle,
        url: &str,
    ) -> Result<(String, String, Option<(BlockKind, f64)>), ResearchError> {
        let nav = tokio::time::timeout(self.policy.fetch_timeout, page.goto(url)).await;
        match nav {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(ResearchError::Browser(e.to_string())),
            Err(_) => {
                return Err(ResearchError::timeout(
                    format!("fetch {}", url),
                    self.policy.fetch_timeout.as_millis() as u64,
                ))
            }
        }

        tokio::time::sleep(self.policy.settle).await;

        let html = page
            .content()
            .await
            .map_err(|e| ResearchError::Browser(e.to_string()))?;
        let final_url = page.current_url().await;
        let block = classify_blockers(&html, url, &final_url);
        Ok((html, final_url, block))
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_block(
        &self,
        page: Box<dyn PageHandle>,
        url: &str,
        session_id: &str,
        _html: String,
        _final_url: String,
        kind: BlockKind,
        confidence: f64,
    ) -> Result<FetchOutcome, ResearchError> {
        warn!(
            "[Fetcher] {} blocked: {} (confidence {:.2})",
            url, kind, confidence
        );

        let assist_possible =
            self.policy.human_assist && confidence >= self.policy.blocker_confidence_threshold;

        let Some(sink) = self.intervention.as_ref().filter(|_| assist_possible) else {
            page.close().await;
            return Ok(FetchOutcome::Blocked { kind, confidence });
        };
        let screenshot = page.screenshot_b64().await.unwrap_or(None);
        let pending = PendingIntervention {
            id: uuid::Uuid::new_v4().to_string(),
            blocker_type: kind,
            url: url.to_string(),
            session_id: session_id.to_string(),
            screenshot_b64: screenshot,
            details: format!("confidence {:.2}", confidence),
        };
        emit(
            &self.events,
            "intervention_requested",
            serde_json::json!({"id": pending.id.as_str(), "url": url, "blocker": kind.as_str()}),
        );

        let handle = match sink.request_intervention(pending).await {
            Ok(h) => h,
            Err(e) => {
                warn!("[Fetcher] intervention sink refused: {}", e);
                page.close().await;
                return Ok(FetchOutcome::Blocked { kind, confidence });
            }
        };
        let id = handle.id.clone();

        let Some(resolution) = handle
            .wait_for_resolution(self.policy.intervention_timeout)
            .await
        else {
            emit(&self.events, "intervention_timeout", serde_json::json!({"id": id}));
            page.close().await;
            return Ok(FetchOutcome::Blocked { kind, confidence });
        };

        emit(
            &self.events,
            "intervention_resolved",
            serde_json::json!({"id": id, "cookies": resolution.cookies.len()}),
        );

        if !resolution.cookies.is_empty() {
            if let Err(e) = page.set_cookies(&resolution.cookies).await {
                warn!("[Fetcher] resolver cookie injection failed: {}", e);
            } else {
                // Persist immediately so the session survives even if the
                // retry navigation fails.
                let _ = self.sessions.save(session_id, url, &resolution.cookies);
            }
        }

        // Retry once with the resolved state.
        match self.navigate_and_classify(page.as_ref(), url).await {
            Ok((html, final_url, None)) => {
                info!("[Fetcher] intervention recovered {}", url);
                self.persist(session_id, page.as_ref(), url).await;
                Ok(FetchOutcome::Success(FetchedPage { page, html, final_url }))
            }
            Ok((_, _, Some((kind, confidence)))) => {
                warn!("[Fetcher] still blocked after intervention: {}", kind);
                page.close().await;
                Ok(FetchOutcome::Blocked { kind, confidence })
            }
            Err(e) => {
                page.close().await;
                Err(e)
            }
        }
    }

    async fn persist(&self, session_id: &str, page: &dyn PageHandle, url: &str) {
        if let Err(e) = self.sessions.persist_from_page(session_id, page, url).await {
            debug!("[Fetcher] cookie persistence failed (non-fatal): {}", e);
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Blocker classification
// ───────────────────────────────────────────────────────────────────────────

const CAPTCHA_MARKERS: &[&str] = &[
    "challenges.cloudflare.com",
    "hcaptcha.com",
    "recaptcha",
    "g-recaptcha",
    "verify you are human",
    "solve this puzzle",
    "press and hold",
];

const BOT_MARKERS: &[&str] = &[
    "unusual traffic",
    "automated queries",
    "detected automated",
    "perimeterx",
    "datadome",
    "are you a robot",
    "bot detection",
];

const SOFT_MARKERS: &[&str] = &[
    "access denied",
    "request blocked",
    "temporarily unavailable",
    "enable javascript and cookies",
];

/// Classify a rendered page into the blocker taxonomy. Confidence grows with
/// marker count and shrinking page size (real block pages are small).
pub fn classify_blockers(html: &str, requested_url: &str, final_url: &str) -> Option<(BlockKind, f64)> {
    let lower = html.to_lowercase();

    let count = |needles: &[&str]| -> usize {
        let ac = AhoCorasick::new(needles).expect("static marker set");
        ac.find_iter(&lower).count()
    };

    let size_factor = if html.len() < 4_000 {
        0.3
    } else if html.len() < 20_000 {
        0.1
    } else {
        0.0
    };

    if lower.contains("418 i'm a teapot") || lower.contains("error 418") {
        return Some((BlockKind::Http418, 0.95));
    }
    if lower.contains("403 forbidden") || lower.contains("error 403") {
        return Some((BlockKind::Http403, 0.9));
    }

    let captcha_hits = count(CAPTCHA_MARKERS);
    if captcha_hits > 0 {
        let conf = (0.6 + 0.15 * captcha_hits as f64 + size_factor).min(1.0);
        return Some((BlockKind::Captcha, conf));
    }

    let bot_hits = count(BOT_MARKERS);
    if bot_hits > 0 {
        let conf = (0.55 + 0.15 * bot_hits as f64 + size_factor).min(1.0);
        return Some((BlockKind::BotDetection, conf));
    }

    // A cross-domain redirect away from the requested host is a block signal
    // on vendor sites (interstitials, geo-walls).
    if !final_url.is_empty() {
        let requested_host = normalize_host(requested_url);
        let final_host = normalize_host(final_url);
        if !requested_host.is_empty()
            && !final_host.is_empty()
            && requested_host != final_host
            && !final_host.ends_with(&requested_host)
            && !requested_host.ends_with(&final_host)
        {
            return Some((BlockKind::RedirectBlock, 0.65));
        }
    }

    let soft_hits = count(SOFT_MARKERS);
    if soft_hits > 0 && html.len() < 20_000 {
        return Some((BlockKind::SoftBlock, (0.4 + 0.2 * soft_hits as f64).min(0.9)));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captcha_page_classified_with_high_confidence() {
        let html = "<html>please verify you are human <iframe src=\"https://challenges.cloudflare.com/x\"></iframe></html>";
        let (kind, conf) = classify_blockers(html, "https://v.example/", "https://v.example/").unwrap();
        assert_eq!(kind, BlockKind::Captcha);
        assert!(conf >= 0.6);
    }

    #[test]
    fn bot_detection_phrases() {
        let html = "<html>Our systems have detected unusual traffic from your computer network</html>";
        let (kind, _) = classify_blockers(html, "https://v.example/", "https://v.example/").unwrap();
        assert_eq!(kind, BlockKind::BotDetection);
    }

    #[test]
    fn cross_domain_redirect_is_redirect_block() {
        let html = format!("<html>{}</html>", "content ".repeat(5000));
        let out = classify_blockers(&html, "https://vendor.example/", "https://geo.wall.test/stop");
        assert!(matches!(out, Some((BlockKind::RedirectBlock, _))));
    }

    #[test]
    fn subdomain_redirect_is_not_a_block() {
        let html = format!("<html>{}</html>", "content ".repeat(5000));
        let out = classify_blockers(
            &html,
            "https://vendor.example.com/",
            "https://www.vendor.example.com/home",
        );
        assert!(out.is_none());
    }

    #[test]
    fn large_normal_page_passes() {
        let html = format!("<html><body>{}</body></html>", "products and prices ".repeat(2000));
        assert!(classify_blockers(&html, "https://v.example/", "https://v.example/p").is_none());
    }

    #[test]
    fn soft_block_needs_small_page() {
        let html = "<html>Access denied</html>";
        let out = classify_blockers(html, "https://v.example/", "https://v.example/");
        assert!(matches!(out, Some((BlockKind::SoftBlock, _))));

        let big = format!("<html>Access denied {}</html>", "filler ".repeat(10_000));
        assert!(classify_blockers(&big, "https://v.example/", "https://v.example/").is_none());
    }
}
