pub mod bing;
pub mod brave;
pub mod duckduckgo;
pub mod google;

use anyhow::Result;
use reqwest::StatusCode;

#[derive(Debug)]
pub enum EngineError {
    Blocked { reason: String },
    Transient(String),
    Fatal(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Blocked { reason } => write!(f, "blocked: {}", reason),
            EngineError::Transient(e) => write!(f, "transient: {}", e),
            EngineError::Fatal(e) => write!(f, "fatal: {}", e),
        }
    }
}

impl std::error::Error for EngineError {}

/// Detect an anti-bot block from a SERP response. Engines signal blocks in
/// three ways: status codes (418 is Google's "teapot" rate limit), known
/// phrases, and suspiciously tiny block pages.
pub fn detect_block_reason(status: StatusCode, body: &str) -> Option<String> {
    if status.as_u16() == 418 {
        return Some("http_418".to_string());
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some("http_429".to_string());
    }
    if status == StatusCode::FORBIDDEN {
        return Some("http_403".to_string());
    }
    if status == StatusCode::SERVICE_UNAVAILABLE {
        return Some("http_503".to_string());
    }

    let lower = body.to_lowercase();
    let maybe = [
        ("unusual traffic", "unusual_traffic"),
        ("our systems have detected unusual traffic", "unusual_traffic"),
        (
            "sorry, but your computer or network may be sending automated queries",
            "captcha",
        ),
        ("recaptcha", "captcha"),
        ("hcaptcha", "captcha"),
        ("verify you are human", "captcha"),
        ("are you a robot", "captcha"),
        ("access denied", "access_denied"),
    ];

    for (needle, label) in maybe {
        if lower.contains(needle) {
            return Some(label.to_string());
        }
    }

    // Heuristic: tiny HTML + any block-ish token
    if body.len() < 3500 && (lower.contains("captcha") || lower.contains("blocked")) {
        return Some("block_page".to_string());
    }

    None
}

/// Fetch a SERP URL with stealth headers, surfacing blocks as `EngineError`.
pub async fn fetch_serp_html(
    client: &reqwest::Client,
    url: reqwest::Url,
    engine: &str,
) -> Result<(StatusCode, String), EngineError> {
    let (status, body) = fetch_html(client, url)
        .await
        .map_err(|e| EngineError::Transient(e.to_string()))?;

    if let Some(reason) = detect_block_reason(status, &body) {
        tracing::warn!("[Search] {} SERP blocked: {}", engine, reason);
        return Err(EngineError::Blocked { reason });
    }

    Ok((status, body))
}

pub async fn fetch_html(
    client: &reqwest::Client,
    url: reqwest::Url,
) -> Result<(StatusCode, String)> {
    let profile = crate::browser::stealth::random_serp_profile();
    let mut req = client
        .get(url)
        .header("User-Agent", profile.user_agent.as_str())
        .header("Accept", "text/html,application/xhtml+xml")
        .header(
            "Accept-Language",
            std::env::var("FORAGE_ACCEPT_LANGUAGE").unwrap_or_else(|_| "en-US,en;q=0.9".into()),
        );

    for (k, v) in crate::browser::stealth::stealth_headers() {
        req = req.header(k, v);
    }

    let resp = req.send().await?;
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    Ok((status, body))
}

/// Collapse a node's text into single-spaced form.
pub(crate) fn collapse_text(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_teapot_and_429() {
        assert_eq!(
            detect_block_reason(StatusCode::IM_A_TEAPOT, ""),
            Some("http_418".into())
        );
        assert_eq!(
            detect_block_reason(StatusCode::TOO_MANY_REQUESTS, ""),
            Some("http_429".into())
        );
    }

    #[test]
    fn detects_unusual_traffic_phrase() {
        let body = "<html>Our systems have detected unusual traffic from your network</html>";
        assert_eq!(
            detect_block_reason(StatusCode::OK, body),
            Some("unusual_traffic".into())
        );
    }

    #[test]
    fn detects_tiny_block_page() {
        let body = "<html><body>blocked</body></html>";
        assert_eq!(
            detect_block_reason(StatusCode::OK, body),
            Some("block_page".into())
        );
    }

    #[test]
    fn normal_page_passes() {
        let body = format!("<html><body>{}</body></html>", "real results ".repeat(500));
        assert_eq!(detect_block_reason(StatusCode::OK, &body), None);
    }
}
