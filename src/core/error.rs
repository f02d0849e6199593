use thiserror::Error;

/// Block classification for anti-bot responses, shared by the page fetcher,
/// the search engines, and the vendor registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    Captcha,
    BotDetection,
    RedirectBlock,
    Http403,
    Http418,
    SoftBlock,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockKind::Captcha => "captcha",
            BlockKind::BotDetection => "bot_detection",
            BlockKind::RedirectBlock => "redirect_block",
            BlockKind::Http403 => "http_403",
            BlockKind::Http418 => "http_418",
            BlockKind::SoftBlock => "soft_block",
        }
    }
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error taxonomy surfaced on public call paths. Everything recoverable is
/// handled locally (failover, backoff, retry loops, registry updates); only
/// terminal states reach the caller.
#[derive(Debug, Error)]
pub enum ResearchError {
    /// External anti-bot response. Surfaced only when *all* engines/vendors
    /// for a step are blocked.
    #[error("blocked: {scope} ({kind})")]
    Blocked { scope: String, kind: BlockKind },

    /// Outbound pacing hit. Recovered locally by backoff; never surfaced
    /// from `research()` itself.
    #[error("rate limited: {scope}")]
    RateLimited { scope: String },

    /// Extraction produced nothing after exhausting navigator steps.
    #[error("extraction returned no results for {url}")]
    ExtractionEmpty { url: String },

    /// Extraction produced results that failed goal validation.
    #[error("extraction mismatch at {url}: {reason}")]
    ExtractionMismatch { url: String, reason: String },

    /// LLM endpoint unreachable after retries.
    #[error("llm unavailable ({role}): {message}")]
    LlmUnavailable { role: String, message: String },

    #[error("timeout: {scope} after {millis}ms")]
    Timeout { scope: String, millis: u64 },

    /// Vendor is under quarantine. Surfaced only when no alternatives remain.
    #[error("vendor quarantined: {domain}")]
    Quarantined { domain: String },

    #[error("cancelled")]
    Cancelled,

    #[error("browser error: {0}")]
    Browser(String),

    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ResearchError {
    pub fn timeout(scope: impl Into<String>, millis: u64) -> Self {
        ResearchError::Timeout {
            scope: scope.into(),
            millis,
        }
    }

    pub fn blocked(scope: impl Into<String>, kind: BlockKind) -> Self {
        ResearchError::Blocked {
            scope: scope.into(),
            kind,
        }
    }

    /// Recoverable kinds are handled at the boundary where they occur; only
    /// the rest should bubble out of `research()`.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ResearchError::RateLimited { .. }
                | ResearchError::ExtractionEmpty { .. }
                | ResearchError::ExtractionMismatch { .. }
                | ResearchError::Timeout { .. }
                | ResearchError::Quarantined { .. }
        )
    }
}

pub type Result<T, E = ResearchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_kind_labels() {
        assert_eq!(BlockKind::Captcha.as_str(), "captcha");
        assert_eq!(BlockKind::Http418.to_string(), "http_418");
    }

    #[test]
    fn recoverable_classification() {
        assert!(ResearchError::RateLimited { scope: "google".into() }.is_recoverable());
        assert!(ResearchError::timeout("fetch", 30_000).is_recoverable());
        assert!(!ResearchError::Cancelled.is_recoverable());
        assert!(!ResearchError::blocked("all engines", BlockKind::Captcha).is_recoverable());
    }
}
