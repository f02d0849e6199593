//! LLM invocation capability.
//!
//! The core consumes a single `call(prompt, role, max_tokens, temperature)`
//! contract. The default implementation speaks the OpenAI-compatible
//! chat-completions protocol, so any endpoint (OpenAI, Ollama, LM Studio,
//! vLLM) works by pointing `OPENAI_BASE_URL` at it.

use anyhow::{anyhow, Context, Result};
use backoff::ExponentialBackoffBuilder;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::LlmConfig;

/// The roles the core issues. Each role maps to a distinct prompt family;
/// the default invoker folds the role into the system message so local
/// models can be specialised per role via routing proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LlmRole {
    PhaseSelector,
    RequirementsReasoner,
    RelevanceScanner,
    PageReader,
    ExtractionValidator,
    NavigationDecider,
    RetryDecider,
    Synthesizer,
    SatisfactionEvaluator,
    GoalGenerator,
    PageSummarizer,
}

impl LlmRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            LlmRole::PhaseSelector => "phase_selector",
            LlmRole::RequirementsReasoner => "requirements_reasoner",
            LlmRole::RelevanceScanner => "relevance_scanner",
            LlmRole::PageReader => "page_reader",
            LlmRole::ExtractionValidator => "extraction_validator",
            LlmRole::NavigationDecider => "navigation_decider",
            LlmRole::RetryDecider => "retry_decider",
            LlmRole::Synthesizer => "synthesizer",
            LlmRole::SatisfactionEvaluator => "satisfaction_evaluator",
            LlmRole::GoalGenerator => "goal_generator",
            LlmRole::PageSummarizer => "page_summarizer",
        }
    }

    fn system_prompt(&self) -> &'static str {
        match self {
            LlmRole::PhaseSelector => {
                "You select research phases. Answer with strict JSON only, no prose."
            }
            LlmRole::RequirementsReasoner => {
                "You derive product requirements from research intelligence. \
                 Answer with strict JSON only, no prose."
            }
            LlmRole::RelevanceScanner => {
                "You judge whether a page is relevant to a research goal. \
                 Answer with strict JSON only."
            }
            LlmRole::PageReader => {
                "You extract structured data from web page text. \
                 Answer with strict JSON matching the requested schema."
            }
            LlmRole::ExtractionValidator => {
                "You validate extracted data against a research goal. \
                 Answer with strict JSON only."
            }
            LlmRole::NavigationDecider => {
                "You decide the next navigation action on a web page. \
                 Answer with strict JSON only."
            }
            LlmRole::RetryDecider => {
                "You find an alternative navigation path after a failed \
                 extraction. Answer with strict JSON only."
            }
            LlmRole::Synthesizer => {
                "You merge research summaries into one intelligence document. \
                 Answer with strict JSON only."
            }
            LlmRole::SatisfactionEvaluator => {
                "You judge whether a research pass satisfied its goal. \
                 Answer with strict JSON only."
            }
            LlmRole::GoalGenerator => {
                "You produce focused research sub-goals. Answer with strict JSON only."
            }
            LlmRole::PageSummarizer => "You summarize web page content concisely.",
        }
    }
}

/// LLM invocation contract. Implementations must be safe under concurrent
/// use; every call is a suspension point with a bounded timeout.
#[async_trait::async_trait]
pub trait LlmInvoker: Send + Sync {
    async fn call(
        &self,
        prompt: &str,
        role: LlmRole,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String>;
}

// ───────────────────────────────────────────────────────────────────────────
// OpenAI-compatible default implementation
// ───────────────────────────────────────────────────────────────────────────

pub struct OpenAiInvoker {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
    max_retries: u32,
}

impl OpenAiInvoker {
    pub fn new(cfg: &LlmConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: cfg.resolve_base_url(),
            api_key: cfg.resolve_api_key(),
            model: cfg.resolve_model(),
            timeout: cfg.resolve_timeout(),
            max_retries: cfg.resolve_max_retries(),
        }
    }

    async fn call_once(
        &self,
        prompt: &str,
        role: LlmRole,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": role.system_prompt()},
                {"role": "user", "content": prompt},
            ],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        let mut req = self.client.post(&url).timeout(self.timeout).json(&body);
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                req = req.bearer_auth(key);
            }
        }

        let resp = req.send().await.context("LLM request failed")?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("LLM endpoint returned {}: {}", status, truncate(&text, 200)));
        }

        let value: serde_json::Value = resp.json().await.context("LLM response not JSON")?;
        let content = value
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("LLM response missing choices[0].message.content"))?;

        debug!(
            "[Llm] {} call ok ({} prompt chars → {} response chars)",
            role.as_str(),
            prompt.len(),
            content.len()
        );
        Ok(content.to_string())
    }
}

#[async_trait::async_trait]
impl LlmInvoker for OpenAiInvoker {
    async fn call(
        &self,
        prompt: &str,
        role: LlmRole,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        use backoff::backoff::Backoff;

        let mut policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(500))
            .with_max_interval(Duration::from_secs(8))
            .with_max_elapsed_time(None)
            .build();

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.call_once(prompt, role, max_tokens, temperature).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt <= self.max_retries => {
                    let delay = policy.next_backoff().unwrap_or(Duration::from_secs(2));
                    warn!(
                        "[Llm] {} attempt {}/{} failed: {} — retrying in {:.1}s",
                        role.as_str(),
                        attempt,
                        self.max_retries + 1,
                        e,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("LLM unavailable for role '{}'", role.as_str()))
                }
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Response parsing helpers
// ───────────────────────────────────────────────────────────────────────────

/// Extract the first JSON object embedded in an LLM response. Models wrap
/// JSON in prose and code fences often enough that a bare `from_str` on the
/// whole response is not viable.
pub fn extract_json_object(response: &str) -> Option<serde_json::Value> {
    let trimmed = response.trim();

    // Fast path: the whole response is the object.
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if v.is_object() || v.is_array() {
            return Some(v);
        }
    }

    // Scan for a balanced top-level `{ … }` block, respecting strings.
    let bytes = trimmed.as_bytes();
    let start = trimmed.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &trimmed[start..=i];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Truncate on a char boundary with an ellipsis; used for log lines and
/// prompt budget trimming.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
