//! Adaptive page reading pipeline.
//!
//! Four stages against a reading goal: relevance scan (cheap LLM look at a
//! preview) → rule-based type detection → type-schema extraction → goal
//! validation. Any stage that errors or comes back empty downgrades to a
//! 0.5-relevance fallback reading; the caller decides whether to keep it.

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use super::page_type::{detect_page_type, PageType};
use super::sanitize::SanitizedContent;
use crate::llm::{extract_json_object, LlmInvoker, LlmRole};

/// Relevance below this abandons the page before extraction.
pub const RELEVANCE_FLOOR: f64 = 0.3;

/// Fallback relevance when a stage errors out.
const FALLBACK_RELEVANCE: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct PageReading {
    pub url: String,
    pub relevance_score: f64,
    pub relevance_reason: String,
    pub page_type: PageType,
    /// Type-schema extraction output (empty object when abandoned).
    pub extracted: serde_json::Value,
    pub is_valid: bool,
    pub confidence: f64,
    pub summary: String,
    pub key_points: Vec<String>,
    /// True when the pipeline degraded to the fallback reading.
    pub degraded: bool,
}

impl PageReading {
    pub fn abandoned(url: &str, score: f64, reason: String) -> Self {
        Self {
            url: url.to_string(),
            relevance_score: score,
            relevance_reason: reason,
            page_type: PageType::General,
            extracted: json!({}),
            is_valid: false,
            confidence: 0.0,
            summary: String::new(),
            key_points: Vec::new(),
            degraded: false,
        }
    }

    fn fallback(url: &str, page_type: PageType, text: &str) -> Self {
        Self {
            url: url.to_string(),
            relevance_score: FALLBACK_RELEVANCE,
            relevance_reason: "fallback: reading stage failed".to_string(),
            page_type,
            extracted: json!({}),
            is_valid: false,
            confidence: FALLBACK_RELEVANCE,
            summary: crate::llm::truncate(text, 400),
            key_points: Vec::new(),
            degraded: true,
        }
    }

    pub fn is_relevant(&self) -> bool {
        self.relevance_score >= RELEVANCE_FLOOR
    }
}

/// Fixed output schema per page type, described to the extractor role.
fn extraction_schema(page_type: PageType) -> &'static str {
    match page_type {
        PageType::ProductListing => {
            r#"{"products": [{"name": str, "price": number|null, "url": str, "specs": {str: str}, "availability": str}]}"#
        }
        PageType::ForumDiscussion => {
            r#"{"topic": str, "recommendations": [str], "warnings": [str], "consensus": str, "mentioned_vendors": [str]}"#
        }
        PageType::ResearchPaper => {
            r#"{"title": str, "findings": [str], "methodology": str, "limitations": [str]}"#
        }
        PageType::NewsArticle => {
            r#"{"headline": str, "facts": [str], "date": str|null, "entities": [str]}"#
        }
        PageType::GuideTutorial => {
            r#"{"topic": str, "steps": [str], "requirements": [str], "tips": [str]}"#
        }
        PageType::VendorDirectory => {
            r#"{"vendors": [{"name": str, "url": str|null, "location": str|null, "contact": str|null}]}"#
        }
        PageType::General => r#"{"summary": str, "facts": [str], "links_of_interest": [str]}"#,
    }
}

pub struct PageReader {
    llm: Arc<dyn LlmInvoker>,
}

impl PageReader {
    pub fn new(llm: Arc<dyn LlmInvoker>) -> Self {
        Self { llm }
    }

    /// Run the full pipeline over sanitized content.
    ///
    /// `template` overrides the type schema when the caller already knows
    /// what it wants (e.g. schema-driven vendor extraction).
    pub async fn read(
        &self,
        url: &str,
        content: &SanitizedContent,
        goal: &str,
        template: Option<&str>,
    ) -> PageReading {
        let text = content.full_text();
        if text.trim().is_empty() {
            return PageReading::abandoned(url, 0.0, "empty page".to_string());
        }

        // Stage 1: relevance scan over a short preview.
        let (score, reason) = match self.scan_relevance(url, &text, goal).await {
            Ok(v) => v,
            Err(e) => {
                warn!("[PageReader] relevance scan failed for {}: {}", url, e);
                (FALLBACK_RELEVANCE, "scan failed, assuming borderline".to_string())
            }
        };
        if score < RELEVANCE_FLOOR {
            debug!("[PageReader] abandoning {} (relevance {:.2})", url, score);
            return PageReading::abandoned(url, score, reason);
        }

        // Stage 2: rule-based type detection, no model involved.
        let page_type = detect_page_type(&text, url);

        // Stage 3: extraction with the type schema (or caller template).
        let extracted = match self.extract(url, &text, goal, page_type, template).await {
            Ok(v) if !v.is_null() => v,
            Ok(_) => {
                warn!("[PageReader] extraction empty for {}", url);
                return PageReading::fallback(url, page_type, &text);
            }
            Err(e) => {
                warn!("[PageReader] extraction failed for {}: {}", url, e);
                return PageReading::fallback(url, page_type, &text);
            }
        };

        // Stage 4: validate against the goal.
        match self.validate(url, goal, &extracted).await {
            Ok(validation) => PageReading {
                url: url.to_string(),
                relevance_score: score,
                relevance_reason: reason,
                page_type,
                extracted: validation
                    .cleaned_data
                    .unwrap_or(extracted),
                is_valid: validation.is_valid,
                confidence: validation.confidence,
                summary: validation.summary,
                key_points: validation.key_points,
                degraded: false,
            },
            Err(e) => {
                warn!("[PageReader] validation failed for {}: {}", url, e);
                let mut fallback = PageReading::fallback(url, page_type, &text);
                fallback.extracted = extracted;
                fallback.relevance_score = score;
                fallback
            }
        }
    }

    async fn scan_relevance(&self, url: &str, text: &str, goal: &str) -> Result<(f64, String)> {
        let preview = preview_of(text, 1200, 600);
        let prompt = format!(
            "Goal: \"{goal}\"\nURL: {url}\n\nPage preview:\n{preview}\n\n\
             Score how relevant this page is to the goal.\n\
             Respond with JSON: {{\"relevance_score\": 0.0-1.0, \"reason\": \"one line\"}}"
        );
        let response = self
            .llm
            .call(&prompt, LlmRole::RelevanceScanner, 150, 0.0)
            .await?;
        let value = extract_json_object(&response)
            .ok_or_else(|| anyhow::anyhow!("no JSON in relevance response"))?;
        let score = value
            .get("relevance_score")
            .and_then(|v| v.as_f64())
            .unwrap_or(FALLBACK_RELEVANCE)
            .clamp(0.0, 1.0);
        let reason = value
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        Ok((score, reason))
    }

    async fn extract(
        &self,
        url: &str,
        text: &str,
        goal: &str,
        page_type: PageType,
        template: Option<&str>,
    ) -> Result<serde_json::Value> {
        let schema = template.unwrap_or_else(|| extraction_schema(page_type));
        let body = crate::llm::truncate(text, 12_000);
        let prompt = format!(
            "Goal: \"{goal}\"\nURL: {url}\nPage type: {}\n\nPage content:\n{body}\n\n\
             Extract the data as JSON matching exactly this schema:\n{schema}\n\
             Use null for unknown fields. Respond with the JSON only.",
            page_type.as_str()
        );
        let response = self.llm.call(&prompt, LlmRole::PageReader, 1200, 0.0).await?;
        extract_json_object(&response)
            .ok_or_else(|| anyhow::anyhow!("no JSON in extraction response"))
    }

    async fn validate(
        &self,
        url: &str,
        goal: &str,
        extracted: &serde_json::Value,
    ) -> Result<ReadValidation> {
        let prompt = format!(
            "Goal: \"{goal}\"\nURL: {url}\n\nExtracted data:\n{}\n\n\
             Does this data serve the goal? Respond with JSON:\n\
             {{\"is_valid\": bool, \"confidence\": 0.0-1.0, \"cleaned_data\": object|null, \
             \"summary\": \"2-3 sentences\", \"key_points\": [\"...\"]}}",
            serde_json::to_string_pretty(extracted).unwrap_or_default()
        );
        let response = self
            .llm
            .call(&prompt, LlmRole::ExtractionValidator, 800, 0.0)
            .await?;
        let value = extract_json_object(&response)
            .ok_or_else(|| anyhow::anyhow!("no JSON in validation response"))?;

        Ok(ReadValidation {
            is_valid: value.get("is_valid").and_then(|v| v.as_bool()).unwrap_or(false),
            confidence: value
                .get("confidence")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
                .clamp(0.0, 1.0),
            cleaned_data: value.get("cleaned_data").filter(|v| v.is_object()).cloned(),
            summary: value
                .get("summary")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            key_points: value
                .get("key_points")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

struct ReadValidation {
    is_valid: bool,
    confidence: f64,
    cleaned_data: Option<serde_json::Value>,
    summary: String,
    key_points: Vec<String>,
}

/// Prefix+suffix preview for the relevance scan: the lede and the footer
/// carry the strongest topical signal at the lowest token cost.
fn preview_of(text: &str, head: usize, tail: usize) -> String {
    if text.len() <= head + tail {
        return text.to_string();
    }
    let mut h = head;
    while !text.is_char_boundary(h) {
        h -= 1;
    }
    let mut t = text.len() - tail;
    while !text.is_char_boundary(t) {
        t += 1;
    }
    format!("{}\n[…]\n{}", &text[..h], &text[t..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::sanitize::sanitize_html;
    use std::sync::Mutex;

    /// Scripted invoker: pops canned responses per role.
    struct ScriptedLlm {
        responses: Mutex<Vec<(LlmRole, String)>>,
    }

    #[async_trait::async_trait]
    impl LlmInvoker for ScriptedLlm {
        async fn call(
            &self,
            _prompt: &str,
            role: LlmRole,
            _max_tokens: u32,
            _temperature: f32,
        ) -> Result<String> {
            let mut responses = self.responses.lock().unwrap();
            let idx = responses
                .iter()
                .position(|(r, _)| *r == role)
                .ok_or_else(|| anyhow::anyhow!("no scripted response for {}", role.as_str()))?;
            Ok(responses.remove(idx).1)
        }
    }

    fn reader_with(responses: Vec<(LlmRole, &str)>) -> PageReader {
        PageReader::new(Arc::new(ScriptedLlm {
            responses: Mutex::new(
                responses
                    .into_iter()
                    .map(|(r, s)| (r, s.to_string()))
                    .collect(),
            ),
        }))
    }

    fn content() -> SanitizedContent {
        sanitize_html(
            "<html><body><h1>Hamsters</h1><p>Golden Syrian $35 add to cart in stock free shipping buy now</p><p>Long hair $40 add to cart</p><p>price list</p></body></html>",
            2000,
        )
    }

    #[tokio::test]
    async fn full_pipeline_success() {
        let reader = reader_with(vec![
            (LlmRole::RelevanceScanner, r#"{"relevance_score": 0.9, "reason": "product page"}"#),
            (
                LlmRole::PageReader,
                r#"{"products": [{"name": "Golden Syrian", "price": 35, "url": "/p/1", "specs": {}, "availability": "in stock"}]}"#,
            ),
            (
                LlmRole::ExtractionValidator,
                r#"{"is_valid": true, "confidence": 0.85, "cleaned_data": null, "summary": "One hamster listing.", "key_points": ["$35"]}"#,
            ),
        ]);

        let reading = reader
            .read("https://shop.example/h", &content(), "syrian hamsters", None)
            .await;
        assert!(reading.is_valid);
        assert!(!reading.degraded);
        assert_eq!(reading.page_type, PageType::ProductListing);
        assert_eq!(reading.extracted["products"][0]["name"], "Golden Syrian");
        assert_eq!(reading.key_points, vec!["$35"]);
    }

    #[tokio::test]
    async fn low_relevance_abandons_before_extraction() {
        let reader = reader_with(vec![(
            LlmRole::RelevanceScanner,
            r#"{"relevance_score": 0.1, "reason": "unrelated"}"#,
        )]);
        let reading = reader
            .read("https://example.com", &content(), "syrian hamsters", None)
            .await;
        assert!(!reading.is_relevant());
        assert_eq!(reading.extracted, serde_json::json!({}));
    }

    #[tokio::test]
    async fn extraction_failure_degrades_to_fallback() {
        let reader = reader_with(vec![
            (LlmRole::RelevanceScanner, r#"{"relevance_score": 0.8, "reason": "ok"}"#),
            (LlmRole::PageReader, "sorry, I cannot help with that"),
        ]);
        let reading = reader
            .read("https://example.com", &content(), "syrian hamsters", None)
            .await;
        assert!(reading.degraded);
        assert_eq!(reading.relevance_score, FALLBACK_RELEVANCE);
        assert!(!reading.summary.is_empty());
    }

    #[test]
    fn preview_combines_head_and_tail() {
        let text = format!("{}{}{}", "A".repeat(2000), "M".repeat(2000), "Z".repeat(2000));
        let p = preview_of(&text, 100, 50);
        assert!(p.starts_with('A'));
        assert!(p.ends_with('Z'));
        assert!(p.contains("[…]"));
    }
}
