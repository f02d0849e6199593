//! HTML → LLM-consumable text.
//!
//! Strips scripts, styles, chrome containers, ads, and repeated boilerplate
//! while preserving headings, paragraphs, list structure, prices, and link
//! text, then chunks the result under a token budget on section boundaries.
//! Deterministic: identical HTML always produces identical output.

use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;

/// Default chunk budget in (approximate) tokens.
pub const DEFAULT_TOKEN_BUDGET: usize = 2000;

/// Rough chars-per-token for budget accounting.
const CHARS_PER_TOKEN: usize = 4;

/// A line appearing this many times across the page is treated as repeated
/// boilerplate (menus rendered per-section, legal footers) and dropped.
const BOILERPLATE_REPEAT_THRESHOLD: usize = 3;

#[derive(Debug, Clone, serde::Serialize)]
pub struct SanitizeMetadata {
    pub original_size: usize,
    pub sanitized_size: usize,
    pub reduction_pct: f64,
}

#[derive(Debug, Clone)]
pub struct SanitizedContent {
    pub chunks: Vec<String>,
    pub metadata: SanitizeMetadata,
}

impl SanitizedContent {
    /// All chunks joined; convenient for single-prompt consumers.
    pub fn full_text(&self) -> String {
        self.chunks.join("\n\n")
    }
}

const NOISE_TAGS: &[&str] = &[
    "script", "style", "nav", "footer", "aside", "form", "iframe", "noscript", "svg", "template",
];

const NOISE_CLASS_PATTERNS: &[&str] = &[
    "cookie", "consent", "gdpr", "banner", "newsletter", "popup", "modal", "sidebar",
    "advert", "adsbygoogle", "ad-unit", "taboola", "outbrain", "breadcrumb", "menu",
    "social-share", "related-posts",
];

fn is_noise_element(el: &ElementRef<'_>) -> bool {
    let tag = el.value().name();
    if NOISE_TAGS.contains(&tag) {
        return true;
    }
    let id = el.value().attr("id").unwrap_or("").to_lowercase();
    let class = el.value().attr("class").unwrap_or("").to_lowercase();
    NOISE_CLASS_PATTERNS
        .iter()
        .any(|p| id.contains(p) || class.contains(p))
}

fn has_noise_ancestor(el: &ElementRef<'_>) -> bool {
    for ancestor in el.ancestors() {
        if let Some(ae) = ElementRef::wrap(ancestor) {
            if is_noise_element(&ae) {
                return true;
            }
        }
    }
    false
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// One content block with enough structure to chunk on.
#[derive(Debug, Clone)]
struct Block {
    text: String,
    is_heading: bool,
}

fn extract_blocks(html: &str) -> Vec<Block> {
    let doc = Html::parse_document(html);
    let sel =
        Selector::parse("h1, h2, h3, h4, h5, h6, p, li, td, th, blockquote, pre, dt, dd").unwrap();

    let mut blocks = Vec::new();
    for el in doc.select(&sel) {
        if has_noise_ancestor(&el) || is_noise_element(&el) {
            continue;
        }
        // Nested matches (li > p) would duplicate text; keep only the
        // innermost by skipping elements that contain another match.
        if el.select(&sel).next().is_some() {
            continue;
        }

        let tag = el.value().name();
        let raw = el.text().collect::<Vec<_>>().join(" ");
        let text = collapse(&raw);
        if text.is_empty() {
            continue;
        }

        let is_heading = matches!(tag, "h1" | "h2" | "h3" | "h4" | "h5" | "h6");
        let rendered = match tag {
            "h1" => format!("# {}", text),
            "h2" => format!("## {}", text),
            "h3" | "h4" | "h5" | "h6" => format!("### {}", text),
            "li" | "dt" | "dd" => format!("- {}", text),
            _ => text,
        };

        blocks.push(Block {
            text: rendered,
            is_heading,
        });
    }
    blocks
}

/// Drop lines that repeat across the page (per-section menus, footers that
/// sneak past tag filtering). Keeps the first occurrence of short repeats
/// only when they look like prices.
fn drop_boilerplate(blocks: Vec<Block>) -> Vec<Block> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for b in &blocks {
        *counts.entry(b.text.to_lowercase()).or_insert(0) += 1;
    }

    let mut seen: HashMap<String, usize> = HashMap::new();
    blocks
        .into_iter()
        .filter(|b| {
            let key = b.text.to_lowercase();
            let total = counts[&key];
            if total < BOILERPLATE_REPEAT_THRESHOLD {
                return true;
            }
            // Repeated price fragments are signal on listing pages.
            if b.text.contains('$') || b.text.contains('€') || b.text.contains('£') {
                return true;
            }
            let n = seen.entry(key).or_insert(0);
            *n += 1;
            *n == 1
        })
        .collect()
}

fn chunk_blocks(blocks: &[Block], token_budget: usize) -> Vec<String> {
    let budget_chars = token_budget.max(50) * CHARS_PER_TOKEN;
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();

    let flush = |current: &mut String, chunks: &mut Vec<String>| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }
        current.clear();
    };

    for block in blocks {
        let would_overflow = current.len() + block.text.len() + 2 > budget_chars;
        // Prefer section boundaries: a heading past the halfway mark starts
        // a fresh chunk even before the budget is hit.
        let heading_break = block.is_heading && current.len() > budget_chars / 2;

        if (would_overflow || heading_break) && !current.is_empty() {
            flush(&mut current, &mut chunks);
        }

        if block.text.len() > budget_chars {
            // Oversized single block: hard split on char boundaries.
            let mut rest = block.text.as_str();
            while rest.len() > budget_chars {
                let mut cut = budget_chars;
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                chunks.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current.push_str(rest);
            current.push_str("\n\n");
            continue;
        }

        current.push_str(&block.text);
        current.push_str("\n\n");
    }
    flush(&mut current, &mut chunks);
    chunks
}

/// Sanitize raw HTML into ordered chunks plus size metadata.
pub fn sanitize_html(html: &str, token_budget: usize) -> SanitizedContent {
    let blocks = drop_boilerplate(extract_blocks(html));
    let chunks = chunk_blocks(&blocks, token_budget);
    let sanitized_size: usize = chunks.iter().map(|c| c.len()).sum();
    let original_size = html.len();
    let reduction_pct = if original_size > 0 {
        (1.0 - sanitized_size as f64 / original_size as f64) * 100.0
    } else {
        0.0
    };

    SanitizedContent {
        chunks,
        metadata: SanitizeMetadata {
            original_size,
            sanitized_size,
            reduction_pct,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><style>.x{}</style><script>var t=1;</script></head>
    <body>
      <nav><a href="/">Home</a><a href="/shop">Shop</a></nav>
      <div class="cookie-banner">We use cookies to improve your experience</div>
      <h1>Syrian Hamsters</h1>
      <p>Our hamsters are raised by ethical breeders across California.</p>
      <ul><li>Golden Syrian — $35</li><li>Long-haired Syrian — $40</li></ul>
      <h2>Care Guide</h2>
      <p>Syrian hamsters are solitary and need at least 450 square inches of space.</p>
      <footer>Copyright 2026 — All rights reserved</footer>
    </body></html>"#;

    #[test]
    fn strips_chrome_and_keeps_content() {
        let out = sanitize_html(PAGE, DEFAULT_TOKEN_BUDGET);
        let text = out.full_text();
        assert!(text.contains("# Syrian Hamsters"));
        assert!(text.contains("- Golden Syrian — $35"));
        assert!(text.contains("solitary"));
        assert!(!text.contains("var t=1"));
        assert!(!text.contains("We use cookies"));
        assert!(!text.contains("Copyright"));
        // Nav links are inside <nav> and dropped even though they are <a>.
        assert!(!text.contains("Home"));
    }

    #[test]
    fn deterministic_output() {
        let a = sanitize_html(PAGE, DEFAULT_TOKEN_BUDGET);
        let b = sanitize_html(PAGE, DEFAULT_TOKEN_BUDGET);
        assert_eq!(a.chunks, b.chunks);
        assert_eq!(a.metadata.sanitized_size, b.metadata.sanitized_size);
    }

    #[test]
    fn chunking_respects_budget() {
        let mut html = String::from("<html><body>");
        for i in 0..100 {
            html.push_str(&format!("<p>Paragraph {} with some repeated-ish but unique filler text {}.</p>", i, "x".repeat(80)));
        }
        html.push_str("</body></html>");

        let out = sanitize_html(&html, 100); // 100 tokens ≈ 400 chars
        assert!(out.chunks.len() > 1);
        for chunk in &out.chunks {
            assert!(chunk.len() <= 100 * 4 + 120, "chunk too big: {}", chunk.len());
        }
    }

    #[test]
    fn repeated_boilerplate_dropped_but_prices_kept() {
        let mut html = String::from("<html><body>");
        for _ in 0..5 {
            html.push_str("<p>Subscribe to our newsletter today</p>");
            html.push_str("<p>$19.99</p>");
        }
        html.push_str("<p>Actual content paragraph.</p></body></html>");

        let out = sanitize_html(&html, DEFAULT_TOKEN_BUDGET);
        let text = out.full_text();
        assert_eq!(text.matches("Subscribe to our newsletter").count(), 1);
        assert_eq!(text.matches("$19.99").count(), 5);
    }

    #[test]
    fn metadata_reports_reduction() {
        let out = sanitize_html(PAGE, DEFAULT_TOKEN_BUDGET);
        assert!(out.metadata.original_size > out.metadata.sanitized_size);
        assert!(out.metadata.reduction_pct > 0.0);
    }
}
