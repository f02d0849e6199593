use crate::core::types::SerpEntry;
use scraper::{ElementRef, Html, Selector};

use super::{collapse_text, fetch_serp_html, EngineError};

pub const HOME_URL: &str = "https://search.brave.com/";

pub fn search_url(query: &str) -> String {
    use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
    format!(
        "https://search.brave.com/search?q={}",
        utf8_percent_encode(query, NON_ALPHANUMERIC)
    )
}

fn normalize_href(href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    None
}

fn extract_snippet(container: &ElementRef<'_>) -> String {
    let candidates = [
        "p.snippet-description",
        "div.snippet-description",
        "p",
        "div",
    ];
    for css in candidates {
        if let Ok(sel) = Selector::parse(css) {
            if let Some(n) = container.select(&sel).next() {
                let trimmed = collapse_text(&n.text().collect::<Vec<_>>().join(" "));
                if trimmed.len() >= 20 {
                    return trimmed;
                }
            }
        }
    }
    String::new()
}

pub fn parse_results(html: &str, max_results: usize) -> Vec<SerpEntry> {
    let doc = Html::parse_document(html);

    // Brave SERP markup changes; prefer semantic patterns: anchors wrapping h3 under main.
    let main_sel = Selector::parse("main").unwrap();
    let a_sel = Selector::parse("a").unwrap();
    let h3_sel = Selector::parse("h3").unwrap();

    let mut out = Vec::new();
    let Some(main) = doc.select(&main_sel).next() else {
        return out;
    };

    for a in main.select(&a_sel) {
        if out.len() >= max_results {
            break;
        }
        if a.select(&h3_sel).next().is_none() {
            continue;
        }

        let href = a.value().attr("href").unwrap_or("");
        let Some(url) = normalize_href(href) else {
            continue;
        };

        let title = a
            .select(&h3_sel)
            .next()
            .map(|h| collapse_text(&h.text().collect::<Vec<_>>().join(" ")))
            .unwrap_or_default();
        if title.is_empty() {
            continue;
        }

        let snippet = extract_snippet(&a);
        out.push(SerpEntry {
            url,
            title,
            snippet,
            engine: Some("brave".to_string()),
        });
    }

    out
}

pub async fn search(
    client: &reqwest::Client,
    query: &str,
    max_results: usize,
) -> Result<Vec<SerpEntry>, EngineError> {
    let url = reqwest::Url::parse(&search_url(query))
        .map_err(|e| EngineError::Fatal(e.to_string()))?;

    let (_status, body) = fetch_serp_html(client, url, "brave").await?;
    Ok(parse_results(&body, max_results))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_anchor_h3_pattern() {
        let html = r#"<main>
            <a href="https://hamstery.example/ca"><h3>California Hamstery</h3>
              <p class="snippet-description">Registered Syrian hamster breeder serving California.</p>
            </a>
            <a href="/relative"><h3>Ignored relative</h3></a>
        </main>"#;
        let out = parse_results(html, 5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].title, "California Hamstery");
        assert!(out[0].snippet.contains("Registered"));
    }

    #[test]
    fn no_main_yields_empty() {
        assert!(parse_results("<div><a href=\"https://x.test\"><h3>t</h3></a></div>", 5).is_empty());
    }
}
