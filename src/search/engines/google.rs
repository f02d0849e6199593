use crate::core::types::SerpEntry;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use scraper::{ElementRef, Html, Selector};

use super::{collapse_text, fetch_serp_html, EngineError};

pub const HOME_URL: &str = "https://www.google.com/";

pub fn search_url(query: &str, max_results: usize) -> String {
    let encoded = utf8_percent_encode(query, NON_ALPHANUMERIC).to_string();
    format!(
        "https://www.google.com/search?q={}&hl=en&num={}",
        encoded,
        max_results.clamp(5, 10)
    )
}

fn normalize_google_href(href: &str) -> Option<String> {
    if href.is_empty() {
        return None;
    }

    // Old-style redirect links: /url?q=<real>&…
    if href.starts_with("/url?") {
        if let Ok(url) = reqwest::Url::parse(&format!("https://www.google.com{}", href)) {
            for (k, v) in url.query_pairs() {
                if k == "q" && !v.is_empty() {
                    return Some(v.to_string());
                }
            }
        }
        return None;
    }

    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }

    None
}

fn extract_snippet(container: &ElementRef<'_>) -> String {
    // Google markup changes often. Try a few common patterns.
    let candidates = ["div.VwiC3b", "div.IsZvec", "span.aCOpRe", "div.MUxGbd"];

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

    let container_selectors = ["div#search div.MjjYud", "div#search div.g"];
    let link_sel = Selector::parse("a").unwrap();
    let h3_sel = Selector::parse("h3").unwrap();

    let mut out = Vec::new();
    'outer: for css in container_selectors {
        let Ok(container_sel) = Selector::parse(css) else {
            continue;
        };

        for container in doc.select(&container_sel) {
            if out.len() >= max_results {
                break 'outer;
            }

            let mut chosen: Option<(String, String)> = None;
            for a in container.select(&link_sel) {
                if a.select(&h3_sel).next().is_some() {
                    let href = a.value().attr("href").unwrap_or("");
                    let url = match normalize_google_href(href) {
                        Some(u) => u,
                        None => continue,
                    };
                    let title = a
                        .select(&h3_sel)
                        .next()
                        .map(|h| collapse_text(&h.text().collect::<Vec<_>>().join(" ")))
                        .unwrap_or_default();
                    if title.is_empty() {
                        continue;
                    }
                    chosen = Some((url, title));
                    break;
                }
            }

            let Some((url, title)) = chosen else {
                continue;
            };

            if url.contains("google.com") {
                continue;
            }

            let snippet = extract_snippet(&container);
            out.push(SerpEntry {
                url,
                title,
                snippet,
                engine: Some("google".to_string()),
            });
        }

        if !out.is_empty() {
            break;
        }
    }

    out
}

pub async fn search(
    client: &reqwest::Client,
    query: &str,
    max_results: usize,
) -> Result<Vec<SerpEntry>, EngineError> {
    let url = reqwest::Url::parse(&search_url(query, max_results))
        .map_err(|e| EngineError::Fatal(e.to_string()))?;

    let (_status, body) = fetch_serp_html(client, url, "google").await?;
    Ok(parse_results(&body, max_results))
}
