use crate::core::types::SerpEntry;
use scraper::{Html, Selector};

use super::{collapse_text, fetch_serp_html, EngineError};

pub const HOME_URL: &str = "https://duckduckgo.com/";

pub fn search_url(query: &str) -> String {
    use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
    format!(
        "https://duckduckgo.com/html/?q={}",
        utf8_percent_encode(query, NON_ALPHANUMERIC)
    )
}

fn normalize_ddg_href(href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }

    // Protocol-relative URLs.
    let candidate = if href.starts_with("//") {
        format!("https:{}", href)
    } else if href.starts_with('/') {
        format!("https://duckduckgo.com{}", href)
    } else {
        href.to_string()
    };

    // If it's a DuckDuckGo redirect link, extract the real destination.
    if let Ok(url) = url::Url::parse(&candidate) {
        if matches!(url.host_str(), Some("duckduckgo.com")) && url.path().starts_with("/l/") {
            for (k, v) in url.query_pairs() {
                if k == "uddg" && !v.trim().is_empty() {
                    return Some(v.to_string());
                }
            }
        }
    }

    // Otherwise, accept absolute http(s) only.
    if candidate.starts_with("http://") || candidate.starts_with("https://") {
        return Some(candidate);
    }

    None
}

pub fn parse_results(html: &str, max_results: usize) -> Vec<SerpEntry> {
    let doc = Html::parse_document(html);
    let sel_item = Selector::parse("div.results_links").unwrap();
    let sel_link = Selector::parse("a.result__a").unwrap();
    let sel_snip = Selector::parse("a.result__snippet, div.result__snippet").unwrap();

    let mut out = Vec::new();
    for item in doc.select(&sel_item) {
        if out.len() >= max_results {
            break;
        }

        let link = match item.select(&sel_link).next() {
            Some(l) => l,
            None => continue,
        };
        let href_raw = link.value().attr("href").unwrap_or("").to_string();
        let Some(href) = normalize_ddg_href(&href_raw) else {
            continue;
        };
        let title = collapse_text(&link.text().collect::<Vec<_>>().join(" "));

        let snippet = item
            .select(&sel_snip)
            .next()
            .map(|n| collapse_text(&n.text().collect::<Vec<_>>().join(" ")))
            .unwrap_or_default();

        out.push(SerpEntry {
            url: href,
            title,
            snippet,
            engine: Some("duckduckgo".to_string()),
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

    let (_status, body) = fetch_serp_html(client, url, "duckduckgo").await?;
    Ok(parse_results(&body, max_results))
}
