use crate::core::types::SerpEntry;
use base64::Engine as _;
use scraper::{Html, Selector};

use super::{collapse_text, fetch_serp_html, EngineError};

pub const HOME_URL: &str = "https://www.bing.com/";

pub fn search_url(query: &str) -> String {
    use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
    format!(
        "https://www.bing.com/search?q={}",
        utf8_percent_encode(query, NON_ALPHANUMERIC)
    )
}

fn normalize_bing_href(href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }

    if !(href.starts_with("http://") || href.starts_with("https://")) {
        return None;
    }

    let Ok(url) = url::Url::parse(href) else {
        return Some(href.to_string());
    };

    // Bing click-tracking links: /ck/a?…&u=a1<base64(url)>&…
    if matches!(url.host_str(), Some("www.bing.com") | Some("bing.com"))
        && url.path().starts_with("/ck/")
    {
        for (k, v) in url.query_pairs() {
            if k == "u" && !v.trim().is_empty() {
                let mut raw = v.to_string();
                if raw.starts_with("a1") {
                    raw = raw.trim_start_matches("a1").to_string();
                }

                if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(raw) {
                    if let Ok(decoded_str) = String::from_utf8(decoded) {
                        let decoded_str = decoded_str.trim().to_string();
                        if decoded_str.starts_with("http://") || decoded_str.starts_with("https://")
                        {
                            return Some(decoded_str);
                        }
                    }
                }

                // Fall back to original when decoding fails.
                break;
            }
        }
    }

    Some(href.to_string())
}

pub fn parse_results(html: &str, max_results: usize) -> Vec<SerpEntry> {
    let doc = Html::parse_document(html);
    let sel_item = Selector::parse("li.b_algo").unwrap();
    let sel_link = Selector::parse("h2 a").unwrap();
    let sel_snip = Selector::parse("div.b_caption p").unwrap();

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
        let Some(href) = normalize_bing_href(&href_raw) else {
            continue;
        };
        let title = collapse_text(&link.text().collect::<Vec<_>>().join(" "));
        let snippet = item
            .select(&sel_snip)
            .next()
            .map(|p| collapse_text(&p.text().collect::<Vec<_>>().join(" ")))
            .unwrap_or_default();

        out.push(SerpEntry {
            url: href,
            title,
            snippet,
            engine: Some("bing".to_string()),
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

    let (_status, body) = fetch_serp_html(client, url, "bing").await?;
    Ok(parse_results(&body, max_results))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn click_tracking_href_decodes() {
        let real = "https://example.com/hamster";
        let encoded = base64::engine::general_purpose::STANDARD.encode(real);
        let href = format!("https://www.bing.com/ck/a?!&u=a1{}&ntb=1", encoded);
        assert_eq!(normalize_bing_href(&href), Some(real.to_string()));
    }

    #[test]
    fn parses_algo_items() {
        let html = r#"<ol><li class="b_algo">
            <h2><a href="https://petstore.example/syrian-hamster">Syrian Hamsters</a></h2>
            <div class="b_caption"><p>Find Syrian hamsters available for adoption near you.</p></div>
        </li></ol>"#;
        let out = parse_results(html, 5);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].url, "https://petstore.example/syrian-hamster");
        assert!(out[0].snippet.contains("adoption"));
    }
}
