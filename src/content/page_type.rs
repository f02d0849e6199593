//! Rule-based page-type detection (LLM-free).
//!
//! Stage 2 of the page reader: cheap keyword/URL scoring that picks the
//! extraction schema before any model call is spent on the page.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageType {
    ProductListing,
    ForumDiscussion,
    ResearchPaper,
    NewsArticle,
    GuideTutorial,
    VendorDirectory,
    General,
}

impl PageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageType::ProductListing => "product_listing",
            PageType::ForumDiscussion => "forum_discussion",
            PageType::ResearchPaper => "research_paper",
            PageType::NewsArticle => "news_article",
            PageType::GuideTutorial => "guide_tutorial",
            PageType::VendorDirectory => "vendor_directory",
            PageType::General => "general",
        }
    }

    pub fn parse(s: &str) -> PageType {
        match s.trim().to_ascii_lowercase().as_str() {
            "product_listing" | "listing" | "product" => PageType::ProductListing,
            "forum_discussion" | "forum" => PageType::ForumDiscussion,
            "research_paper" | "paper" => PageType::ResearchPaper,
            "news_article" | "news" => PageType::NewsArticle,
            "guide_tutorial" | "guide" | "tutorial" => PageType::GuideTutorial,
            "vendor_directory" | "directory" => PageType::VendorDirectory,
            _ => PageType::General,
        }
    }
}

fn count_hits(haystack: &str, needles: &[&str]) -> usize {
    needles.iter().filter(|n| haystack.contains(*n)).count()
}

/// Detect the page type from sanitized text and URL. The highest-scoring
/// category wins; ties and weak signals fall through to `General`.
pub fn detect_page_type(text: &str, url: &str) -> PageType {
    let lower = text.to_lowercase();
    let url_lower = url.to_lowercase();

    let price_count = lower.matches('$').count()
        + lower.matches('€').count()
        + lower.matches("price").count();

    let mut scores: Vec<(PageType, usize)> = Vec::new();

    // Product listing: many prices + cart vocabulary.
    let mut product = count_hits(
        &lower,
        &["add to cart", "in stock", "out of stock", "free shipping", "sku", "checkout", "buy now"],
    ) * 2;
    if price_count >= 3 {
        product += 3;
    }
    if count_hits(&url_lower, &["/shop", "/store", "/product", "/collections", "/category", "search?"]) > 0 {
        product += 2;
    }
    scores.push((PageType::ProductListing, product));

    // Forum: thread vocabulary + reply structure.
    let mut forum = count_hits(
        &lower,
        &["replies", "posted by", "joined:", "thread", "upvote", "op said", "quote from", "forum"],
    ) * 2;
    if count_hits(&url_lower, &["reddit.com", "/forum", "/thread", "/t/", "community."]) > 0 {
        forum += 3;
    }
    scores.push((PageType::ForumDiscussion, forum));

    // Research paper.
    let paper = count_hits(
        &lower,
        &["abstract", "doi:", "references", "et al", "methodology", "cited by", "peer-reviewed"],
    ) * 2
        + count_hits(&url_lower, &["arxiv.org", "doi.org", "pubmed", ".edu/"]) * 3;
    scores.push((PageType::ResearchPaper, paper));

    // News article.
    let news = count_hits(
        &lower,
        &["published", "reporter", "breaking", "associated press", "reuters", "updated at"],
    ) + count_hits(&url_lower, &["/news/", "/article/", "/story/", "cnn.com", "bbc."]) * 3;
    scores.push((PageType::NewsArticle, news));

    // Guide / tutorial.
    let guide = count_hits(
        &lower,
        &["step 1", "step 2", "how to", "tutorial", "beginner", "guide", "tips for"],
    ) + count_hits(&url_lower, &["/guide", "/how-to", "/tutorial", "wiki"]) * 2;
    scores.push((PageType::GuideTutorial, guide));

    // Vendor directory: lists of businesses with locations/contacts.
    let directory = count_hits(
        &lower,
        &["directory", "find a breeder", "listings", "locations", "near you", "phone:", "state:"],
    ) + count_hits(&url_lower, &["/directory", "/breeders", "/dealers", "/locator"]) * 3;
    scores.push((PageType::VendorDirectory, directory));

    let (best, score) = scores
        .into_iter()
        .max_by_key(|(_, s)| *s)
        .unwrap_or((PageType::General, 0));

    if score >= 3 {
        best
    } else {
        PageType::General
    }
}
