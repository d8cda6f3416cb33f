//! Main-content extraction from page snapshots.
//!
//! Uses reqwest for fetching and scraper for HTML parsing. Extraction itself is a pure
//! function of the parsed document.

use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// User-Agent string identifying this fetcher
const USER_AGENT: &str = concat!("smartdigest/", env!("CARGO_PKG_VERSION"));

/// Default timeout for HTTP requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Joined paragraph text must be longer than this to count as main content
const MIN_PARAGRAPH_TEXT: usize = 10;

/// Elements whose text is never page content
const NON_CONTENT: &[&str] = &["script", "style", "noscript", "template"];

#[derive(Error, Debug)]
pub enum ScraperError {
    #[error("failed to fetch URL: {0}")]
    FetchError(#[from] reqwest::Error),
    #[error("no content found at URL")]
    NoContent,
}

/// A fetched page snapshot
#[derive(Debug, Clone)]
pub struct WebPage {
    /// The original URL
    pub url: String,
    /// Page title
    pub title: Option<String>,
    /// Raw HTML, parsed again by whichever context needs it
    pub html: String,
}

/// Create a configured HTTP client for fetching pages
fn create_client() -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(REQUEST_TIMEOUT)
        .build()
}

/// Fetch a page snapshot from a URL
pub async fn fetch_page(url: &str) -> Result<WebPage, ScraperError> {
    let client = create_client()?;

    let response = client.get(url).send().await?.error_for_status()?;
    let html = response.text().await?;
    if html.trim().is_empty() {
        return Err(ScraperError::NoContent);
    }

    let title = extract_title(&Html::parse_document(&html));
    debug!(url, bytes = html.len(), "fetched page");

    Ok(WebPage {
        url: url.to_string(),
        title,
        html,
    })
}

/// Extract the page title from <title> or <h1>
pub fn extract_title(document: &Html) -> Option<String> {
    ["title", "h1"]
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|selector| {
            let element = document.select(&selector).next()?;
            let title = element_text(element);
            (!title.is_empty()).then_some(title)
        })
}

/// Locate the main content of a document.
///
/// In order: the first `<article>`; all `<p>` joined by newlines (only if that is longer
/// than 10 characters); the first `<main>`; the whole `<body>`.
pub fn extract_main_text(document: &Html) -> String {
    if let Some(article) = first(document, "article") {
        return sanitize_text(&element_text(article));
    }

    let paragraphs: Vec<String> = select_all(document, "p")
        .into_iter()
        .map(|p| sanitize_text(&element_text(p)))
        .collect();
    if !paragraphs.is_empty() {
        let joined = paragraphs.join("\n");
        if joined.chars().count() > MIN_PARAGRAPH_TEXT {
            return joined;
        }
    }

    if let Some(main) = first(document, "main") {
        return sanitize_text(&element_text(main));
    }

    first(document, "body")
        .map(|body| sanitize_text(&element_text(body)))
        .unwrap_or_default()
}

/// Convenience for callers holding raw HTML.
pub fn extract_main_text_from_html(html: &str) -> String {
    extract_main_text(&Html::parse_document(html))
}

/// Strip angle brackets and surrounding whitespace so text can't be rendered as markup.
pub fn sanitize_text(text: &str) -> String {
    text.replace(['<', '>'], "").trim().to_string()
}

/// Stricter cleanup for text about to leave for the provider: also drops
/// `javascript:` and `data:` schemes.
pub fn sanitize_input(text: &str) -> String {
    let mut cleaned = text.replace(['<', '>'], "");
    for scheme in ["javascript:", "data:"] {
        cleaned = remove_ascii_case_insensitive(&cleaned, scheme);
    }
    cleaned.trim().to_string()
}

fn remove_ascii_case_insensitive(haystack: &str, needle: &str) -> String {
    let lower = haystack.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut last = 0;
    // ASCII lowercasing keeps byte offsets identical
    for (idx, _) in lower.match_indices(needle) {
        out.push_str(&haystack[last..idx]);
        last = idx + needle.len();
    }
    out.push_str(&haystack[last..]);
    out
}

fn first<'a>(document: &'a Html, selector: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(selector).ok()?;
    document.select(&selector).next()
}

fn select_all<'a>(document: &'a Html, selector: &str) -> Vec<ElementRef<'a>> {
    match Selector::parse(selector) {
        Ok(selector) => document.select(&selector).collect(),
        Err(_) => Vec::new(),
    }
}

/// Text content of an element with whitespace collapsed, skipping scripts and styles
fn element_text(element: ElementRef<'_>) -> String {
    let mut words: Vec<&str> = Vec::new();
    for node in element.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .is_some_and(|e| NON_CONTENT.contains(&e.name()))
        });
        if !hidden {
            words.extend(text.split_whitespace());
        }
    }
    words.join(" ")
}
