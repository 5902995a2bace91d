//! Single-page summary: title plus a bounded main-content snippet.

use html_scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};
use tipwire_core::{DocumentFetcher, Error, Result, SourceDescriptor};

pub const MAX_SNIPPET_CHARS: usize = 500;

/// Main-content containers, most specific first.
const CONTENT_SELECTORS: &[&str] = &["article", "main", ".content", "#content", ".post-body"];

const INVISIBLE_TAGS: &[&str] = &["script", "style", "noscript", "template", "head"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageSummary {
    pub success: bool,
    pub url: String,
    pub title: Option<String>,
    pub content_snippet: Option<String>,
    pub error: Option<String>,
    /// RFC 3339, UTC.
    pub timestamp: String,
}

impl PageSummary {
    pub fn failed(url: &str, error: &Error) -> Self {
        Self {
            success: false,
            url: url.to_string(),
            title: None,
            content_snippet: None,
            error: Some(error.to_string()),
            timestamp: now_rfc3339(),
        }
    }
}

/// Trim and default the scheme to `https://`.
pub fn normalize_url(raw: &str) -> Result<String> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(Error::InvalidUrl("missing url".to_string()));
    }
    let full = if s.starts_with("http://") || s.starts_with("https://") {
        s.to_string()
    } else {
        format!("https://{s}")
    };
    url::Url::parse(&full).map_err(|e| Error::InvalidUrl(format!("{full}: {e}")))?;
    Ok(full)
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Text of `el` without script/style content.
fn visible_text(el: &ElementRef) -> String {
    let mut parts = Vec::new();
    for node in el.descendants() {
        let Node::Text(t) = node.value() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .filter_map(ElementRef::wrap)
            .any(|a| INVISIBLE_TAGS.contains(&a.value().name()));
        if !hidden {
            parts.push(&**t);
        }
    }
    norm_ws(&parts.join(" "))
}

fn first_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .map(|el| visible_text(&el))
        .find(|t| !t.is_empty())
}

/// Cut to `max_chars`, marking the cut with `...`.
pub fn snippet(text: &str, max_chars: usize) -> String {
    let text = norm_ws(text);
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("...");
    out
}

/// Title and main content text (whitespace-collapsed, not yet bounded).
pub fn summarize_html(html: &str) -> (Option<String>, String) {
    let doc = Html::parse_document(html);
    let title = Selector::parse("title")
        .ok()
        .and_then(|sel| doc.select(&sel).next().map(|el| norm_ws(&el.text().collect::<String>())))
        .filter(|t| !t.is_empty());
    let content = CONTENT_SELECTORS
        .iter()
        .find_map(|sel| first_text(&doc, sel))
        .or_else(|| first_text(&doc, "body"))
        .unwrap_or_default();
    (title, content)
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Fetch `raw_url` and summarize it. Bad URLs and fetch failures are reported in the summary.
pub async fn scrape(fetcher: &dyn DocumentFetcher, raw_url: &str) -> PageSummary {
    let url = match normalize_url(raw_url) {
        Ok(u) => u,
        Err(e) => return PageSummary::failed(raw_url.trim(), &e),
    };
    let source = SourceDescriptor::new("scrape", url.as_str());
    match fetcher.fetch(&source).await {
        Ok(doc) => {
            let (title, content) = summarize_html(&doc.html_text);
            PageSummary {
                success: true,
                url,
                title,
                content_snippet: Some(snippet(&content, MAX_SNIPPET_CHARS)),
                error: None,
                timestamp: now_rfc3339(),
            }
        }
        Err(e) => {
            tracing::warn!(url = %url, fetcher = fetcher.name(), error = %e, "scrape failed");
            PageSummary::failed(&url, &e)
        }
    }
}
