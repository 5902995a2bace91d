//! Heuristic tip extraction from fetched markup.
//!
//! Source markup is unknown and unstable, so extraction is a chain of rules tried in priority
//! order. The first rule that yields at least one surviving candidate wins for that document:
//!
//! 1. [`StructuralRule`]: elements whose class/id carries tip vocabulary.
//! 2. [`LexicalRule`]: text-bearing leaf elements whose text carries tip vocabulary or `@`.
//!
//! Both rules produce [`TipBlock`]s; [`split_tip_text`] turns a block's text into a name and
//! odds when no nested name element was found.

use html_scraper::{ElementRef, Html, Selector};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use tipwire_core::{Candidate, ExtractConfig, RawDocument, UNKNOWN_HORSE};

const MAX_SNIPPET_CHARS: usize = 300;
const MAX_ODDS_CHARS: usize = 20;

/// Never part of tip content, and too broad to be a tip block.
const SKIP_TAGS: &[&str] = &[
    "html", "head", "body", "title", "meta", "link", "script", "style", "noscript", "template",
];

static RE_ODDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(\d{1,3}\s*/\s*\d{1,3}|\d{1,3}\.\d{1,2}|evens|evs)\b").expect("valid regex")
});
static RE_TIME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b((?:[01]?\d|2[0-3]):[0-5]\d(?:\s?[ap]m)?)\b").expect("valid regex")
});
static RE_AT_TRACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bat ([A-Z][A-Za-z'\-]+(?: [A-Z][A-Za-z'\-]+)?)").expect("valid regex")
});

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("document is empty")]
    EmptyDocument,
    #[error("document does not look like html ({0})")]
    NotHtml(&'static str),
}

impl From<ExtractError> for tipwire_core::Error {
    fn from(e: ExtractError) -> Self {
        tipwire_core::Error::Extract(e.to_string())
    }
}

/// A tip-like region of a document, before it is split into fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipBlock {
    /// Whitespace-normalized text of the whole block.
    pub text: String,
    /// Text of a nested name element, when the block has one (may be empty).
    pub name_hint: Option<String>,
    /// Text of a nested track/course element.
    pub track_hint: Option<String>,
}

pub trait ExtractionRule {
    fn name(&self) -> &'static str;
    fn blocks(&self, doc: &Html, cfg: &ExtractConfig) -> Vec<TipBlock>;
}

fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate_chars(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

fn contains_any(haystack_lc: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .any(|n| !n.is_empty() && haystack_lc.contains(&n.to_ascii_lowercase()))
}

fn class_or_id_lc(el: &ElementRef) -> String {
    let mut out = String::new();
    if let Some(c) = el.value().attr("class") {
        out.push_str(c);
        out.push(' ');
    }
    if let Some(i) = el.value().attr("id") {
        out.push_str(i);
    }
    out.to_ascii_lowercase()
}

fn is_skipped(el: &ElementRef) -> bool {
    SKIP_TAGS.contains(&el.value().name())
}

fn element_text(el: &ElementRef) -> String {
    norm_ws(&el.text().collect::<Vec<_>>().join(" "))
}

fn has_element_children(el: &ElementRef) -> bool {
    el.children().any(|c| c.value().is_element())
}

fn in_head(el: &ElementRef) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| a.value().name() == "head")
}

/// Proper descendants of `el` that are elements.
fn descendant_elements<'a>(el: &ElementRef<'a>) -> impl Iterator<Item = ElementRef<'a>> {
    el.descendants().skip(1).filter_map(ElementRef::wrap)
}

fn is_name_node(el: &ElementRef, cfg: &ExtractConfig) -> bool {
    contains_any(&class_or_id_lc(el), &cfg.name_class_tokens)
}

fn is_track_node(el: &ElementRef, cfg: &ExtractConfig) -> bool {
    contains_any(&class_or_id_lc(el), &cfg.track_class_tokens)
}

/// Elements whose class/id tokens carry tip vocabulary.
///
/// A matched element becomes a block when its subtree holds at most one name element, and, if it
/// holds none, when no nested element carries tip vocabulary either. The outermost such element
/// wins and its descendants are not considered again. This keeps `div.tip > span.horse-name` as
/// one block, and splits both `ul.selections > li.runner*` and `div.tips > div.tip*` into one
/// block per item.
pub struct StructuralRule;

impl ExtractionRule for StructuralRule {
    fn name(&self) -> &'static str {
        "structural"
    }

    fn blocks(&self, doc: &Html, cfg: &ExtractConfig) -> Vec<TipBlock> {
        let Ok(sel) = Selector::parse("*") else {
            return Vec::new();
        };
        let mut accepted = HashSet::new();
        let mut out = Vec::new();
        for el in doc.select(&sel) {
            if is_skipped(&el) || !contains_any(&class_or_id_lc(&el), &cfg.keywords) {
                continue;
            }
            if el.ancestors().any(|a| accepted.contains(&a.id())) {
                continue;
            }
            let name_nodes = usize::from(is_name_node(&el, cfg))
                + descendant_elements(&el)
                    .filter(|d| is_name_node(d, cfg))
                    .count();
            if name_nodes > 1 {
                continue;
            }
            if name_nodes == 0
                && descendant_elements(&el).any(|d| {
                    !is_track_node(&d, cfg) && contains_any(&class_or_id_lc(&d), &cfg.keywords)
                })
            {
                continue;
            }
            let text = element_text(&el);
            if text.is_empty() {
                continue;
            }
            accepted.insert(el.id());
            let name_hint = descendant_elements(&el)
                .find(|d| is_name_node(d, cfg))
                .map(|d| element_text(&d));
            let track_hint = descendant_elements(&el)
                .filter(|d| is_track_node(d, cfg))
                .map(|d| element_text(&d))
                .find(|t| !t.is_empty());
            out.push(TipBlock {
                text,
                name_hint,
                track_hint,
            });
        }
        out
    }
}

/// Text-bearing leaf elements whose text mentions tip vocabulary or the `@` odds marker.
pub struct LexicalRule;

impl ExtractionRule for LexicalRule {
    fn name(&self) -> &'static str {
        "lexical"
    }

    fn blocks(&self, doc: &Html, cfg: &ExtractConfig) -> Vec<TipBlock> {
        let Ok(sel) = Selector::parse("*") else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for el in doc.select(&sel) {
            if is_skipped(&el) || has_element_children(&el) || in_head(&el) {
                continue;
            }
            let text = element_text(&el);
            if text.is_empty() {
                continue;
            }
            let lc = text.to_lowercase();
            if !(lc.contains('@') || contains_any(&lc, &cfg.keywords)) {
                continue;
            }
            out.push(TipBlock {
                text,
                name_hint: None,
                track_hint: None,
            });
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitTip {
    pub name: String,
    pub odds: Option<String>,
}

/// Split tip text on the first boundary marker present, trying markers in configured order.
///
/// The text before the boundary is the name (cut to `max_name_chars`); the text after it is the
/// odds field when non-empty. Without any boundary the whole text is the name.
pub fn split_tip_text(text: &str, cfg: &ExtractConfig) -> SplitTip {
    let text = norm_ws(text);
    // ASCII lowercasing keeps byte offsets aligned with `text`.
    let lc = text.to_ascii_lowercase();
    for b in &cfg.boundaries {
        if b.is_empty() {
            continue;
        }
        let b_lc = b.to_ascii_lowercase();
        if let Some(pos) = lc.find(&b_lc) {
            let head = &text[..pos];
            let tail = &text[pos + b_lc.len()..];
            return SplitTip {
                name: clean_name(head, cfg.max_name_chars),
                odds: parse_odds(tail),
            };
        }
    }
    SplitTip {
        name: clean_name(&text, cfg.max_name_chars),
        odds: None,
    }
}

fn clean_name(s: &str, max_chars: usize) -> String {
    let trimmed = s.trim_matches(|c: char| c.is_whitespace() || matches!(c, '-' | '–' | ':' | '|' | ','));
    truncate_chars(trimmed, max_chars).trim_end().to_string()
}

fn find_odds_token(s: &str) -> Option<String> {
    RE_ODDS
        .captures(s)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().split_whitespace().collect::<String>())
}

fn parse_odds(tail: &str) -> Option<String> {
    let tail = tail.trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '@' | ':'));
    let tail = tail.trim();
    if tail.is_empty() {
        return None;
    }
    find_odds_token(tail).or_else(|| Some(truncate_chars(tail, MAX_ODDS_CHARS).trim_end().to_string()))
}

fn find_time(s: &str) -> Option<String> {
    RE_TIME
        .captures(s)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn find_track(s: &str) -> Option<String> {
    RE_AT_TRACK
        .captures(s)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

fn is_chrome(name: &str, cfg: &ExtractConfig) -> bool {
    name.chars().count() < cfg.min_name_chars || contains_any(&name.to_lowercase(), &cfg.denylist)
}

/// Turn one block into a candidate, or `None` when the name looks like navigation chrome.
pub fn block_to_candidate(
    block: &TipBlock,
    source_id: &str,
    cfg: &ExtractConfig,
) -> Option<Candidate> {
    let split = split_tip_text(&block.text, cfg);
    let hinted = block
        .name_hint
        .as_deref()
        .map(|h| clean_name(h, cfg.max_name_chars))
        .filter(|h| !h.is_empty());

    let (name, odds) = match hinted {
        Some(h) => (h, split.odds.or_else(|| find_odds_token(&block.text))),
        None if !split.name.is_empty() => (split.name, split.odds),
        // Only a present-but-empty name element earns the placeholder; bare odds text is noise.
        None if block.name_hint.is_some() => (UNKNOWN_HORSE.to_string(), split.odds),
        None => return None,
    };
    if is_chrome(&name, cfg) {
        return None;
    }

    Some(Candidate {
        source_id: source_id.to_string(),
        horse_name: name,
        odds,
        track: block
            .track_hint
            .clone()
            .or_else(|| find_track(&block.text)),
        time: find_time(&block.text),
        raw_snippet: truncate_chars(&block.text, MAX_SNIPPET_CHARS),
    })
}

/// Best-effort sniff for PDF bytes (magic header).
fn looks_like_pdf(text: &str) -> bool {
    text.trim_start().starts_with("%PDF-")
}

/// Best-effort sniff for common image formats that were decoded lossily as text.
fn looks_like_image(text: &str) -> bool {
    let b = text.as_bytes();
    b.starts_with(b"GIF87a") || b.starts_with(b"GIF89a") || text.starts_with("\u{FFFD}PNG")
}

/// Extract candidates from one document.
///
/// Zero candidates is a normal outcome. Errors are reserved for documents that cannot be tip
/// pages at all; callers downgrade them to a per-source diagnostic.
pub fn extract(
    document: &RawDocument,
    cfg: &ExtractConfig,
) -> Result<Vec<Candidate>, ExtractError> {
    let html = document.html_text.as_str();
    if html.trim().is_empty() {
        return Err(ExtractError::EmptyDocument);
    }
    if looks_like_pdf(html) {
        return Err(ExtractError::NotHtml("pdf"));
    }
    if looks_like_image(html) {
        return Err(ExtractError::NotHtml("image"));
    }
    if html.contains('\0') {
        return Err(ExtractError::NotHtml("binary"));
    }

    let doc = Html::parse_document(html);
    let rules: [&dyn ExtractionRule; 2] = [&StructuralRule, &LexicalRule];
    for rule in rules {
        let candidates: Vec<Candidate> = rule
            .blocks(&doc, cfg)
            .iter()
            .filter_map(|b| block_to_candidate(b, &document.source_id, cfg))
            .take(cfg.max_candidates_per_document)
            .collect();
        if !candidates.is_empty() {
            tracing::debug!(
                source_id = %document.source_id,
                rule = rule.name(),
                candidates = candidates.len(),
                "extracted candidates"
            );
            return Ok(candidates);
        }
    }
    tracing::debug!(source_id = %document.source_id, "no tip content found");
    Ok(Vec::new())
}
