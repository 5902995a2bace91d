use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, SystemTime};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("fetch timed out: {0}")]
    Timeout(String),
    #[error("http status {status} for {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("extraction failed: {0}")]
    Extract(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Fatal errors abort a whole pipeline run; everything else is isolated to one source.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Config(_) | Error::NotConfigured(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Display sentinel for absent odds/track/time on a [`Tip`].
pub const TBD: &str = "TBD";
/// Horse name used when a tip block was found but no name could be read from it.
pub const UNKNOWN_HORSE: &str = "Unknown runner";
/// Horse name of the sentinel tip emitted when a run found nothing.
pub const NO_TIPS_FOUND: &str = "No tips found";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub id: String,
    pub url: String,
}

impl SourceDescriptor {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
        }
    }

    /// Parse the `id=url` form used on the command line.
    pub fn parse_pair(s: &str) -> Result<Self> {
        let Some((id, url)) = s.split_once('=') else {
            return Err(Error::Config(format!(
                "source must look like id=url, got {s:?}"
            )));
        };
        Ok(Self::new(id.trim(), url.trim()))
    }
}

/// Reject source lists that cannot produce a meaningful run.
///
/// An empty list is a configuration failure, not a "no tips" outcome.
pub fn validate_sources(sources: &[SourceDescriptor]) -> Result<()> {
    if sources.is_empty() {
        return Err(Error::Config("no sources configured".to_string()));
    }
    let mut seen = BTreeSet::new();
    for s in sources {
        if s.id.trim().is_empty() {
            return Err(Error::Config(format!("source with url {} has an empty id", s.url)));
        }
        if !seen.insert(s.id.as_str()) {
            return Err(Error::Config(format!("duplicate source id: {}", s.id)));
        }
        let u = url::Url::parse(&s.url)
            .map_err(|e| Error::Config(format!("source {}: bad url {:?}: {e}", s.id, s.url)))?;
        if !matches!(u.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "source {}: unsupported scheme {}",
                s.id,
                u.scheme()
            )));
        }
    }
    Ok(())
}

/// One fetched document. Owned by a single run and dropped after extraction.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub source_id: String,
    pub url: String,
    pub html_text: String,
    pub fetched_at: SystemTime,
    /// True when the fetcher hit its byte cap.
    pub truncated: bool,
}

impl RawDocument {
    pub fn new(source_id: impl Into<String>, html_text: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            url: String::new(),
            html_text: html_text.into(),
            fetched_at: SystemTime::now(),
            truncated: false,
        }
    }
}

/// An extracted, unvalidated tip from a single source.
///
/// `odds`, `track` and `time` stay `None` when absent; only [`Tip`] renders them as [`TBD`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Candidate {
    pub source_id: String,
    pub horse_name: String,
    pub odds: Option<String>,
    pub track: Option<String>,
    pub time: Option<String>,
    pub raw_snippet: String,
}

impl Candidate {
    pub fn key(&self) -> String {
        normalize_key(&self.horse_name)
    }
}

/// Grouping key: case-folded, whitespace-collapsed horse name.
pub fn normalize_key(name: &str) -> String {
    name.split_whitespace()
        .map(|w| w.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Candidates across all sources that denote the same horse.
///
/// Invariants: `members` is non-empty and in first-seen order; `representative` is the first
/// member with null fields filled from later members; `mention_count` is the number of distinct
/// `source_id`s among `members`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConsensusGroup {
    pub key: String,
    pub members: Vec<Candidate>,
    pub representative: Candidate,
    pub mention_count: usize,
}

impl ConsensusGroup {
    pub fn sources(&self) -> BTreeSet<&str> {
        self.members.iter().map(|c| c.source_id.as_str()).collect()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Score {
    pub ai_score: u8,
    pub probability: String,
    pub explanation: String,
    /// True when the anomaly bonus was applied.
    pub anomaly: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tip {
    pub horse: String,
    pub track: String,
    pub time: String,
    pub odds: String,
    pub ai_score: u8,
    pub probability: String,
    pub explanation: String,
    pub highlighted: bool,
}

impl Tip {
    pub fn from_scored(group: &ConsensusGroup, score: &Score) -> Self {
        let rep = &group.representative;
        let or_tbd = |v: &Option<String>| v.clone().unwrap_or_else(|| TBD.to_string());
        Self {
            horse: rep.horse_name.clone(),
            track: or_tbd(&rep.track),
            time: or_tbd(&rep.time),
            odds: or_tbd(&rep.odds),
            ai_score: score.ai_score,
            probability: score.probability.clone(),
            explanation: score.explanation.clone(),
            highlighted: false,
        }
    }

    pub fn no_tips_found() -> Self {
        Self {
            horse: NO_TIPS_FOUND.to_string(),
            track: TBD.to_string(),
            time: TBD.to_string(),
            odds: TBD.to_string(),
            ai_score: 0,
            probability: "0-0%".to_string(),
            explanation: "No tip content was found on any configured source".to_string(),
            highlighted: false,
        }
    }

    pub fn is_no_tips_sentinel(&self) -> bool {
        self.ai_score == 0 && self.horse == NO_TIPS_FOUND
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResultSet {
    pub pick_of_day: Vec<Tip>,
    pub today_best: Vec<Tip>,
    pub tomorrow_best: Vec<Tip>,
    pub look_at_these: Vec<Tip>,
    pub anomalies: Vec<Tip>,
}

impl ResultSet {
    /// False when `today_best` is empty or only carries the "no tips" sentinel.
    pub fn has_tips(&self) -> bool {
        self.today_best.iter().any(|t| !t.is_no_tips_sentinel())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Transport,
    Extraction,
}

/// A per-source failure that was isolated and downgraded to "zero candidates".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceDiagnostic {
    pub source_id: String,
    pub url: String,
    pub kind: DiagnosticKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExtractConfig {
    pub min_name_chars: usize,
    pub max_name_chars: usize,
    pub max_candidates_per_document: usize,
    /// Class/id and text vocabulary that marks tip content.
    pub keywords: Vec<String>,
    /// Class/id tokens that mark the element holding the horse name.
    pub name_class_tokens: Vec<String>,
    /// Class/id tokens that mark the element holding the track/course.
    pub track_class_tokens: Vec<String>,
    /// Name substrings that indicate navigation chrome.
    pub denylist: Vec<String>,
    /// Ordered split markers; the first one present wins.
    pub boundaries: Vec<String>,
}

fn strings(xs: &[&str]) -> Vec<String> {
    xs.iter().map(|s| s.to_string()).collect()
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            min_name_chars: 4,
            max_name_chars: 50,
            max_candidates_per_document: 8,
            keywords: strings(&["tip", "bet", "selection", "horse", "runner", "pick", "nap"]),
            name_class_tokens: strings(&["horse", "runner", "name"]),
            track_class_tokens: strings(&["track", "course", "venue", "meeting"]),
            denylist: strings(&["home", "latest", "video"]),
            boundaries: strings(&[" to win", "@", " on "]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ScoringConfig {
    pub base: i64,
    pub consensus_weight: i64,
    pub anomaly_bonus: i64,
    pub flag_keywords: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            base: 40,
            consensus_weight: 15,
            anomaly_bonus: 20,
            flag_keywords: strings(&["trainer", "headgear", "odds", "class"]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    pub extract: ExtractConfig,
    pub scoring: ScoringConfig,
    pub bucket_cap: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extract: ExtractConfig::default(),
            scoring: ScoringConfig::default(),
            bucket_cap: 8,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        let e = &self.extract;
        if e.max_name_chars == 0 || e.min_name_chars > e.max_name_chars {
            return Err(Error::Config(format!(
                "name length bounds are inconsistent (min={}, max={})",
                e.min_name_chars, e.max_name_chars
            )));
        }
        if e.max_candidates_per_document == 0 {
            return Err(Error::Config(
                "max_candidates_per_document must be at least 1".to_string(),
            ));
        }
        if e.boundaries.iter().all(|b| b.is_empty()) {
            return Err(Error::Config("at least one split boundary is required".to_string()));
        }
        if self.bucket_cap == 0 {
            return Err(Error::Config("bucket_cap must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// On-disk run configuration (`--config`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TipwireConfig {
    pub sources: Vec<SourceDescriptor>,
    pub pipeline: PipelineConfig,
}

impl TipwireConfig {
    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::Config(format!("bad config json: {e}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOptions {
    /// Timeout for one source (network + render).
    pub timeout_ms: u64,
    /// Hard cap on bytes kept from one document.
    pub max_bytes: u64,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            max_bytes: 5_000_000,
        }
    }
}

impl FetchOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// The "document fetcher" collaborator: plain HTTP, a rendering browser, or a test stub.
#[async_trait::async_trait]
pub trait DocumentFetcher: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch(&self, source: &SourceDescriptor) -> Result<RawDocument>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_key_folds_case_and_whitespace() {
        assert_eq!(normalize_key("  Golden\tArrow "), "golden arrow");
        assert_eq!(normalize_key("GOLDEN   ARROW"), "golden arrow");
        assert_eq!(normalize_key("golden arrow"), normalize_key("Golden Arrow"));
    }

    #[test]
    fn parse_pair_splits_on_first_equals() {
        let s = SourceDescriptor::parse_pair("racing=https://example.com/?a=b").unwrap();
        assert_eq!(s.id, "racing");
        assert_eq!(s.url, "https://example.com/?a=b");
        assert!(SourceDescriptor::parse_pair("no-equals").is_err());
    }

    #[test]
    fn validate_sources_rejects_empty_duplicates_and_bad_urls() {
        let err = validate_sources(&[]).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("no sources"));

        let dup = vec![
            SourceDescriptor::new("a", "https://a.example/"),
            SourceDescriptor::new("a", "https://b.example/"),
        ];
        assert!(matches!(validate_sources(&dup), Err(Error::Config(_))));

        let bad = vec![SourceDescriptor::new("a", "not a url")];
        assert!(matches!(validate_sources(&bad), Err(Error::Config(_))));

        let ftp = vec![SourceDescriptor::new("a", "ftp://a.example/")];
        assert!(matches!(validate_sources(&ftp), Err(Error::Config(_))));

        let ok = vec![
            SourceDescriptor::new("a", "https://a.example/"),
            SourceDescriptor::new("b", "http://127.0.0.1:8080/tips"),
        ];
        validate_sources(&ok).unwrap();
    }

    #[test]
    fn transport_errors_are_not_fatal() {
        assert!(!Error::Timeout("x".into()).is_fatal());
        assert!(!Error::Fetch("x".into()).is_fatal());
        assert!(!Error::HttpStatus {
            url: "u".into(),
            status: 503
        }
        .is_fatal());
        assert!(!Error::Extract("x".into()).is_fatal());
        assert!(Error::NotConfigured("node".into()).is_fatal());
    }

    #[test]
    fn partial_config_json_keeps_defaults() {
        let cfg = TipwireConfig::from_json(
            r#"{"sources":[{"id":"a","url":"https://a.example/"}],"pipeline":{"scoring":{"base":30}}}"#,
        )
        .unwrap();
        assert_eq!(cfg.sources.len(), 1);
        assert_eq!(cfg.pipeline.scoring.base, 30);
        assert_eq!(cfg.pipeline.scoring.consensus_weight, 15);
        assert_eq!(cfg.pipeline.bucket_cap, 8);
        assert_eq!(cfg.pipeline.extract.boundaries[0], " to win");
        cfg.pipeline.validate().unwrap();
    }

    #[test]
    fn pipeline_config_validate_catches_inverted_bounds() {
        let mut cfg = PipelineConfig::default();
        cfg.extract.min_name_chars = 80;
        assert!(cfg.validate().is_err());
        let mut cfg = PipelineConfig::default();
        cfg.bucket_cap = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn tip_from_scored_renders_missing_fields_as_tbd() {
        let c = Candidate {
            source_id: "a".into(),
            horse_name: "Golden Arrow".into(),
            odds: Some("5/1".into()),
            track: None,
            time: None,
            raw_snippet: "Golden Arrow to win 5/1".into(),
        };
        let g = ConsensusGroup {
            key: c.key(),
            members: vec![c.clone()],
            representative: c,
            mention_count: 1,
        };
        let s = Score {
            ai_score: 55,
            probability: "40-55%".into(),
            explanation: "x".into(),
            anomaly: false,
        };
        let t = Tip::from_scored(&g, &s);
        assert_eq!(t.odds, "5/1");
        assert_eq!(t.track, TBD);
        assert_eq!(t.time, TBD);
        assert!(!t.highlighted);
    }

    #[test]
    fn result_set_serializes_with_bucket_names() {
        let mut rs = ResultSet::default();
        assert!(!rs.has_tips());
        rs.today_best.push(Tip::no_tips_found());
        assert!(!rs.has_tips());
        let v = serde_json::to_value(&rs).unwrap();
        for k in [
            "pick_of_day",
            "today_best",
            "tomorrow_best",
            "look_at_these",
            "anomalies",
        ] {
            assert!(v.get(k).is_some(), "missing bucket {k}");
        }
        assert_eq!(v["today_best"][0]["ai_score"], 0);
        assert_eq!(v["today_best"][0]["highlighted"], false);
    }
}
