use crate::consensus::aggregate;
use crate::extract::extract;
use crate::rank::assemble;
use crate::score::score;
use serde::Serialize;
use tipwire_core::{
    validate_sources, Candidate, DiagnosticKind, DocumentFetcher, Error, ExtractConfig,
    PipelineConfig, Result, ResultSet, SourceDescriptor, SourceDiagnostic, Tip,
};

#[derive(Debug, Clone, Serialize)]
pub struct PipelineOutput {
    pub results: ResultSet,
    /// One entry per source that was downgraded to zero candidates.
    pub diagnostics: Vec<SourceDiagnostic>,
    pub candidates_seen: usize,
    pub groups: usize,
}

async fn collect_source(
    source: &SourceDescriptor,
    fetcher: &dyn DocumentFetcher,
    cfg: &ExtractConfig,
) -> Result<Vec<Candidate>> {
    let doc = fetcher.fetch(source).await?;
    if doc.truncated {
        tracing::debug!(source_id = %source.id, "document truncated at byte cap");
    }
    Ok(extract(&doc, cfg)?)
}

fn diagnostic(source: &SourceDescriptor, err: &Error) -> SourceDiagnostic {
    let kind = match err {
        Error::Extract(_) => DiagnosticKind::Extraction,
        _ => DiagnosticKind::Transport,
    };
    SourceDiagnostic {
        source_id: source.id.clone(),
        url: source.url.clone(),
        kind,
        message: err.to_string(),
    }
}

/// Fetch, extract, group, score and rank tips from `sources`, one source at a time in order.
///
/// A failing source only loses its own candidates and adds a diagnostic. Configuration problems
/// (no sources, bad config, an unavailable fetcher) fail the whole run instead, so they cannot be
/// mistaken for a legitimate "no tips found" result.
pub async fn run_pipeline(
    sources: &[SourceDescriptor],
    fetcher: &dyn DocumentFetcher,
    cfg: &PipelineConfig,
) -> Result<PipelineOutput> {
    validate_sources(sources)?;
    cfg.validate()?;

    let mut candidates: Vec<Candidate> = Vec::new();
    let mut diagnostics = Vec::new();
    for source in sources {
        match collect_source(source, fetcher, &cfg.extract).await {
            Ok(found) => {
                tracing::info!(
                    source_id = %source.id,
                    fetcher = fetcher.name(),
                    candidates = found.len(),
                    "source processed"
                );
                candidates.extend(found);
            }
            Err(e) if e.is_fatal() => {
                tracing::error!(source_id = %source.id, error = %e, "aborting run");
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(source_id = %source.id, url = %source.url, error = %e, "source skipped");
                diagnostics.push(diagnostic(source, &e));
            }
        }
    }

    let groups = aggregate(&candidates);
    let group_count = groups.len();
    let scored: Vec<_> = groups
        .into_iter()
        .map(|g| {
            let s = score(&g, &cfg.scoring);
            (g, s)
        })
        .collect();
    let mut results = assemble(&scored, cfg.bucket_cap);
    if results.today_best.is_empty() {
        results.today_best.push(Tip::no_tips_found());
    }

    tracing::info!(
        sources = sources.len(),
        failed = diagnostics.len(),
        candidates = candidates.len(),
        groups = group_count,
        "pipeline finished"
    );
    Ok(PipelineOutput {
        results,
        diagnostics,
        candidates_seen: candidates.len(),
        groups: group_count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tipwire_core::{RawDocument, NO_TIPS_FOUND, UNKNOWN_HORSE};

    enum Page {
        Html(String),
        Timeout,
        Status(u16),
        Unavailable,
    }

    #[derive(Default)]
    struct StubFetcher {
        pages: HashMap<String, Page>,
        calls: Mutex<Vec<String>>,
    }

    impl StubFetcher {
        fn page(mut self, id: &str, p: Page) -> Self {
            self.pages.insert(id.to_string(), p);
            self
        }
    }

    #[async_trait::async_trait]
    impl DocumentFetcher for StubFetcher {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn fetch(&self, source: &SourceDescriptor) -> Result<RawDocument> {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(source.id.clone());
            match self.pages.get(&source.id) {
                Some(Page::Html(h)) => Ok(RawDocument::new(source.id.clone(), h.clone())),
                Some(Page::Timeout) => Err(Error::Timeout(source.url.clone())),
                Some(Page::Status(status)) => Err(Error::HttpStatus {
                    url: source.url.clone(),
                    status: *status,
                }),
                Some(Page::Unavailable) => {
                    Err(Error::NotConfigured("browser unavailable".to_string()))
                }
                None => Err(Error::Fetch("no such page".to_string())),
            }
        }
    }

    fn src(id: &str) -> SourceDescriptor {
        SourceDescriptor::new(id, format!("https://{id}.example/tips"))
    }

    fn tip_page(name: &str) -> Page {
        Page::Html(format!(
            r#"<div class="tip"><span class="horse">{name}</span> 5/1</div>"#
        ))
    }

    #[tokio::test]
    async fn three_sources_agreeing_on_a_name_make_one_group() {
        let fetcher = StubFetcher::default()
            .page("a", tip_page("golden arrow"))
            .page("b", tip_page("Golden Arrow"))
            .page("c", tip_page("GOLDEN ARROW"));
        let out = run_pipeline(
            &[src("a"), src("b"), src("c")],
            &fetcher,
            &PipelineConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(out.candidates_seen, 3);
        assert_eq!(out.groups, 1);
        assert!(out.diagnostics.is_empty());
        let best = &out.results.today_best;
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].ai_score, 85);
        assert_eq!(best[0].odds, "5/1");
        assert!(best[0].explanation.contains("3 sources agree"));
        assert_eq!(out.results.pick_of_day[0].ai_score, 85);
    }

    #[tokio::test]
    async fn a_timed_out_source_is_isolated() {
        let fetcher = StubFetcher::default()
            .page("a", tip_page("Golden Arrow"))
            .page("slow", Page::Timeout)
            .page("c", tip_page("Silver Bullet"));
        let out = run_pipeline(
            &[src("a"), src("slow"), src("c")],
            &fetcher,
            &PipelineConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(out.diagnostics.len(), 1);
        assert_eq!(out.diagnostics[0].source_id, "slow");
        assert_eq!(out.diagnostics[0].kind, DiagnosticKind::Transport);
        let names: Vec<_> = out
            .results
            .today_best
            .iter()
            .map(|t| t.horse.as_str())
            .collect();
        assert_eq!(names, vec!["Golden Arrow", "Silver Bullet"]);
        // The failure did not stop later sources, and nothing was retried.
        let calls = fetcher.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["a", "slow", "c"]);
    }

    #[tokio::test]
    async fn zero_sources_is_a_configuration_error() {
        let fetcher = StubFetcher::default();
        let err = run_pipeline(&[], &fetcher, &PipelineConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn anomaly_keyword_raises_the_score() {
        let fetcher = StubFetcher::default()
            .page(
                "a",
                Page::Html(
                    r#"<div class="tip"><span class="horse">Golden Arrow</span> first-time headgear</div>
                       <div class="tip"><span class="horse">Silver Bullet</span> in good form</div>"#
                        .to_string(),
                ),
            );
        let out = run_pipeline(&[src("a")], &fetcher, &PipelineConfig::default())
            .await
            .unwrap();
        let best = &out.results.today_best;
        assert_eq!(best[0].horse, "Golden Arrow");
        assert_eq!(best[0].ai_score, best[1].ai_score + 20);
    }

    #[tokio::test]
    async fn nothing_found_yields_the_sentinel_tip() {
        let fetcher = StubFetcher::default()
            .page("a", Page::Html("<p>closed today</p>".to_string()))
            .page("b", Page::Status(503));
        let out = run_pipeline(&[src("a"), src("b")], &fetcher, &PipelineConfig::default())
            .await
            .unwrap();
        assert_eq!(out.results.today_best.len(), 1);
        assert_eq!(out.results.today_best[0].horse, NO_TIPS_FOUND);
        assert_eq!(out.results.today_best[0].ai_score, 0);
        assert!(!out.results.has_tips());
        assert!(out.results.pick_of_day.is_empty());
        assert_eq!(out.results.anomalies.len(), 4);
        assert_eq!(out.diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn unusable_documents_become_extraction_diagnostics() {
        let fetcher = StubFetcher::default()
            .page("pdf", Page::Html("%PDF-1.4 binary".to_string()))
            .page("a", tip_page("Golden Arrow"));
        let out = run_pipeline(&[src("pdf"), src("a")], &fetcher, &PipelineConfig::default())
            .await
            .unwrap();
        assert_eq!(out.diagnostics.len(), 1);
        assert_eq!(out.diagnostics[0].kind, DiagnosticKind::Extraction);
        assert!(out.results.has_tips());
    }

    #[tokio::test]
    async fn nameless_tips_cannot_build_consensus() {
        let nameless = |extra: &str| {
            Page::Html(format!(
                r#"{extra}<div class="tip">@ 9/2 each way</div>
                   <div class="tip"><span class="runner-name"></span>@ 4/1</div>"#
            ))
        };
        let fetcher = StubFetcher::default()
            .page(
                "a",
                nameless(r#"<div class="tip"><span class="horse">Golden Arrow</span> 5/1</div>"#),
            )
            .page("b", nameless(""))
            .page("c", nameless(""));
        let out = run_pipeline(&[src("a"), src("b"), src("c")], &fetcher, &PipelineConfig::default())
            .await
            .unwrap();

        assert_eq!(out.results.pick_of_day[0].horse, "Golden Arrow");
        let best = &out.results.today_best;
        assert_eq!(best[0].horse, "Golden Arrow");
        // One placeholder per named-but-empty element, none merged, none with bare odds only.
        let placeholders: Vec<_> = best.iter().filter(|t| t.horse == UNKNOWN_HORSE).collect();
        assert_eq!(placeholders.len(), 3);
        assert!(placeholders.iter().all(|t| t.ai_score == best[0].ai_score));
        assert!(placeholders.iter().all(|t| !t.explanation.contains("3 sources")));
    }

    #[tokio::test]
    async fn unavailable_fetcher_fails_the_run() {
        let fetcher = StubFetcher::default()
            .page("a", Page::Unavailable)
            .page("b", tip_page("Golden Arrow"));
        let err = run_pipeline(&[src("a"), src("b")], &fetcher, &PipelineConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)));
    }

    #[tokio::test]
    async fn mention_count_grows_with_agreeing_sources() {
        let mut fetcher = StubFetcher::default();
        let mut sources = Vec::new();
        let mut last = 0u8;
        for i in 0..5 {
            let id = format!("s{i}");
            fetcher = fetcher.page(&id, tip_page("Golden Arrow"));
            sources.push(src(&id));
            let out = run_pipeline(&sources, &fetcher, &PipelineConfig::default())
                .await
                .unwrap();
            let s = out.results.today_best[0].ai_score;
            assert!(s >= last);
            last = s;
        }
        assert_eq!(last, 100);
    }
}
