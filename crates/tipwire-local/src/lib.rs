use std::time::{Duration, SystemTime};
use tipwire_core::{DocumentFetcher, Error, FetchOptions, RawDocument, Result, SourceDescriptor};

pub mod consensus;
pub mod extract;
pub mod page;
pub mod pipeline;
pub mod rank;
pub mod render_playwright;
pub mod score;

pub use pipeline::{run_pipeline, PipelineOutput};
pub use render_playwright::{PlaywrightSession, RenderOptions};

/// Desktop browser user agent; tip sites commonly serve bot-looking clients a stripped page.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

/// Response body plus the metadata callers care about.
#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub text: String,
    pub truncated: bool,
}

/// Cut `s` to at most `max_bytes`, backing off to a char boundary. Returns true if it cut.
pub(crate) fn truncate_at_char_boundary(s: &mut String, max_bytes: usize) -> bool {
    if s.len() <= max_bytes {
        return false;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    true
}

/// Plain HTTP GET document fetcher (no JavaScript rendering).
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    opts: FetchOptions,
}

impl HttpFetcher {
    pub fn new(opts: FetchOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(10))
            // Avoid "hang forever" on DNS/TLS/body stalls.
            .connect_timeout(Duration::from_secs(10))
            .timeout(opts.timeout())
            .build()
            .map_err(|e| Error::NotConfigured(format!("http client: {e}")))?;
        Ok(Self { client, opts })
    }

    fn map_err(url: &str, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::Timeout(format!("{url}: {e}"))
        } else {
            Error::Fetch(format!("{url}: {e}"))
        }
    }

    /// GET `url`, keeping at most `max_bytes` of the body. Non-2xx statuses are errors.
    pub async fn get(&self, url: &str) -> Result<FetchedBody> {
        let parsed = url::Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        let resp = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| Self::map_err(url, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        let final_url = resp.url().to_string();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let max_bytes = usize::try_from(self.opts.max_bytes).unwrap_or(usize::MAX);
        let mut truncated = false;
        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Self::map_err(url, e))?;
            if bytes.len().saturating_add(chunk.len()) > max_bytes {
                let can_take = max_bytes.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..can_take]);
                truncated = true;
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(FetchedBody {
            final_url,
            status: status.as_u16(),
            content_type,
            text: String::from_utf8_lossy(&bytes).to_string(),
            truncated,
        })
    }
}

#[async_trait::async_trait]
impl DocumentFetcher for HttpFetcher {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn fetch(&self, source: &SourceDescriptor) -> Result<RawDocument> {
        let t0 = std::time::Instant::now();
        let body = self.get(&source.url).await?;
        tracing::debug!(
            source_id = %source.id,
            status = body.status,
            bytes = body.text.len(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "fetched"
        );
        Ok(RawDocument {
            source_id: source.id.clone(),
            url: body.final_url,
            html_text: body.text,
            fetched_at: SystemTime::now(),
            truncated: body.truncated,
        })
    }
}
