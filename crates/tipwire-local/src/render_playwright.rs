//! Headless-browser document fetcher.
//!
//! One Chromium instance is launched per run through a Node.js child process running
//! Playwright. Requests and replies are JSON lines over stdin/stdout, so each source reuses the
//! same browser. [`PlaywrightSession::close`] tears it down; the child is also killed on drop, so
//! an early return or panic cannot leak a browser.

use crate::{truncate_at_char_boundary, USER_AGENT};
use std::process::Stdio;
use std::time::{Duration, SystemTime};
use tipwire_core::{DocumentFetcher, Error, FetchOptions, RawDocument, Result, SourceDescriptor};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

const JS: &str = r#"
const readline = require('readline');

function out(obj) { process.stdout.write(JSON.stringify(obj) + '\n'); }
function bad(code, message, hint) { out({ ok: false, error: { code, message, hint } }); }
function msg(e) { return String(e && e.message ? e.message : e); }

async function main() {
  let pw;
  try { pw = require('playwright'); } catch (e) {
    return bad('not_configured',
      'Playwright is not installed for Node.js (require("playwright") failed)',
      'Install Playwright (Node): `npm i -g playwright` and then `npx playwright install chromium`.');
  }

  const proxy = (process.env.TIPWIRE_RENDER_PROXY || '').trim();
  let browser;
  try {
    const launchOpts = { headless: true };
    if (proxy) launchOpts.proxy = { server: proxy };
    browser = await pw.chromium.launch(launchOpts);
  } catch (e) {
    return bad('not_configured', 'Chromium launch failed: ' + msg(e),
      'Install the browser with `npx playwright install chromium`.');
  }
  out({ ok: true, ready: true });

  const rl = readline.createInterface({ input: process.stdin, terminal: false });
  try {
    // Sequential on purpose: one page at a time, in request order.
    for await (const line of rl) {
      if (!line.trim()) continue;
      let req;
      try { req = JSON.parse(line); } catch (e) { bad('invalid_params', 'bad JSON request', ''); continue; }
      const timeoutMs = Number(req.timeout_ms || 45000);
      const t0 = Date.now();
      let context;
      try {
        context = await browser.newContext({
          viewport: { width: 1280, height: 800 },
          userAgent: req.user_agent,
          serviceWorkers: 'block',
        });
        const page = await context.newPage();
        const resp = await page.goto(req.url, { waitUntil: 'domcontentloaded', timeout: timeoutMs });
        // Best-effort settle; tip widgets often load after DOMContentLoaded.
        try { await page.waitForLoadState('networkidle', { timeout: Math.min(5000, timeoutMs) }); } catch (_) {}
        let html = await page.content();
        let truncated = false;
        const maxBytes = Number(req.max_bytes || 0);
        if (maxBytes > 0 && Buffer.byteLength(html, 'utf8') > maxBytes) {
          html = Buffer.from(html, 'utf8').subarray(0, maxBytes).toString('utf8');
          truncated = true;
        }
        out({ ok: true, final_url: page.url(), status: resp ? resp.status() : null, html, truncated, elapsed_ms: Date.now() - t0 });
      } catch (e) {
        bad(e && e.name === 'TimeoutError' ? 'timeout' : 'fetch_failed', msg(e), '');
      } finally {
        try { if (context) await context.close(); } catch (_) {}
      }
    }
  } finally {
    try { await browser.close(); } catch (_) {}
  }
}

main().catch((e) => bad('fetch_failed', msg(e), 'Playwright render failed.'));
"#;

fn env_truthy(k: &str) -> bool {
    matches!(
        std::env::var(k)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_nonempty(k: &str) -> Option<String> {
    std::env::var(k)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn node_path_candidates() -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(std::path::PathBuf::from) {
        out.push(
            home.join(".npm-global")
                .join("lib")
                .join("node_modules")
                .to_string_lossy()
                .to_string(),
        );
    }
    out.push("/opt/homebrew/lib/node_modules".to_string());
    out.push("/usr/local/lib/node_modules".to_string());
    out.push("/usr/lib/node_modules".to_string());
    out
}

fn dir_has_playwright(root: &str) -> bool {
    std::path::PathBuf::from(root.trim()).join("playwright").is_dir()
}

/// A `NODE_PATH` that lets Node resolve a globally installed `playwright`, if one is needed.
///
/// `None` means either the existing `NODE_PATH` already works or nothing was found.
pub fn playwright_node_path() -> Option<String> {
    if let Some(v) = env_nonempty("TIPWIRE_NODE_PATH") {
        return Some(v);
    }
    let existing = std::env::var("NODE_PATH").unwrap_or_default();
    if existing.split(':').any(|p| !p.trim().is_empty() && dir_has_playwright(p)) {
        return None;
    }

    let npm_root = std::process::Command::new("npm")
        .args(["root", "-g"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty() && dir_has_playwright(s));
    let found = npm_root.or_else(|| {
        node_path_candidates()
            .into_iter()
            .find(|r| dir_has_playwright(r))
    })?;

    if existing.trim().is_empty() {
        Some(found)
    } else {
        Some(format!("{existing}:{found}"))
    }
}

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub fetch: FetchOptions,
    pub node_bin: String,
    pub proxy: Option<String>,
    /// Deterministic "not configured" (tests, environments without Node).
    pub disabled: bool,
    /// Slack on top of `fetch.timeout_ms` before a silent session is declared hung.
    pub hard_timeout_grace_ms: u64,
}

impl RenderOptions {
    /// Read `TIPWIRE_NODE`, `TIPWIRE_RENDER_PROXY` and `TIPWIRE_RENDER_DISABLE`.
    pub fn from_env(fetch: FetchOptions) -> Self {
        Self {
            fetch,
            node_bin: env_nonempty("TIPWIRE_NODE").unwrap_or_else(|| "node".to_string()),
            proxy: env_nonempty("TIPWIRE_RENDER_PROXY"),
            disabled: env_truthy("TIPWIRE_RENDER_DISABLE"),
            hard_timeout_grace_ms: 10_000,
        }
    }

    /// Wall-clock bound for one reply; the script enforces `timeout_ms` itself, this catches hangs.
    fn hard_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch.timeout_ms.saturating_add(self.hard_timeout_grace_ms))
    }
}

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub final_url: String,
    pub status: Option<u16>,
    pub html: String,
    pub elapsed_ms: u64,
    /// True when the HTML was cut at the byte cap.
    pub truncated: bool,
}

struct SessionIo {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    alive: bool,
}

impl SessionIo {
    async fn kill(&mut self) {
        self.alive = false;
        self.stdin = None;
        let _ = self.child.kill().await;
    }
}

pub struct PlaywrightSession {
    io: Mutex<SessionIo>,
    opts: RenderOptions,
}

fn error_from_reply(v: &serde_json::Value) -> Error {
    let code = v
        .pointer("/error/code")
        .and_then(|x| x.as_str())
        .unwrap_or("fetch_failed");
    let message = v
        .pointer("/error/message")
        .and_then(|x| x.as_str())
        .unwrap_or("Playwright render failed");
    let hint = v
        .pointer("/error/hint")
        .and_then(|x| x.as_str())
        .unwrap_or("")
        .trim();
    let text = if hint.is_empty() {
        message.to_string()
    } else {
        format!("{message}. {hint}")
    };
    match code {
        "not_configured" => Error::NotConfigured(text),
        "invalid_params" => Error::InvalidUrl(text),
        "timeout" => Error::Timeout(text),
        _ => Error::Fetch(text),
    }
}

/// Parse one reply line from the render script.
fn parse_reply(line: &str, url: &str, max_bytes: usize) -> Result<RenderedPage> {
    let v: serde_json::Value = serde_json::from_str(line.trim())
        .map_err(|e| Error::Fetch(format!("Playwright render returned invalid JSON: {e}")))?;
    if v.get("ok").and_then(|x| x.as_bool()) != Some(true) {
        return Err(error_from_reply(&v));
    }
    let status = v.get("status").and_then(|x| x.as_u64()).map(|n| n as u16);
    if let Some(s) = status {
        if !(200..300).contains(&s) {
            return Err(Error::HttpStatus {
                url: url.to_string(),
                status: s,
            });
        }
    }
    let mut html = v
        .get("html")
        .and_then(|x| x.as_str())
        .unwrap_or("")
        .to_string();
    if html.trim().is_empty() {
        return Err(Error::Fetch("Playwright render returned empty HTML".to_string()));
    }
    let cut_by_script = v.get("truncated").and_then(|x| x.as_bool()).unwrap_or(false);
    let truncated = truncate_at_char_boundary(&mut html, max_bytes) || cut_by_script;
    Ok(RenderedPage {
        final_url: v
            .get("final_url")
            .and_then(|x| x.as_str())
            .unwrap_or(url)
            .to_string(),
        status,
        html,
        elapsed_ms: v.get("elapsed_ms").and_then(|x| x.as_u64()).unwrap_or(0),
        truncated,
    })
}

impl SessionIo {
    /// Start Node + Chromium and wait until the browser is ready.
    async fn spawn(opts: &RenderOptions) -> Result<Self> {
        let mut cmd = tokio::process::Command::new(&opts.node_bin);
        if let Some(node_path) = playwright_node_path() {
            cmd.env("NODE_PATH", node_path);
        }
        if let Some(proxy) = &opts.proxy {
            cmd.env("TIPWIRE_RENDER_PROXY", proxy);
        }
        let mut child = cmd
            .arg("-e")
            .arg(JS)
            .kill_on_drop(true)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                Error::NotConfigured(format!(
                    "Playwright render requires Node.js ({}) and the Playwright npm package: {e}",
                    opts.node_bin
                ))
            })?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::NotConfigured("Playwright render: missing stdout pipe".to_string()))?;
        let mut io = SessionIo {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            alive: true,
        };

        let ready = tokio::time::timeout(opts.hard_timeout(), io.stdout.next_line()).await;
        let line = match ready {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) | Ok(Err(_)) => {
                io.kill().await;
                return Err(Error::NotConfigured(
                    "Playwright render process exited before becoming ready".to_string(),
                ));
            }
            Err(_) => {
                io.kill().await;
                return Err(Error::NotConfigured(format!(
                    "Playwright browser did not start within {}ms",
                    opts.hard_timeout().as_millis()
                )));
            }
        };
        let v: serde_json::Value = serde_json::from_str(line.trim()).map_err(|e| {
            Error::NotConfigured(format!("Playwright render returned invalid JSON: {e}"))
        })?;
        if v.get("ready").and_then(|x| x.as_bool()) != Some(true) {
            io.kill().await;
            return Err(match error_from_reply(&v) {
                e @ Error::NotConfigured(_) => e,
                other => Error::NotConfigured(other.to_string()),
            });
        }
        Ok(io)
    }
}

impl PlaywrightSession {
    /// Start the render session.
    ///
    /// Any failure here is `Error::NotConfigured`: without a browser there is no run.
    pub async fn launch(opts: RenderOptions) -> Result<Self> {
        if opts.disabled {
            return Err(Error::NotConfigured(
                "render backend disabled (TIPWIRE_RENDER_DISABLE)".to_string(),
            ));
        }
        let io = SessionIo::spawn(&opts).await?;
        tracing::info!(node = %opts.node_bin, "render session ready");
        Ok(Self {
            io: Mutex::new(io),
            opts,
        })
    }

    /// Render one URL in a fresh browser context.
    pub async fn render(&self, url: &str) -> Result<RenderedPage> {
        let mut io = self.io.lock().await;
        if !io.alive {
            // A previous source hung or crashed the browser; later sources get a fresh one.
            tracing::info!(url, "relaunching render session");
            *io = SessionIo::spawn(&self.opts)
                .await
                .map_err(|e| Error::Fetch(format!("render session relaunch failed: {e}")))?;
        }
        let req = serde_json::json!({
            "url": url,
            "timeout_ms": self.opts.fetch.timeout_ms,
            "max_bytes": self.opts.fetch.max_bytes,
            "user_agent": USER_AGENT,
        });
        let Some(stdin) = io.stdin.as_mut() else {
            return Err(Error::Fetch("render session stdin closed".to_string()));
        };
        let mut line = req.to_string();
        line.push('\n');
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            io.kill().await;
            return Err(Error::Fetch(format!("render session write failed: {e}")));
        }
        let _ = stdin.flush().await;

        let hard = self.opts.hard_timeout();
        let reply = tokio::time::timeout(hard, io.stdout.next_line()).await;
        match reply {
            Ok(Ok(Some(reply))) => {
                let max_bytes = usize::try_from(self.opts.fetch.max_bytes).unwrap_or(usize::MAX);
                parse_reply(&reply, url, max_bytes)
            }
            Ok(Ok(None)) | Ok(Err(_)) => {
                io.kill().await;
                Err(Error::Fetch("render process exited".to_string()))
            }
            Err(_) => {
                // A hung browser cannot be trusted with the next source either.
                io.kill().await;
                Err(Error::Timeout(format!(
                    "{url}: render hard timeout after {}ms",
                    hard.as_millis()
                )))
            }
        }
    }

    /// Close the browser and wait for the child to exit, killing it if it lingers.
    pub async fn close(self) {
        let mut io = self.io.into_inner();
        if !io.alive {
            let _ = io.child.wait().await;
            return;
        }
        // EOF ends the script's request loop, which closes the browser.
        io.stdin = None;
        match tokio::time::timeout(Duration::from_secs(10), io.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                io.kill().await;
                let _ = io.child.wait().await;
            }
        }
        tracing::debug!("render session closed");
    }
}

#[async_trait::async_trait]
impl DocumentFetcher for PlaywrightSession {
    fn name(&self) -> &'static str {
        "playwright"
    }

    async fn fetch(&self, source: &SourceDescriptor) -> Result<RawDocument> {
        let page = self.render(&source.url).await?;
        tracing::debug!(
            source_id = %source.id,
            status = ?page.status,
            elapsed_ms = page.elapsed_ms,
            "rendered"
        );
        Ok(RawDocument {
            source_id: source.id.clone(),
            url: page.final_url,
            html_text: page.html,
            truncated: page.truncated,
            fetched_at: SystemTime::now(),
        })
    }
}
