use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tipwire_core::{
    validate_sources, DocumentFetcher, FetchOptions, PipelineConfig, SourceDescriptor, Tip,
    TipwireConfig,
};
use tipwire_local::page::{self, PageSummary};
use tipwire_local::render_playwright::playwright_node_path;
use tipwire_local::{run_pipeline, HttpFetcher, PipelineOutput, PlaywrightSession, RenderOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tipwire")]
#[command(about = "Horse racing tip aggregation: scrape, agree, score, rank", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch every tip source, group agreeing tips and print the ranked buckets.
    Run(RunCmd),
    /// Summarize one page: title plus a short main-content snippet (json).
    Scrape(ScrapeCmd),
    /// Print today's date in UTC (json).
    Today,
    /// Diagnose configuration/launch issues (json; no network fetch).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum FetcherKind {
    /// Plain HTTP GET, no JavaScript.
    Http,
    /// Headless Chromium via Node + Playwright.
    Playwright,
}

#[derive(clap::Args, Debug)]
struct FetchArgs {
    /// Document fetcher backend.
    #[arg(long, value_enum, env = "TIPWIRE_FETCHER", default_value = "http")]
    fetcher: FetcherKind,
    /// Per-source timeout (ms). Defaults to 30000 for http and 45000 for playwright.
    #[arg(long, env = "TIPWIRE_TIMEOUT_MS")]
    timeout_ms: Option<u64>,
    /// Maximum bytes of markup kept per document.
    #[arg(long, default_value_t = 5_000_000)]
    max_bytes: u64,
}

impl FetchArgs {
    fn options(&self) -> FetchOptions {
        let default_timeout = match self.fetcher {
            FetcherKind::Http => 30_000,
            FetcherKind::Playwright => 45_000,
        };
        FetchOptions {
            timeout_ms: self.timeout_ms.unwrap_or(default_timeout),
            max_bytes: self.max_bytes,
        }
    }
}

#[derive(clap::Args, Debug)]
struct RunCmd {
    /// JSON config file: {"sources": [{"id", "url"}], "pipeline": {...}}.
    #[arg(long, env = "TIPWIRE_CONFIG")]
    config: Option<PathBuf>,
    /// Tip source as `id=url` (repeatable; appended after config-file sources).
    #[arg(long = "source", value_name = "ID=URL")]
    sources: Vec<String>,
    #[command(flatten)]
    fetch: FetchArgs,
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

#[derive(clap::Args, Debug)]
struct ScrapeCmd {
    /// Page URL; `https://` is assumed when no scheme is given.
    url: String,
    #[command(flatten)]
    fetch: FetchArgs,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
    /// Config file to load and validate.
    #[arg(long, env = "TIPWIRE_CONFIG")]
    config: Option<PathBuf>,
    /// Timeout for each Node probe (ms).
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format: json|text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

/// The fetcher a command runs against. A render session owns a browser and must be closed.
enum Backend {
    Http(HttpFetcher),
    Playwright(PlaywrightSession),
}

impl Backend {
    async fn open(args: &FetchArgs) -> tipwire_core::Result<Self> {
        let opts = args.options();
        match args.fetcher {
            FetcherKind::Http => Ok(Backend::Http(HttpFetcher::new(opts)?)),
            FetcherKind::Playwright => Ok(Backend::Playwright(
                PlaywrightSession::launch(RenderOptions::from_env(opts)).await?,
            )),
        }
    }

    fn fetcher(&self) -> &dyn DocumentFetcher {
        match self {
            Backend::Http(f) => f as &dyn DocumentFetcher,
            Backend::Playwright(s) => s as &dyn DocumentFetcher,
        }
    }

    async fn close(self) {
        if let Backend::Playwright(s) = self {
            s.close().await;
        }
    }
}

/// Sets variables from `TIPWIRE_ENV_FILE` that the process environment does not already have.
fn load_env_file() {
    let Ok(p) = std::env::var("TIPWIRE_ENV_FILE") else {
        return;
    };
    let p = p.trim();
    if p.is_empty() {
        return;
    }
    let Ok(txt) = std::fs::read_to_string(p) else {
        return;
    };
    for raw in txt.lines() {
        let s = raw.trim();
        if s.is_empty() || s.starts_with('#') {
            continue;
        }
        let Some((k, v)) = s.split_once('=') else {
            continue;
        };
        let k = k.trim();
        if k.is_empty() {
            continue;
        }
        if std::env::var_os(k).is_none() {
            std::env::set_var(k, v.trim());
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<TipwireConfig> {
    let Some(path) = path else {
        return Ok(TipwireConfig::default());
    };
    let txt = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    Ok(TipwireConfig::from_json(&txt)?)
}

fn run_inputs(args: &RunCmd) -> Result<(Vec<SourceDescriptor>, PipelineConfig)> {
    let TipwireConfig {
        mut sources,
        pipeline,
    } = load_config(args.config.as_ref())?;
    for pair in &args.sources {
        sources.push(SourceDescriptor::parse_pair(pair)?);
    }
    validate_sources(&sources)?;
    pipeline.validate()?;
    Ok((sources, pipeline))
}

fn tip_line(t: &Tip) -> String {
    format!(
        "{:>3}  {:<28} {:<16} {:<8} {:<8} {}",
        t.ai_score, t.horse, t.track, t.time, t.odds, t.probability
    )
}

fn render_text(out: &PipelineOutput) -> String {
    let rs = &out.results;
    let buckets: [(&str, &[Tip]); 5] = [
        ("pick_of_day", &rs.pick_of_day),
        ("today_best", &rs.today_best),
        ("tomorrow_best", &rs.tomorrow_best),
        ("look_at_these", &rs.look_at_these),
        ("anomalies", &rs.anomalies),
    ];
    let mut s = String::new();
    for (name, tips) in buckets {
        s.push_str(&format!("== {name} ({}) ==\n", tips.len()));
        for t in tips {
            s.push_str(&tip_line(t));
            s.push('\n');
        }
    }
    for d in &out.diagnostics {
        s.push_str(&format!("! {} ({:?}): {}\n", d.source_id, d.kind, d.message));
    }
    s.push_str(&format!(
        "candidates={} groups={} failed_sources={}\n",
        out.candidates_seen,
        out.groups,
        out.diagnostics.len()
    ));
    s
}

async fn probe(mut cmd: tokio::process::Command, timeout: Duration) -> (bool, Option<String>) {
    cmd.kill_on_drop(true)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(o)) if o.status.success() => (true, None),
        Ok(Ok(o)) => {
            let stderr = String::from_utf8_lossy(&o.stderr);
            let first = stderr.lines().next().unwrap_or("").trim().to_string();
            (false, Some(format!("exit {}: {first}", o.status)))
        }
        Ok(Err(e)) => (false, Some(e.to_string())),
        Err(_) => (false, Some(format!("timed out after {}ms", timeout.as_millis()))),
    }
}

fn check(name: &str, ok: bool, skipped: bool, error: Option<String>) -> serde_json::Value {
    serde_json::json!({
        "name": name,
        "ok": ok,
        "skipped": skipped,
        "error": error,
    })
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive("tipwire=info".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env_file();
    let cli = Cli::parse();
    init_tracing()?;

    match cli.command {
        Commands::Run(args) => {
            let (sources, cfg) = run_inputs(&args)?;
            let backend = Backend::open(&args.fetch).await?;
            tracing::info!(
                sources = sources.len(),
                fetcher = backend.fetcher().name(),
                "run starting"
            );
            let result = run_pipeline(&sources, backend.fetcher(), &cfg).await;
            backend.close().await;
            let out = result?;
            match args.output.to_ascii_lowercase().as_str() {
                "text" => print!("{}", render_text(&out)),
                _ => println!("{}", serde_json::to_string_pretty(&out)?),
            }
        }
        Commands::Scrape(args) => {
            let summary = match Backend::open(&args.fetch).await {
                Ok(backend) => {
                    let s = page::scrape(backend.fetcher(), &args.url).await;
                    backend.close().await;
                    s
                }
                Err(e) => PageSummary::failed(args.url.trim(), &e),
            };
            println!("{}", serde_json::to_string(&summary)?);
        }
        Commands::Today => {
            let now = chrono::Utc::now();
            let v = serde_json::json!({
                "today": now.format("%Y-%m-%d").to_string(),
                "utc_datetime": now.to_rfc3339(),
            });
            println!("{v}");
        }
        Commands::Doctor(args) => {
            let t0 = std::time::Instant::now();
            let timeout = Duration::from_millis(args.timeout_ms);
            let render = RenderOptions::from_env(FetchOptions::default());
            let node_path = playwright_node_path();
            let mut checks = Vec::new();

            if render.disabled {
                checks.push(check("node", true, true, None));
                checks.push(check("playwright_package", true, true, None));
            } else {
                let mut node = tokio::process::Command::new(&render.node_bin);
                node.arg("--version");
                let (node_ok, node_err) = probe(node, timeout).await;
                checks.push(check("node", node_ok, false, node_err));

                if node_ok {
                    let mut pw = tokio::process::Command::new(&render.node_bin);
                    pw.args(["-e", "require.resolve('playwright')"]);
                    if let Some(p) = &node_path {
                        pw.env("NODE_PATH", p);
                    }
                    let (pw_ok, pw_err) = probe(pw, timeout).await;
                    checks.push(check("playwright_package", pw_ok, false, pw_err));
                } else {
                    checks.push(check(
                        "playwright_package",
                        false,
                        true,
                        Some("node is not available".to_string()),
                    ));
                }
            }

            let (config_ok, config_sources, config_err) = match args.config.as_ref() {
                None => (true, None, None),
                Some(path) => match load_config(Some(path)).and_then(|c| {
                    validate_sources(&c.sources)?;
                    c.pipeline.validate()?;
                    Ok(c.sources.len())
                }) {
                    Ok(n) => (true, Some(n), None),
                    Err(e) => (false, None, Some(format!("{e:#}"))),
                },
            };
            checks.push(check("config", config_ok, args.config.is_none(), config_err));

            let ok = checks.iter().all(|c| c["ok"].as_bool().unwrap_or(false));
            let payload = serde_json::json!({
                "schema_version": 1,
                "kind": "doctor",
                "ok": ok,
                "name": "tipwire",
                "version": env!("CARGO_PKG_VERSION"),
                "platform": {
                    "os": std::env::consts::OS,
                    "arch": std::env::consts::ARCH,
                },
                "elapsed_ms": t0.elapsed().as_millis(),
                "configured": {
                    "node_bin": render.node_bin,
                    "node_path_override": node_path.is_some(),
                    "render_disabled": render.disabled,
                    "config_path": args.config.as_ref().map(|p| p.display().to_string()),
                    "config_sources": config_sources,
                },
                "checks": checks,
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => {
                    println!("tipwire doctor: ok={ok}");
                    for c in &checks {
                        println!(
                            "  {:<20} ok={} skipped={} {}",
                            c["name"].as_str().unwrap_or(""),
                            c["ok"],
                            c["skipped"],
                            c["error"].as_str().unwrap_or("")
                        );
                    }
                }
                _ => println!("{payload}"),
            }
        }
        Commands::Version(args) => {
            let v = serde_json::json!({
                "schema_version": 1,
                "kind": "version",
                "ok": true,
                "name": "tipwire",
                "version": env!("CARGO_PKG_VERSION"),
            });
            match args.output.to_ascii_lowercase().as_str() {
                "text" => println!("tipwire {}", env!("CARGO_PKG_VERSION")),
                _ => println!("{v}"),
            }
        }
    }
    Ok(())
}
