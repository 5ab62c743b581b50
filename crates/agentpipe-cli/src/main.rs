use agentpipe_core::{
    AgentConfig, BrowserSettings, Error, ErrorCode, ExecutionResult, ExtractDepth, SearchDepth,
    SearchRequest, SearchTopic, TaskRequest, WaitUntil,
};
use agentpipe_local::format::{render_context, render_extract, render_fetch, render_search};
use agentpipe_local::openai_compat::openai_compat_model_from_env;
use agentpipe_local::render::driver_from_env;
use agentpipe_local::{OpenAiCompatRuntime, PageFetcher, Pipeline, TavilyClient, TracingLogger};
use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::ExitCode;
use std::time::{Duration, Instant};

mod envelope;

#[derive(Parser, Debug)]
#[command(name = "agentpipe")]
#[command(about = "Resilient web search/extract/fetch and single-task agent runs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Search the web (retries transient provider failures).
    Search(SearchCmd),
    /// Extract page content for one or more URLs via the search provider.
    Extract(ExtractCmd),
    /// Gather token-bounded JSON context for a query.
    Context(ContextCmd),
    /// Load one page through the browser driver and print its text.
    Fetch(FetchCmd),
    /// Run one task through an agent (chat, search or browser).
    Run(RunCmd),
    /// Print version info.
    Version(OutputArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Output {
    Json,
    Text,
}

#[derive(clap::Args, Debug)]
struct OutputArgs {
    /// Output format.
    #[arg(long = "output", alias = "format", value_enum, default_value_t = Output::Json)]
    output: Output,
}

#[derive(clap::Args, Debug)]
struct SearchCmd {
    query: String,
    /// basic | advanced
    #[arg(long, value_parser = parse_search_depth, default_value = "basic")]
    depth: SearchDepth,
    /// general | news | finance
    #[arg(long, value_parser = parse_search_topic, default_value = "general")]
    topic: SearchTopic,
    #[arg(long, default_value_t = 5)]
    max_results: usize,
    #[arg(long)]
    include_answer: bool,
    /// Restrict to this domain (repeatable).
    #[arg(long = "include-domain")]
    include_domains: Vec<String>,
    /// Exclude this domain (repeatable).
    #[arg(long = "exclude-domain")]
    exclude_domains: Vec<String>,
    /// day | week | month | year
    #[arg(long)]
    time_range: Option<String>,
    /// Total attempts per provider call.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,
    #[command(flatten)]
    out: OutputArgs,
}

#[derive(clap::Args, Debug)]
struct ExtractCmd {
    urls: Vec<String>,
    /// basic | advanced
    #[arg(long, value_parser = parse_extract_depth, default_value = "basic")]
    depth: ExtractDepth,
    /// Text output only: per-page character cap.
    #[arg(long, default_value_t = 8_000)]
    max_chars_per_page: usize,
    /// Total attempts per provider call.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,
    #[command(flatten)]
    out: OutputArgs,
}

#[derive(clap::Args, Debug)]
struct ContextCmd {
    query: String,
    #[arg(long, default_value_t = 4_000)]
    max_tokens: usize,
    /// Total attempts per provider call.
    #[arg(long, default_value_t = 3)]
    max_retries: u32,
    #[command(flatten)]
    out: OutputArgs,
}

#[derive(clap::Args, Debug)]
struct FetchCmd {
    url: String,
    /// Per-navigation timeout.
    #[arg(long, default_value_t = 30_000)]
    timeout_ms: u64,
    /// Extra attempts after the first.
    #[arg(long, default_value_t = 2)]
    retry_count: u32,
    /// Base backoff; doubles after each failed attempt.
    #[arg(long, default_value_t = 1_000)]
    retry_delay_ms: u64,
    /// load | domcontentloaded | networkidle
    #[arg(long, value_parser = parse_wait_until, default_value = "domcontentloaded")]
    wait_until: WaitUntil,
    #[arg(long, default_value_t = 50_000)]
    max_chars: usize,
    #[arg(long)]
    user_agent: Option<String>,
    #[command(flatten)]
    out: OutputArgs,
}

#[derive(clap::Args, Debug)]
struct RunCmd {
    task: String,
    /// chat | search | browser
    #[arg(long, default_value = "chat")]
    agent_type: String,
    #[arg(long, default_value = "cli")]
    agent_id: String,
    /// Model id; falls back to AGENTPIPE_OPENAI_COMPAT_MODEL.
    #[arg(long)]
    model: Option<String>,
    /// Agent configuration, e.g. `--set temperature=0.2 --set browser.retry_count=1`.
    #[arg(long = "set", value_parser = parse_kv)]
    set: Vec<(String, String)>,
    /// Caller context merged into result metadata (values parsed as JSON when possible).
    #[arg(long = "context", value_parser = parse_kv)]
    context: Vec<(String, String)>,
    /// Overrides the agent's timeout_ms for this task.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    timeout_ms: Option<u64>,
    #[arg(long)]
    correlation_id: Option<String>,
    #[arg(long)]
    system_prompt: Option<String>,
    #[arg(long)]
    max_tool_rounds: Option<usize>,
    #[command(flatten)]
    out: OutputArgs,
}

fn parse_kv(s: &str) -> std::result::Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {s:?}"))?;
    let k = k.trim();
    if k.is_empty() {
        return Err(format!("empty key in {s:?}"));
    }
    Ok((k.to_string(), v.to_string()))
}

fn parse_search_depth(s: &str) -> std::result::Result<SearchDepth, String> {
    SearchDepth::parse(s).ok_or_else(|| format!("expected basic or advanced, got {s:?}"))
}

fn parse_search_topic(s: &str) -> std::result::Result<SearchTopic, String> {
    SearchTopic::parse(s).ok_or_else(|| format!("expected general, news or finance, got {s:?}"))
}

fn parse_extract_depth(s: &str) -> std::result::Result<ExtractDepth, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "basic" => Ok(ExtractDepth::Basic),
        "advanced" => Ok(ExtractDepth::Advanced),
        _ => Err(format!("expected basic or advanced, got {s:?}")),
    }
}

fn parse_wait_until(s: &str) -> std::result::Result<WaitUntil, String> {
    WaitUntil::parse(s)
        .ok_or_else(|| format!("expected load, domcontentloaded or networkidle, got {s:?}"))
}

fn context_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Opt-in env file (`AGENTPIPE_ENV_FILE`). Never overrides variables already set.
fn load_env_file() {
    let Ok(p) = std::env::var("AGENTPIPE_ENV_FILE") else {
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

fn init_tracing() {
    let filter = std::env::var("AGENTPIPE_LOG").unwrap_or_else(|_| "warn".to_string());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .try_init();
}

fn http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!("agentpipe/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("build http client")
}

fn elapsed_ms(t0: Instant) -> u64 {
    t0.elapsed().as_millis() as u64
}

/// Print one outcome; `text` renders the success payload for `--output text`.
fn emit(
    kind: &str,
    output: Output,
    t0: Instant,
    outcome: std::result::Result<(Value, String), (ErrorCode, String)>,
) -> ExitCode {
    match (outcome, output) {
        (Ok((json, _)), Output::Json) => {
            println!("{}", envelope::ok(kind, elapsed_ms(t0), json));
            ExitCode::SUCCESS
        }
        (Ok((_, text)), Output::Text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        (Err((code, message)), Output::Json) => {
            println!("{}", envelope::err(kind, elapsed_ms(t0), code, message));
            ExitCode::FAILURE
        }
        (Err((code, message)), Output::Text) => {
            eprintln!("{code}: {message}");
            ExitCode::FAILURE
        }
    }
}

fn engine_failure(e: Error) -> (ErrorCode, String) {
    (e.code(), e.to_string())
}

async fn search(args: SearchCmd) -> Result<ExitCode> {
    let t0 = Instant::now();
    let http = http_client()?;
    let retry = agentpipe_core::RetryPolicy::new(args.max_retries.max(1));
    let req = SearchRequest {
        query: args.query,
        depth: args.depth,
        topic: args.topic,
        max_results: args.max_results,
        include_answer: args.include_answer,
        include_raw_content: false,
        include_domains: args.include_domains,
        exclude_domains: args.exclude_domains,
        time_range: args.time_range,
    };
    let outcome = async {
        let client = TavilyClient::from_env(http)?.with_retry_policy(retry);
        client.search(&req).await
    }
    .await
    .map(|resp| {
        let text = render_search(&resp);
        (serde_json::to_value(&resp).unwrap_or(Value::Null), text)
    })
    .map_err(engine_failure);
    Ok(emit("search", args.out.output, t0, outcome))
}

async fn extract(args: ExtractCmd) -> Result<ExitCode> {
    let t0 = Instant::now();
    let http = http_client()?;
    let retry = agentpipe_core::RetryPolicy::new(args.max_retries.max(1));
    let outcome = async {
        let client = TavilyClient::from_env(http)?.with_retry_policy(retry);
        client.extract(&args.urls, args.depth).await
    }
    .await
    .map(|resp| {
        let text = render_extract(&resp, args.max_chars_per_page);
        (serde_json::to_value(&resp).unwrap_or(Value::Null), text)
    })
    .map_err(engine_failure);
    Ok(emit("extract", args.out.output, t0, outcome))
}

async fn context(args: ContextCmd) -> Result<ExitCode> {
    let t0 = Instant::now();
    let http = http_client()?;
    let retry = agentpipe_core::RetryPolicy::new(args.max_retries.max(1));
    let outcome = async {
        let client = TavilyClient::from_env(http)?.with_retry_policy(retry);
        client.get_context(&args.query, args.max_tokens).await
    }
    .await
    .map(|ctx| {
        let text = render_context(&args.query, &ctx);
        let sources = serde_json::from_str::<Value>(&ctx).unwrap_or(Value::String(ctx));
        (serde_json::json!({ "query": args.query, "sources": sources }), text)
    })
    .map_err(engine_failure);
    Ok(emit("context", args.out.output, t0, outcome))
}

async fn fetch(args: FetchCmd) -> Result<ExitCode> {
    let t0 = Instant::now();
    let settings = BrowserSettings {
        timeout_ms: args.timeout_ms.max(1),
        wait_until: args.wait_until,
        retry_count: args.retry_count,
        retry_delay: Duration::from_millis(args.retry_delay_ms),
        user_agent: args.user_agent,
        max_content_chars: args.max_chars.max(1),
        ..BrowserSettings::default()
    };
    let driver = match driver_from_env() {
        Ok(d) => d,
        Err(e) => return Ok(emit("fetch", args.out.output, t0, Err(engine_failure(e)))),
    };
    let fetcher = PageFetcher::new(driver, settings);
    let r = fetcher.fetch_with_retry(&args.url).await;
    if let Err(e) = fetcher.close().await {
        tracing::warn!(error = %e, "closing browser failed");
    }

    if r.is_success() {
        let text = render_fetch(&r);
        let json = serde_json::to_value(&r).unwrap_or(Value::Null);
        return Ok(emit("fetch", args.out.output, t0, Ok((json, text))));
    }
    let code = r.error_code.unwrap_or(ErrorCode::Fetch);
    let message = r.error.clone().unwrap_or_else(|| "fetch failed".to_string());
    if args.out.output == Output::Json {
        let mut v = envelope::err("fetch", elapsed_ms(t0), code, message);
        v["error"]["retryable"] = Value::from(r.retryable);
        v["attempts"] = Value::from(r.attempts);
        println!("{v}");
        return Ok(ExitCode::FAILURE);
    }
    Ok(emit("fetch", args.out.output, t0, Err((code, message))))
}

async fn run(args: RunCmd) -> Result<ExitCode> {
    let t0 = Instant::now();
    let output = args.out.output;
    let mut pairs: BTreeMap<String, String> = args.set.into_iter().collect();
    if !pairs.contains_key("model") {
        if let Some(m) = args.model.or_else(openai_compat_model_from_env) {
            pairs.insert("model".to_string(), m);
        }
    }
    let config = match AgentConfig::from_pairs(&args.agent_id, &args.agent_type, &pairs) {
        Ok(c) => c,
        Err(e) => return Ok(emit("run", output, t0, Err(engine_failure(e)))),
    };
    let runtime = match OpenAiCompatRuntime::from_env(http_client()?, &config) {
        Ok(rt) => rt,
        Err(e) => return Ok(emit("run", output, t0, Err(engine_failure(e)))),
    };
    let runtime = match (args.system_prompt, args.max_tool_rounds) {
        (Some(p), Some(n)) => runtime.with_system_prompt(p).with_max_tool_rounds(n),
        (Some(p), None) => runtime.with_system_prompt(p),
        (None, Some(n)) => runtime.with_max_tool_rounds(n),
        (None, None) => runtime,
    };

    let mut request = TaskRequest::new(args.task);
    for (k, v) in args.context {
        request = request.with_context(k, context_value(&v));
    }
    if let Some(ms) = args.timeout_ms {
        request = request.with_timeout_ms(ms);
    }
    if let Some(cid) = args.correlation_id {
        request = request.with_correlation_id(cid);
    }

    let pipeline = Pipeline::new(runtime, TracingLogger::new());
    let result = pipeline.run(&config, &request).await;
    if let Err(e) = pipeline.runtime().close().await {
        tracing::warn!(error = %e, "closing browser failed");
    }
    let result = result.map_err(|e| anyhow::anyhow!(e))?;

    let outcome = match &result {
        ExecutionResult::Success { content, .. } => Ok((
            serde_json::to_value(&result).unwrap_or(Value::Null),
            content.clone(),
        )),
        ExecutionResult::Error { message, code, .. } => Err((*code, message.clone())),
    };
    Ok(emit("run", output, t0, outcome))
}

fn version(args: OutputArgs) -> ExitCode {
    match args.output {
        Output::Text => println!("agentpipe {}", env!("CARGO_PKG_VERSION")),
        Output::Json => println!(
            "{}",
            serde_json::json!({
                "schema_version": envelope::SCHEMA_VERSION,
                "kind": "version",
                "ok": true,
                "name": "agentpipe",
                "version": env!("CARGO_PKG_VERSION"),
            })
        ),
    }
    ExitCode::SUCCESS
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    load_env_file();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Search(args) => search(args).await,
        Commands::Extract(args) => extract(args).await,
        Commands::Context(args) => context(args).await,
        Commands::Fetch(args) => fetch(args).await,
        Commands::Run(args) => run(args).await,
        Commands::Version(args) => Ok(version(args)),
    }
}
