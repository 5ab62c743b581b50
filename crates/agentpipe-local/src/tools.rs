//! Tools a model can call during one invocation, backed by the resilient engines.
//!
//! A tool failure goes back to the model as an error message; nothing here retries
//! beyond what the engines already do.

use crate::format::{render_context, render_extract, render_fetch, render_search};
use crate::render::PageFetcher;
use crate::search::{search_request, TavilyClient};
use agentpipe_core::{Error, ExtractDepth, SearchSettings, MAX_EXTRACT_URLS, MAX_SEARCH_RESULTS};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

const EXTRACT_CHARS_PER_PAGE: usize = 8_000;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// Shown to the model.
    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}, "required": []})
    }

    async fn call(&self, args: Value) -> Result<String, String>;
}

/// Ordered set of tools, looked up by name.
#[derive(Default, Clone)]
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering a name twice replaces the earlier tool.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Chat-completions `tools` array.
    pub fn definitions(&self) -> Vec<Value> {
        self.tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.parameters_schema(),
                    }
                })
            })
            .collect()
    }

    pub async fn call(&self, name: &str, args: Value) -> Result<String, String> {
        let tool = self.get(name).ok_or_else(|| format!("unknown tool: {name}"))?;
        let t0 = Instant::now();
        let r = tool.call(args).await;
        tracing::info!(
            event = "tool_audit",
            tool = name,
            ok = r.is_ok(),
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "tool call finished"
        );
        r
    }
}

fn engine_error(e: Error) -> String {
    format!("{}: {e}", e.code())
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("missing required argument `{key}`"))
}

pub struct WebSearchTool {
    client: Arc<TavilyClient>,
    settings: SearchSettings,
}

impl WebSearchTool {
    pub fn new(client: Arc<TavilyClient>, settings: SearchSettings) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web. Returns a ranked list of results with title, URL, score and snippet."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search query"},
                "max_results": {"type": "integer", "minimum": 1, "maximum": MAX_SEARCH_RESULTS}
            },
            "required": ["query"]
        })
    }

    async fn call(&self, args: Value) -> Result<String, String> {
        let query = str_arg(&args, "query")?;
        let mut req = search_request(query, &self.settings);
        if let Some(n) = args.get("max_results").and_then(|v| v.as_u64()) {
            req.max_results = (n as usize).clamp(1, MAX_SEARCH_RESULTS);
        }
        let resp = self.client.search(&req).await.map_err(engine_error)?;
        Ok(render_search(&resp))
    }
}

pub struct WebExtractTool {
    client: Arc<TavilyClient>,
}

impl WebExtractTool {
    pub fn new(client: Arc<TavilyClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Tool for WebExtractTool {
    fn name(&self) -> &str {
        "web_extract"
    }

    fn description(&self) -> &str {
        "Extract the readable content of one or more web pages. Some URLs may fail while others succeed."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "urls": {
                    "type": "array",
                    "items": {"type": "string"},
                    "maxItems": MAX_EXTRACT_URLS
                },
                "depth": {"type": "string", "enum": ["basic", "advanced"]}
            },
            "required": ["urls"]
        })
    }

    async fn call(&self, args: Value) -> Result<String, String> {
        let urls: Vec<String> = match args.get("urls") {
            Some(Value::Array(a)) => a
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            Some(Value::String(s)) => vec![s.clone()],
            _ => return Err("missing required argument `urls`".to_string()),
        };
        let depth = match args.get("depth").and_then(|v| v.as_str()) {
            Some("advanced") => ExtractDepth::Advanced,
            _ => ExtractDepth::Basic,
        };
        let resp = self
            .client
            .extract(&urls, depth)
            .await
            .map_err(engine_error)?;
        Ok(render_extract(&resp, EXTRACT_CHARS_PER_PAGE))
    }
}

pub struct WebContextTool {
    client: Arc<TavilyClient>,
    settings: SearchSettings,
}

impl WebContextTool {
    pub fn new(client: Arc<TavilyClient>, settings: SearchSettings) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl Tool for WebContextTool {
    fn name(&self) -> &str {
        "web_context"
    }

    fn description(&self) -> &str {
        "Gather web sources relevant to a query as compact JSON context, bounded by a token budget."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "max_tokens": {"type": "integer", "minimum": 1}
            },
            "required": ["query"]
        })
    }

    async fn call(&self, args: Value) -> Result<String, String> {
        let query = str_arg(&args, "query")?;
        let max_tokens = args
            .get("max_tokens")
            .and_then(|v| v.as_u64())
            .map(|n| n.max(1) as usize)
            .unwrap_or(self.settings.context_max_tokens);
        let mut req = search_request(query, &self.settings);
        req.depth = agentpipe_core::SearchDepth::Advanced;
        let ctx = self
            .client
            .context(&req, max_tokens)
            .await
            .map_err(engine_error)?;
        Ok(render_context(query, &ctx))
    }
}

pub struct FetchPageTool {
    fetcher: Arc<PageFetcher>,
}

impl FetchPageTool {
    pub fn new(fetcher: Arc<PageFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Tool for FetchPageTool {
    fn name(&self) -> &str {
        "fetch_page"
    }

    fn description(&self) -> &str {
        "Load a web page in a browser and return its text content."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string", "description": "Absolute http(s) URL"}
            },
            "required": ["url"]
        })
    }

    async fn call(&self, args: Value) -> Result<String, String> {
        let url = str_arg(&args, "url")?;
        let r = self.fetcher.fetch_with_retry(url).await;
        if r.is_success() {
            Ok(render_fetch(&r))
        } else {
            Err(render_fetch(&r))
        }
    }
}
