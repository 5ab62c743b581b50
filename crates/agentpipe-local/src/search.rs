use crate::env;
use crate::retry::{with_backoff, AttemptOutcome, Failure};
use agentpipe_core::{
    parse_web_url, Error, ExtractDepth, ExtractFailure, ExtractResponse, ExtractedPage, Result,
    RetryPolicy, SearchDepth, SearchHit, SearchRequest, SearchResponse, SearchSettings,
    MAX_EXTRACT_URLS, MAX_SEARCH_RESULTS,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_ENDPOINT: &str = "https://api.tavily.com";
/// Rough token estimate used to trim context payloads.
pub const CHARS_PER_TOKEN: usize = 4;

fn tavily_api_key_from_env() -> Option<String> {
    env("AGENTPIPE_TAVILY_API_KEY").or_else(|| env("TAVILY_API_KEY"))
}

fn tavily_endpoint_from_env() -> Option<String> {
    env("AGENTPIPE_TAVILY_ENDPOINT")
}

/// Retrying client for a Tavily-compatible search/extract provider.
///
/// Holds no per-call state; safe to share across concurrent tasks.
#[derive(Debug, Clone)]
pub struct TavilyClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
    timeout: Duration,
}

impl TavilyClient {
    pub fn new(client: reqwest::Client, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            base_url: tavily_endpoint_from_env().unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = tavily_api_key_from_env().ok_or_else(|| {
            Error::NotConfigured(
                "missing AGENTPIPE_TAVILY_API_KEY (or TAVILY_API_KEY)".to_string(),
            )
        })?;
        Ok(Self::new(client, api_key))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn post_once<T: DeserializeOwned>(
        &self,
        op: &'static str,
        endpoint: &str,
        body: &serde_json::Value,
    ) -> AttemptOutcome<T> {
        let resp = self
            .client
            .post(endpoint)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(body)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Failure::from_transport(&e))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            let detail = agentpipe_core::task::preview(detail.trim(), 200);
            let msg = if detail.is_empty() {
                format!("tavily {op} HTTP {status}")
            } else {
                format!("tavily {op} HTTP {status}: {detail}")
            };
            return Err(Failure::from_status(status.as_u16(), msg));
        }

        resp.json::<T>()
            .await
            .map_err(|e| Failure::invalid_body(format!("tavily {op}: invalid response body: {e}")))
    }

    async fn post<T: DeserializeOwned>(
        &self,
        op: &'static str,
        path: &str,
        body: serde_json::Value,
    ) -> Result<(T, u32)> {
        let endpoint = self.endpoint(path);
        let endpoint = endpoint.as_str();
        let body = &body;
        let out = with_backoff(&self.retry, op, move |_| self.post_once(op, endpoint, body)).await?;
        Ok(out)
    }

    pub async fn search(&self, req: &SearchRequest) -> Result<SearchResponse> {
        let query = req.query.trim();
        if query.is_empty() {
            return Err(Error::Validation("search query must be non-empty".to_string()));
        }
        let max_results = req.max_results.clamp(1, MAX_SEARCH_RESULTS);

        let mut body = serde_json::json!({
            "query": query,
            "search_depth": req.depth.as_str(),
            "topic": req.topic.as_str(),
            "max_results": max_results,
            "include_answer": req.include_answer,
            "include_raw_content": req.include_raw_content,
        });
        if !req.include_domains.is_empty() {
            body["include_domains"] = serde_json::json!(req.include_domains);
        }
        if !req.exclude_domains.is_empty() {
            body["exclude_domains"] = serde_json::json!(req.exclude_domains);
        }
        if let Some(tr) = &req.time_range {
            body["time_range"] = serde_json::json!(tr);
        }

        let (parsed, attempts): (TavilySearchResponse, u32) =
            self.post("search", "search", body).await?;

        let results = parsed
            .results
            .into_iter()
            .map(|r| SearchHit {
                title: r.title.unwrap_or_default(),
                url: r.url,
                content: r.content.unwrap_or_default(),
                score: r.score.unwrap_or(0.0),
                raw_content: r.raw_content,
            })
            .collect();

        Ok(SearchResponse {
            query: query.to_string(),
            answer: parsed.answer.filter(|a| !a.trim().is_empty()),
            results,
            response_time: parsed.response_time,
            attempts,
        })
    }

    /// Fetch cleaned page content for up to [`MAX_EXTRACT_URLS`] URLs.
    ///
    /// Per-URL failures (including URLs rejected locally) land in `failed_results`.
    pub async fn extract(&self, urls: &[String], depth: ExtractDepth) -> Result<ExtractResponse> {
        let (urls, truncated_from) = normalize_urls(urls);
        if urls.is_empty() {
            return Err(Error::Validation(
                "extract requires at least one URL".to_string(),
            ));
        }
        if let Some(n) = truncated_from {
            tracing::warn!(
                requested = n,
                kept = MAX_EXTRACT_URLS,
                "extract URL list truncated"
            );
        }

        let mut valid = Vec::new();
        let mut failed_results = Vec::new();
        for u in urls {
            match parse_web_url(&u) {
                Ok(_) => valid.push(u),
                Err(e) => failed_results.push(ExtractFailure {
                    url: u,
                    error: e.to_string(),
                }),
            }
        }
        if valid.is_empty() {
            return Ok(ExtractResponse {
                results: Vec::new(),
                failed_results,
                truncated_from,
                response_time: None,
                attempts: 0,
            });
        }

        let body = serde_json::json!({
            "urls": valid,
            "extract_depth": depth.as_str(),
        });
        let (parsed, attempts): (TavilyExtractResponse, u32) =
            self.post("extract", "extract", body).await?;

        failed_results.extend(parsed.failed_results.into_iter().map(|f| ExtractFailure {
            url: f.url,
            error: f.error.unwrap_or_else(|| "extraction failed".to_string()),
        }));
        Ok(ExtractResponse {
            results: parsed
                .results
                .into_iter()
                .map(|r| ExtractedPage {
                    url: r.url,
                    raw_content: r.raw_content.unwrap_or_default(),
                })
                .collect(),
            failed_results,
            truncated_from,
            response_time: parsed.response_time,
            attempts,
        })
    }

    /// Search-backed context for RAG: a JSON array of `{url, content}` sources.
    pub async fn get_context(&self, query: &str, max_tokens: usize) -> Result<String> {
        let req = SearchRequest::new(query).with_depth(SearchDepth::Advanced);
        self.context(&req, max_tokens).await
    }

    /// Like [`get_context`](Self::get_context) with caller-supplied search options.
    pub async fn context(&self, req: &SearchRequest, max_tokens: usize) -> Result<String> {
        let resp = self.search(req).await?;
        let sources: Vec<ContextSource> = resp
            .results
            .into_iter()
            .map(|h| ContextSource {
                url: h.url,
                content: h.content,
            })
            .collect();
        Ok(trim_context(sources, max_tokens.saturating_mul(CHARS_PER_TOKEN)))
    }
}

/// Trim, drop blanks and duplicates (first occurrence wins), then cap at [`MAX_EXTRACT_URLS`].
///
/// Returns the kept URLs and, when the cap applied, the deduplicated length before it.
pub fn normalize_urls(urls: &[String]) -> (Vec<String>, Option<usize>) {
    let mut out: Vec<String> = Vec::new();
    for u in urls {
        let u = u.trim();
        if u.is_empty() || out.iter().any(|o| o == u) {
            continue;
        }
        out.push(u.to_string());
    }
    if out.len() > MAX_EXTRACT_URLS {
        let n = out.len();
        out.truncate(MAX_EXTRACT_URLS);
        return (out, Some(n));
    }
    (out, None)
}

/// Build a search request from an agent's search settings.
pub fn search_request(query: &str, settings: &SearchSettings) -> SearchRequest {
    SearchRequest {
        query: query.to_string(),
        depth: settings.depth,
        topic: settings.topic,
        max_results: settings.max_results,
        include_answer: settings.include_answer,
        include_raw_content: settings.include_raw_content,
        include_domains: settings.include_domains.clone(),
        exclude_domains: settings.exclude_domains.clone(),
        time_range: settings.time_range.clone(),
    }
}

#[derive(Debug, Clone, Serialize)]
struct ContextSource {
    url: String,
    content: String,
}

/// Serialize sources into a JSON array no longer than `budget_chars` (when possible).
///
/// Whole sources are dropped from the tail; the first source is cut only if it alone
/// exceeds the budget.
fn trim_context(sources: Vec<ContextSource>, budget_chars: usize) -> String {
    let mut kept: Vec<ContextSource> = Vec::new();
    for s in sources {
        kept.push(s);
        let len = serde_json::to_string(&kept).map(|j| j.chars().count()).unwrap_or(0);
        if len > budget_chars {
            let over = kept.pop();
            if kept.is_empty() {
                if let Some(mut first) = over {
                    let overhead = serde_json::to_string(&[ContextSource {
                        url: first.url.clone(),
                        content: String::new(),
                    }])
                    .map(|j| j.chars().count())
                    .unwrap_or(0);
                    let room = budget_chars.saturating_sub(overhead);
                    first.content = first.content.chars().take(room).collect();
                    kept.push(first);
                }
            }
            break;
        }
    }
    serde_json::to_string(&kept).unwrap_or_else(|_| "[]".to_string())
}

#[derive(Debug, Deserialize)]
struct TavilySearchResponse {
    #[serde(default)]
    answer: Option<String>,
    #[serde(default)]
    results: Vec<TavilyResult>,
    #[serde(default)]
    response_time: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TavilyResult {
    url: String,
    title: Option<String>,
    content: Option<String>,
    score: Option<f64>,
    #[serde(default)]
    raw_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TavilyExtractResponse {
    #[serde(default)]
    results: Vec<TavilyExtracted>,
    #[serde(default)]
    failed_results: Vec<TavilyExtractFailure>,
    #[serde(default)]
    response_time: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TavilyExtracted {
    url: String,
    raw_content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TavilyExtractFailure {
    url: String,
    error: Option<String>,
}
