use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub mod config;
pub mod retry;
pub mod task;

pub use config::{
    AgentConfig, BrowserSettings, GenerationParams, SearchSettings, ToolConfig, WaitUntil,
};
pub use retry::{classify_status, ApiError, ErrorCode, ErrorKind, RetryPolicy};
pub use task::{
    AgentRuntime, ExecutionLogger, ExecutionResult, InvokeOptions, Message, ModelOutput, Role,
    TaskRequest, ToolCall, ToolInvocationRecord, ToolStatus, UsageInfo,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("invalid config: {0}")]
    Config(String),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("timed out after {ms}ms")]
    Timeout { ms: u64 },
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("conversion failed: {0}")]
    Conversion(String),
    #[error("llm failed: {0}")]
    Llm(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("browser launch failed: {message}. {guidance}")]
    BrowserLaunch { message: String, guidance: String },
    /// A programming error (wrong config variant, missing required field).
    ///
    /// Never converted into an `ExecutionResult::Error`.
    #[error("defect: {0}")]
    Defect(String),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Api(e) => e.kind.code(),
            Error::Timeout { .. } => ErrorCode::Timeout,
            Error::Fetch(_) | Error::BrowserLaunch { .. } => ErrorCode::Fetch,
            Error::Conversion(_) => ErrorCode::Conversion,
            Error::InvalidUrl(_) | Error::Validation(_) | Error::Config(_) => ErrorCode::Validation,
            Error::Llm(_)
            | Error::NotConfigured(_)
            | Error::NotSupported(_)
            | Error::Defect(_) => ErrorCode::Execution,
        }
    }

    pub fn is_defect(&self) -> bool {
        matches!(self, Error::Defect(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchDepth {
    #[default]
    Basic,
    Advanced,
}

impl SearchDepth {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchDepth::Basic => "basic",
            SearchDepth::Advanced => "advanced",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "basic" => Some(SearchDepth::Basic),
            "advanced" => Some(SearchDepth::Advanced),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchTopic {
    #[default]
    General,
    News,
    Finance,
}

impl SearchTopic {
    pub fn as_str(self) -> &'static str {
        match self {
            SearchTopic::General => "general",
            SearchTopic::News => "news",
            SearchTopic::Finance => "finance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "general" => Some(SearchTopic::General),
            "news" => Some(SearchTopic::News),
            "finance" => Some(SearchTopic::Finance),
            _ => None,
        }
    }
}

/// Hard cap on results per search call (provider limit).
pub const MAX_SEARCH_RESULTS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub depth: SearchDepth,
    pub topic: SearchTopic,
    pub max_results: usize,
    pub include_answer: bool,
    pub include_raw_content: bool,
    pub include_domains: Vec<String>,
    pub exclude_domains: Vec<String>,
    /// Provider-side recency window: day | week | month | year.
    pub time_range: Option<String>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            depth: SearchDepth::Basic,
            topic: SearchTopic::General,
            max_results: 5,
            include_answer: false,
            include_raw_content: false,
            include_domains: Vec::new(),
            exclude_domains: Vec::new(),
            time_range: None,
        }
    }

    pub fn with_depth(mut self, depth: SearchDepth) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_max_results(mut self, n: usize) -> Self {
        self.max_results = n;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub content: String,
    pub score: f64,
    pub raw_content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub query: String,
    pub answer: Option<String>,
    pub results: Vec<SearchHit>,
    pub response_time: Option<f64>,
    /// Attempts the retry loop needed (1 = first try).
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExtractDepth {
    #[default]
    Basic,
    Advanced,
}

impl ExtractDepth {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractDepth::Basic => "basic",
            ExtractDepth::Advanced => "advanced",
        }
    }
}

/// Max URLs a single extract call accepts; longer lists are truncated.
pub const MAX_EXTRACT_URLS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedPage {
    pub url: String,
    pub raw_content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractFailure {
    pub url: String,
    pub error: String,
}

/// Partial failure is a normal outcome: callers must look at both lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractResponse {
    pub results: Vec<ExtractedPage>,
    pub failed_results: Vec<ExtractFailure>,
    /// Original (deduplicated) list length when it exceeded the cap.
    pub truncated_from: Option<usize>,
    pub response_time: Option<f64>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub url: String,
    pub final_url: String,
    pub redirected: bool,
    pub status: FetchStatus,
    pub title: Option<String>,
    /// Normalized text; empty on error.
    pub content: String,
    pub error: Option<String>,
    pub error_code: Option<ErrorCode>,
    /// Whether the last failure was transient; false on success.
    #[serde(default)]
    pub retryable: bool,
    pub attempts: u32,
    pub elapsed_ms: u128,
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        self.status == FetchStatus::Success
    }
}

/// Raw outcome of one navigation inside a browsing context.
#[derive(Debug, Clone)]
pub struct Navigation {
    pub final_url: String,
    pub status: Option<u16>,
    pub content_type: Option<String>,
    pub html: String,
    pub headers: BTreeMap<String, String>,
}

/// Starts the underlying browser. Implementations must release any partially started
/// process state before returning an error.
#[async_trait::async_trait]
pub trait BrowserDriver: Send + Sync {
    fn name(&self) -> &'static str;
    async fn launch(&self, settings: &BrowserSettings) -> Result<Arc<dyn BrowserHandle>>;
}

/// A running browser shared by all calls of one fetch engine.
#[async_trait::async_trait]
pub trait BrowserHandle: Send + Sync {
    /// Isolated context (no shared cookies or storage with other contexts).
    async fn new_context(&self, settings: &BrowserSettings) -> Result<Box<dyn BrowsingContext>>;
    async fn close(&self) -> Result<()>;
}

#[async_trait::async_trait]
pub trait BrowsingContext: Send {
    /// Timeouts are reported as `Error::Timeout`.
    async fn navigate(
        &mut self,
        url: &str,
        timeout: Duration,
        wait_until: WaitUntil,
    ) -> Result<Navigation>;
    async fn close(self: Box<Self>) -> Result<()>;
}

/// Parse and check that the URL is absolute http(s).
pub fn parse_web_url(raw: &str) -> Result<url::Url> {
    let u = url::Url::parse(raw.trim()).map_err(|e| Error::InvalidUrl(format!("{raw}: {e}")))?;
    match u.scheme() {
        "http" | "https" => Ok(u),
        other => Err(Error::InvalidUrl(format!(
            "{raw}: unsupported scheme {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_follow_the_taxonomy() {
        let api = Error::Api(ApiError::new(ErrorKind::RateLimit, "slow down").with_status(429));
        assert_eq!(api.code(), ErrorCode::RateLimit);
        assert_eq!(Error::Timeout { ms: 5 }.code(), ErrorCode::Timeout);
        assert_eq!(Error::Fetch("x".into()).code(), ErrorCode::Fetch);
        assert_eq!(Error::Conversion("x".into()).code(), ErrorCode::Conversion);
        assert_eq!(Error::Validation("x".into()).code(), ErrorCode::Validation);
        assert_eq!(Error::Llm("x".into()).code(), ErrorCode::Execution);
        assert!(Error::Defect("x".into()).is_defect());
        assert!(!Error::Llm("x".into()).is_defect());
    }

    #[test]
    fn parse_web_url_rejects_non_http_schemes() {
        assert!(parse_web_url("https://example.com/a").is_ok());
        assert!(parse_web_url("  http://example.com  ").is_ok());
        assert!(matches!(
            parse_web_url("ftp://example.com"),
            Err(Error::InvalidUrl(_))
        ));
        assert!(matches!(parse_web_url("not a url"), Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn fetch_status_serializes_lowercase() {
        let v = serde_json::to_value(FetchStatus::Error).unwrap();
        assert_eq!(v, serde_json::json!("error"));
    }
}
