//! Page-fetch engine: lazily started browser, isolated context per call, bounded retries.

use crate::extract::{bytes_look_like_html, convert_to_normalized_text, is_html_content_type, page_title};
use agentpipe_core::{
    parse_web_url, BrowserDriver, BrowserHandle, BrowserSettings, BrowsingContext, Error,
    ErrorCode, FetchResult, FetchStatus, Navigation, Result, WaitUntil,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Body cap for the HTTP driver.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Substrings that mark an opaque navigation failure as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "503",
    "502",
    "504",
    "timeout",
    "timed out",
    "connection",
    "network",
    "temporary",
    "temporarily",
    "reset",
];

/// One failed page-fetch attempt.
#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("HTTP {status} loading {url}")]
    Status { status: u16, url: String },
    #[error("non-HTML content type {content_type:?} at {url}")]
    NotHtml { content_type: String, url: String },
    #[error("navigation timeout after {ms}ms loading {url}")]
    Timeout { ms: u64, url: String },
    #[error("navigation to {url} failed: {message}")]
    Navigation { url: String, message: String },
    #[error("{0}")]
    Launch(String),
}

impl FetchError {
    /// Structured verdict first; opaque navigation messages fall back to marker matching.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Status { status, .. } => {
                *status >= 500 || *status == 429 || *status == 408
            }
            FetchError::Timeout { .. } => true,
            FetchError::Navigation { message, .. } => {
                let m = message.to_ascii_lowercase();
                TRANSIENT_MARKERS.iter().any(|k| m.contains(k))
            }
            FetchError::InvalidUrl(_) | FetchError::NotHtml { .. } | FetchError::Launch(_) => false,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            FetchError::Timeout { .. } => ErrorCode::Timeout,
            _ => ErrorCode::Fetch,
        }
    }
}

/// Fetched markup before conversion.
#[derive(Debug, Clone)]
pub struct PageContent {
    pub html: String,
    pub final_url: String,
    pub redirected: bool,
}

/// Resilient page fetcher. Holds one lazily started browser shared by its calls.
pub struct PageFetcher {
    driver: Arc<dyn BrowserDriver>,
    settings: BrowserSettings,
    browser: tokio::sync::Mutex<Option<Arc<dyn BrowserHandle>>>,
}

impl std::fmt::Debug for PageFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageFetcher")
            .field("driver", &self.driver.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl PageFetcher {
    pub fn new(driver: Arc<dyn BrowserDriver>, settings: BrowserSettings) -> Self {
        Self {
            driver,
            settings,
            browser: tokio::sync::Mutex::new(None),
        }
    }

    /// Fetcher backed by plain HTTP requests (no script execution).
    pub fn http(settings: BrowserSettings) -> Self {
        Self::new(Arc::new(HttpDriver), settings)
    }

    pub fn settings(&self) -> &BrowserSettings {
        &self.settings
    }

    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    pub async fn is_running(&self) -> bool {
        self.browser.lock().await.is_some()
    }

    /// Start the browser on first use; later calls share the same handle.
    pub async fn acquire(&self) -> Result<Arc<dyn BrowserHandle>> {
        let mut guard = self.browser.lock().await;
        if let Some(b) = guard.as_ref() {
            return Ok(b.clone());
        }
        tracing::debug!(driver = self.driver.name(), headless = self.settings.headless, "starting browser");
        let b = self.driver.launch(&self.settings).await?;
        *guard = Some(b.clone());
        Ok(b)
    }

    /// Tear the browser down. A later fetch starts a fresh one.
    pub async fn close(&self) -> Result<()> {
        let taken = self.browser.lock().await.take();
        match taken {
            Some(b) => b.close().await,
            None => Ok(()),
        }
    }

    /// One attempt: navigate in a fresh context, check status and content type.
    pub async fn fetch_page(&self, url: &str) -> std::result::Result<PageContent, FetchError> {
        let parsed = parse_web_url(url).map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        let browser = self.acquire().await.map_err(|e| FetchError::Launch(e.to_string()))?;
        let ctx = browser
            .new_context(&self.settings)
            .await
            .map_err(|e| self.wrap(url, e))?;

        let (ctx, outcome) = self.navigate_in(ctx, parsed.as_str()).await;
        if let Err(e) = ctx.close().await {
            tracing::warn!(url, error = %e, "failed to close browsing context");
        }
        let nav = outcome?;

        if let Some(status) = nav.status.filter(|s| *s >= 400) {
            return Err(FetchError::Status {
                status,
                url: url.to_string(),
            });
        }
        match nav.content_type.as_deref() {
            Some(ct) if !is_html_content_type(ct) => {
                return Err(FetchError::NotHtml {
                    content_type: ct.to_string(),
                    url: url.to_string(),
                })
            }
            None if !nav.html.trim().is_empty() && !bytes_look_like_html(nav.html.as_bytes()) => {
                return Err(FetchError::NotHtml {
                    content_type: "unknown".to_string(),
                    url: url.to_string(),
                })
            }
            _ => {}
        }

        let redirected = !same_url(&parsed, &nav.final_url);
        Ok(PageContent {
            html: nav.html,
            final_url: nav.final_url,
            redirected,
        })
    }

    async fn navigate_in(
        &self,
        mut ctx: Box<dyn BrowsingContext>,
        url: &str,
    ) -> (Box<dyn BrowsingContext>, std::result::Result<Navigation, FetchError>) {
        let timeout = self.settings.timeout();
        let r = tokio::time::timeout(
            timeout,
            ctx.navigate(url, timeout, self.settings.wait_until),
        )
        .await;
        let outcome = match r {
            Ok(Ok(nav)) => Ok(nav),
            Ok(Err(e)) => Err(self.wrap(url, e)),
            Err(_) => Err(FetchError::Timeout {
                ms: self.settings.timeout_ms,
                url: url.to_string(),
            }),
        };
        (ctx, outcome)
    }

    fn wrap(&self, url: &str, e: Error) -> FetchError {
        match e {
            Error::Timeout { .. } => FetchError::Timeout {
                ms: self.settings.timeout_ms,
                url: url.to_string(),
            },
            Error::BrowserLaunch { .. } => FetchError::Launch(e.to_string()),
            other => {
                let message = match other {
                    Error::Fetch(m) => m,
                    other => other.to_string(),
                };
                FetchError::Navigation {
                    url: url.to_string(),
                    message,
                }
            }
        }
    }

    /// Fetch with `retry_count + 1` attempts and `retry_delay * 2^i` sleeps between them.
    ///
    /// Never fails: the outcome, including the attempt count, is in the result.
    pub async fn fetch_with_retry(&self, url: &str) -> FetchResult {
        let t0 = Instant::now();
        let policy = self.settings.retry_policy();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetch_page(url).await {
                Ok(page) => {
                    return match convert_to_normalized_text(&page.html, self.settings.max_content_chars) {
                        Ok(content) => FetchResult {
                            url: url.to_string(),
                            title: page_title(&page.html),
                            final_url: page.final_url,
                            redirected: page.redirected,
                            status: FetchStatus::Success,
                            content,
                            error: None,
                            error_code: None,
                            retryable: false,
                            attempts: attempt,
                            elapsed_ms: t0.elapsed().as_millis(),
                        },
                        Err(e) => failed(url, e.to_string(), ErrorCode::Conversion, false, attempt, t0),
                    };
                }
                Err(e) => {
                    if e.is_retryable() && policy.has_attempts_left(attempt) {
                        let delay = policy.delay(attempt - 1);
                        tracing::warn!(
                            url,
                            attempt,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "page fetch failed; retrying"
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    tracing::warn!(url, attempts = attempt, error = %e, "page fetch failed");
                    return failed(
                        url,
                        format!("{e} (after {attempt} attempt(s))"),
                        e.code(),
                        e.is_retryable(),
                        attempt,
                        t0,
                    );
                }
            }
        }
    }
}

fn failed(
    url: &str,
    error: String,
    code: ErrorCode,
    retryable: bool,
    attempts: u32,
    t0: Instant,
) -> FetchResult {
    FetchResult {
        url: url.to_string(),
        final_url: url.to_string(),
        redirected: false,
        status: FetchStatus::Error,
        title: None,
        content: String::new(),
        error: Some(error),
        error_code: Some(code),
        retryable,
        attempts,
        elapsed_ms: t0.elapsed().as_millis(),
    }
}

fn same_url(requested: &url::Url, final_url: &str) -> bool {
    match url::Url::parse(final_url) {
        Ok(f) => f == *requested,
        Err(_) => final_url == requested.as_str(),
    }
}

/// Guidance for a browser launch failure, chosen by inspecting its message.
pub fn launch_guidance(message: &str) -> &'static str {
    let m = message.to_ascii_lowercase();
    let has = |keys: &[&str]| keys.iter().any(|k| m.contains(k));
    if has(&["permission denied", "eacces", "operation not permitted", "sandbox"]) {
        "The browser binary could not be started due to permissions. Check that it is executable, or run with browser.headless=true in a container that allows the sandbox."
    } else if has(&[
        "out of memory",
        "enomem",
        "cannot allocate",
        "resource temporarily unavailable",
        "too many open files",
        "no space left",
    ]) {
        "The system ran out of resources while starting the browser. Free memory or file descriptors, or lower concurrency."
    } else if has(&["display", "x server", "xvfb", "wayland", "headed"]) {
        "No display is available for a headed browser. Set browser.headless=true or provide a virtual display."
    } else if has(&[
        "no such file",
        "not found",
        "could not auto detect",
        "could not find",
        "executable",
    ]) {
        "No Chrome/Chromium binary was found. Install Chrome or Chromium, or set browser.executable to its path."
    } else {
        "The browser failed to start. Check the browser installation and browser.* settings."
    }
}

/// Driver selected by `AGENTPIPE_BROWSER_DRIVER` (`http` or `chrome`).
///
/// Defaults to Chrome when built with the `chrome` feature, plain HTTP otherwise.
pub fn driver_from_env() -> Result<Arc<dyn BrowserDriver>> {
    let choice = crate::env("AGENTPIPE_BROWSER_DRIVER").map(|s| s.to_ascii_lowercase());
    match choice.as_deref() {
        Some("http") => Ok(Arc::new(HttpDriver)),
        #[cfg(feature = "chrome")]
        Some("chrome") | None => Ok(Arc::new(crate::chrome::ChromeDriver)),
        #[cfg(not(feature = "chrome"))]
        None => Ok(Arc::new(HttpDriver)),
        #[cfg(not(feature = "chrome"))]
        Some("chrome") => Err(Error::NotSupported(
            "chrome driver requires building with the `chrome` feature".to_string(),
        )),
        Some(other) => Err(Error::Config(format!(
            "AGENTPIPE_BROWSER_DRIVER: expected http or chrome, got {other:?}"
        ))),
    }
}

/// Driver that "navigates" with plain HTTP GETs. Contexts share nothing (no cookie store).
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpDriver;

#[derive(Debug)]
struct HttpBrowser {
    client: reqwest::Client,
}

#[derive(Debug)]
struct HttpContext {
    client: reqwest::Client,
}

#[async_trait::async_trait]
impl BrowserDriver for HttpDriver {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn launch(&self, settings: &BrowserSettings) -> Result<Arc<dyn BrowserHandle>> {
        let ua = settings
            .user_agent
            .clone()
            .unwrap_or_else(|| concat!("agentpipe/", env!("CARGO_PKG_VERSION")).to_string());
        let client = reqwest::Client::builder()
            .user_agent(ua)
            .redirect(reqwest::redirect::Policy::limited(10))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                let message = e.to_string();
                Error::BrowserLaunch {
                    guidance: launch_guidance(&message).to_string(),
                    message,
                }
            })?;
        Ok(Arc::new(HttpBrowser { client }))
    }
}

#[async_trait::async_trait]
impl BrowserHandle for HttpBrowser {
    async fn new_context(&self, _settings: &BrowserSettings) -> Result<Box<dyn BrowsingContext>> {
        Ok(Box::new(HttpContext {
            client: self.client.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrowsingContext for HttpContext {
    // `wait_until` has no meaning without script execution; the full body is always read.
    async fn navigate(
        &mut self,
        url: &str,
        timeout: Duration,
        _wait_until: WaitUntil,
    ) -> Result<Navigation> {
        let timeout_ms = timeout.as_millis() as u64;
        let map_err = |e: reqwest::Error| {
            if e.is_timeout() {
                Error::Timeout { ms: timeout_ms }
            } else if e.is_connect() {
                Error::Fetch(format!("connection failed: {e}"))
            } else {
                Error::Fetch(e.to_string())
            }
        };
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_err)?;
        let final_url = resp.url().to_string();
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let mut headers = BTreeMap::new();
        for (k, v) in resp.headers().iter() {
            if let Ok(s) = v.to_str() {
                headers.insert(k.as_str().to_string(), s.to_string());
            }
        }

        let mut bytes = Vec::new();
        let mut stream = resp.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_err)?;
            if bytes.len().saturating_add(chunk.len()) > MAX_BODY_BYTES {
                let can_take = MAX_BODY_BYTES.saturating_sub(bytes.len());
                bytes.extend_from_slice(&chunk[..can_take]);
                break;
            }
            bytes.extend_from_slice(&chunk);
        }

        Ok(Navigation {
            final_url,
            status: Some(status),
            content_type,
            html: String::from_utf8_lossy(&bytes).into_owned(),
            headers,
        })
    }

    async fn close(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
