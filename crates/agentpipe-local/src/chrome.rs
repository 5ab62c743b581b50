//! Chromium-backed browser driver (feature `chrome`).
//!
//! headless_chrome is blocking; every call runs on the blocking pool. The Chromium process
//! lives as long as the [`ChromeBrowser`] handle holds it: contexts only hold their tab, so an
//! explicit `close` tears the process down and later `new_context` calls fail.

use crate::render::launch_guidance;
use agentpipe_core::{
    BrowserDriver, BrowserHandle, BrowserSettings, BrowsingContext, Error, Navigation, Result,
    WaitUntil,
};
use headless_chrome::protocol::cdp::Target;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const STATUS_PROBE: &str = "JSON.stringify({\
    status: ((performance.getEntriesByType('navigation') || [])[0] || {}).responseStatus || null,\
    contentType: document.contentType || null\
})";

#[derive(Debug, Clone, Copy, Default)]
pub struct ChromeDriver;

struct ChromeBrowser {
    browser: Mutex<Option<Browser>>,
}

impl ChromeBrowser {
    fn running(&self) -> Result<Browser> {
        self.browser
            .lock()
            .map_err(|_| Error::Fetch("browser lock poisoned".to_string()))?
            .clone()
            .ok_or_else(|| Error::Fetch("browser is closed".to_string()))
    }
}

struct ChromeContext {
    context_id: String,
    tab: Arc<Tab>,
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Fetch(format!("browser task join failed: {e}")))?
}

#[async_trait::async_trait]
impl BrowserDriver for ChromeDriver {
    fn name(&self) -> &'static str {
        "chrome"
    }

    async fn launch(&self, settings: &BrowserSettings) -> Result<Arc<dyn BrowserHandle>> {
        let settings = settings.clone();
        let browser = blocking(move || {
            let launch_err = |message: String| Error::BrowserLaunch {
                guidance: launch_guidance(&message).to_string(),
                message,
            };
            let opts = LaunchOptions::default_builder()
                .headless(settings.headless)
                .window_size(Some(settings.viewport))
                .path(settings.executable.clone())
                .idle_browser_timeout(Duration::from_secs(300))
                .build()
                .map_err(|e| launch_err(e.to_string()))?;
            // A failed launch kills the spawned process before returning.
            Browser::new(opts).map_err(|e| launch_err(e.to_string()))
        })
        .await?;
        tracing::info!(headless = settings.headless, "chrome started");
        Ok(Arc::new(ChromeBrowser {
            browser: Mutex::new(Some(browser)),
        }))
    }
}

#[async_trait::async_trait]
impl BrowserHandle for ChromeBrowser {
    async fn new_context(&self, settings: &BrowserSettings) -> Result<Box<dyn BrowsingContext>> {
        let browser = self.running()?;
        let user_agent = settings.user_agent.clone();
        let (context_id, tab) = blocking(move || {
            let ctx = browser
                .new_context()
                .map_err(|e| Error::Fetch(format!("browser context failed: {e}")))?;
            let id = ctx.get_id().to_string();
            let tab = ctx
                .new_tab()
                .map_err(|e| Error::Fetch(format!("browser tab failed: {e}")))?;
            if let Some(ua) = user_agent.as_deref() {
                tab.set_user_agent(ua, None, None)
                    .map_err(|e| Error::Fetch(format!("set user agent failed: {e}")))?;
            }
            Ok((id, tab))
        })
        .await?;
        Ok(Box::new(ChromeContext { context_id, tab }))
    }

    async fn close(&self) -> Result<()> {
        let taken = self
            .browser
            .lock()
            .map_err(|_| Error::Fetch("browser lock poisoned".to_string()))?
            .take();
        let Some(browser) = taken else {
            return Ok(());
        };
        // Dropping the last `Browser` clone closes Chromium and kills the process.
        blocking(move || {
            if let Ok(tabs) = browser.get_tabs().lock() {
                for t in tabs.iter() {
                    let _ = t.close(false);
                }
            }
            Ok(())
        })
        .await?;
        tracing::info!("chrome stopped");
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrowsingContext for ChromeContext {
    async fn navigate(
        &mut self,
        url: &str,
        timeout: Duration,
        wait_until: WaitUntil,
    ) -> Result<Navigation> {
        let tab = self.tab.clone();
        let url = url.to_string();
        let ms = timeout.as_millis() as u64;
        blocking(move || {
            let nav_err = |e: String| {
                let lc = e.to_ascii_lowercase();
                if lc.contains("timeout") || lc.contains("never came") {
                    Error::Timeout { ms }
                } else {
                    Error::Fetch(e)
                }
            };
            tab.set_default_timeout(timeout);
            tab.navigate_to(&url).map_err(|e| nav_err(e.to_string()))?;
            tab.wait_until_navigated()
                .map_err(|e| nav_err(e.to_string()))?;
            match wait_until {
                WaitUntil::DomContentLoaded => {}
                WaitUntil::Load => {
                    tab.wait_for_element("body")
                        .map_err(|e| nav_err(e.to_string()))?;
                }
                WaitUntil::NetworkIdle => {
                    tab.wait_for_element("body")
                        .map_err(|e| nav_err(e.to_string()))?;
                    std::thread::sleep(Duration::from_millis(500));
                }
            }

            let probe = tab
                .evaluate(STATUS_PROBE, false)
                .ok()
                .and_then(|o| o.value)
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .and_then(|s| serde_json::from_str::<serde_json::Value>(&s).ok())
                .unwrap_or(serde_json::Value::Null);
            let status = probe["status"].as_u64().and_then(|s| u16::try_from(s).ok());
            let content_type = probe["contentType"].as_str().map(|s| s.to_string());

            let html = tab
                .get_content()
                .map_err(|e| Error::Fetch(format!("get content failed: {e}")))?;
            Ok(Navigation {
                final_url: tab.get_url(),
                status,
                content_type,
                html,
                headers: BTreeMap::new(),
            })
        })
        .await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let ChromeContext { context_id, tab } = *self;
        blocking(move || {
            // Disposing the context also closes its tab.
            let disposed = tab.call_method(Target::DisposeBrowserContext {
                browser_context_id: context_id.clone(),
            });
            if let Err(e) = disposed {
                tracing::debug!(context_id = %context_id, error = %e, "dispose browser context failed; closing tab");
                tab.close(false)
                    .map_err(|e| Error::Fetch(format!("close tab failed: {e}")))?;
            }
            Ok(())
        })
        .await
    }
}
