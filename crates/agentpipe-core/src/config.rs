//! Per-agent static configuration.
//!
//! Built once from resolved key/value pairs and validated at construction; read-only
//! afterwards. Tool-specific settings are a tagged variant per agent type instead of a
//! free-form map.

use crate::{Error, Result, RetryPolicy, SearchDepth, SearchTopic, MAX_SEARCH_RESULTS};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationParams {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub stop: Vec<String>,
    pub seed: Option<u64>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitUntil {
    Load,
    #[default]
    DomContentLoaded,
    NetworkIdle,
}

impl WaitUntil {
    pub fn as_str(self) -> &'static str {
        match self {
            WaitUntil::Load => "load",
            WaitUntil::DomContentLoaded => "domcontentloaded",
            WaitUntil::NetworkIdle => "networkidle",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "load" => Some(WaitUntil::Load),
            "domcontentloaded" | "dom_content_loaded" => Some(WaitUntil::DomContentLoaded),
            "networkidle" | "network_idle" => Some(WaitUntil::NetworkIdle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrowserSettings {
    pub headless: bool,
    pub timeout_ms: u64,
    pub wait_until: WaitUntil,
    /// Extra attempts after the first one.
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub user_agent: Option<String>,
    pub viewport: (u32, u32),
    pub max_content_chars: usize,
    /// Explicit browser binary; otherwise the driver searches the usual locations.
    pub executable: Option<PathBuf>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            timeout_ms: 30_000,
            wait_until: WaitUntil::DomContentLoaded,
            retry_count: 2,
            retry_delay: Duration::from_secs(1),
            user_agent: None,
            viewport: (1280, 800),
            max_content_chars: 50_000,
            executable: None,
        }
    }
}

impl BrowserSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::uncapped(self.retry_count.saturating_add(1), self.retry_delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchSettings {
    pub depth: SearchDepth,
    pub topic: SearchTopic,
    pub max_results: usize,
    pub include_answer: bool,
    pub include_raw_content: bool,
    pub include_domains: Vec<String>,
    pub exclude_domains: Vec<String>,
    pub time_range: Option<String>,
    /// Token budget for context lookups.
    pub context_max_tokens: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            depth: SearchDepth::Basic,
            topic: SearchTopic::General,
            max_results: 5,
            include_answer: false,
            include_raw_content: false,
            include_domains: Vec::new(),
            exclude_domains: Vec::new(),
            time_range: None,
            context_max_tokens: 4_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolConfig {
    Chat,
    Search(SearchSettings),
    Browser(BrowserSettings),
}

impl ToolConfig {
    pub fn agent_type(&self) -> &'static str {
        match self {
            ToolConfig::Chat => "chat",
            ToolConfig::Search(_) => "search",
            ToolConfig::Browser(_) => "browser",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub agent_id: String,
    pub provider: String,
    pub model: String,
    pub generation: GenerationParams,
    pub retry: RetryPolicy,
    pub tool: ToolConfig,
}

impl AgentConfig {
    pub fn new(agent_id: impl Into<String>, model: impl Into<String>, tool: ToolConfig) -> Self {
        Self {
            agent_id: agent_id.into(),
            provider: "openai_compat".to_string(),
            model: model.into(),
            generation: GenerationParams::default(),
            retry: RetryPolicy::default(),
            tool,
        }
    }

    /// Build from resolved key/value configuration.
    ///
    /// `agent_type` selects the tool variant (`chat`, `search`, `browser`). Unknown keys,
    /// keys for a different variant and out-of-range values are rejected.
    pub fn from_pairs(
        agent_id: &str,
        agent_type: &str,
        pairs: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let agent_id = agent_id.trim();
        if agent_id.is_empty() {
            return Err(Error::Config("agent_id must be non-empty".to_string()));
        }
        let mut tool = match agent_type.trim().to_ascii_lowercase().as_str() {
            "chat" => ToolConfig::Chat,
            "search" => ToolConfig::Search(SearchSettings::default()),
            "browser" => ToolConfig::Browser(BrowserSettings::default()),
            other => {
                return Err(Error::Config(format!(
                    "unknown agent type {other:?} (expected chat, search or browser)"
                )))
            }
        };

        let mut provider = "openai_compat".to_string();
        let mut model = String::new();
        let mut generation = GenerationParams::default();
        let mut retry = RetryPolicy::default();
        let mut retry_max_set = false;

        for (key, raw) in pairs {
            let v = raw.trim();
            match key.as_str() {
                "provider" => provider = non_empty(key, v)?,
                "model" => model = non_empty(key, v)?,
                "temperature" => {
                    let t: f64 = parse(key, v)?;
                    if !(0.0..=2.0).contains(&t) {
                        return Err(Error::Config(format!("temperature {t} outside 0..=2")));
                    }
                    generation.temperature = Some(t);
                }
                "max_tokens" => {
                    let n: u32 = parse(key, v)?;
                    if n == 0 {
                        return Err(Error::Config("max_tokens must be > 0".to_string()));
                    }
                    generation.max_tokens = Some(n);
                }
                "stop" => generation.stop = split_list(v),
                "seed" => generation.seed = Some(parse(key, v)?),
                "timeout_ms" => generation.timeout_ms = Some(positive_ms(key, v)?),
                "max_retries" => {
                    let n: u32 = parse(key, v)?;
                    if n == 0 {
                        return Err(Error::Config("max_retries must be >= 1".to_string()));
                    }
                    retry.max_attempts = n;
                }
                "retry_base_delay" => retry.base_delay = seconds(key, v)?,
                "retry_max_delay" => {
                    retry.max_delay = seconds(key, v)?;
                    retry_max_set = true;
                }
                k if k.starts_with("search.") || k == "context.max_tokens" => {
                    let ToolConfig::Search(s) = &mut tool else {
                        return Err(wrong_variant(k, agent_type));
                    };
                    apply_search_key(s, k, v)?;
                }
                k if k.starts_with("browser.") => {
                    let ToolConfig::Browser(b) = &mut tool else {
                        return Err(wrong_variant(k, agent_type));
                    };
                    apply_browser_key(b, k, v)?;
                }
                other => return Err(Error::Config(format!("unknown config key {other:?}"))),
            }
        }

        if model.is_empty() {
            return Err(Error::Config("model is required".to_string()));
        }
        if !retry_max_set && retry.max_delay < retry.base_delay {
            retry.max_delay = retry.base_delay;
        }
        if retry.max_delay < retry.base_delay {
            return Err(Error::Config(
                "retry_max_delay must be >= retry_base_delay".to_string(),
            ));
        }

        Ok(Self {
            agent_id: agent_id.to_string(),
            provider,
            model,
            generation,
            retry,
            tool,
        })
    }

    pub fn browser(&self) -> Option<&BrowserSettings> {
        match &self.tool {
            ToolConfig::Browser(b) => Some(b),
            _ => None,
        }
    }

    pub fn search(&self) -> Option<&SearchSettings> {
        match &self.tool {
            ToolConfig::Search(s) => Some(s),
            _ => None,
        }
    }

    /// Provider-neutral metadata: identity, generation parameters and derived fields.
    pub fn base_metadata(&self) -> BTreeMap<String, Value> {
        let mut m = BTreeMap::new();
        m.insert("agent_id".to_string(), Value::from(self.agent_id.clone()));
        m.insert("agent_type".to_string(), Value::from(self.tool.agent_type()));
        m.insert("provider".to_string(), Value::from(self.provider.clone()));
        m.insert("model".to_string(), Value::from(self.model.clone()));
        if let Some(t) = self.generation.temperature {
            m.insert("temperature".to_string(), Value::from(t));
        }
        if let Some(n) = self.generation.max_tokens {
            m.insert("max_tokens".to_string(), Value::from(n));
        }
        if let Some(s) = self.generation.seed {
            m.insert("seed".to_string(), Value::from(s));
        }
        if !self.generation.stop.is_empty() {
            m.insert("stop".to_string(), Value::from(self.generation.stop.clone()));
        }
        if let Some(ms) = self.generation.timeout_ms {
            m.insert("timeout_ms".to_string(), Value::from(ms));
        }
        match &self.tool {
            ToolConfig::Chat => {}
            ToolConfig::Search(s) => {
                m.insert("search_depth".to_string(), Value::from(s.depth.as_str()));
                m.insert("max_results".to_string(), Value::from(s.max_results));
            }
            ToolConfig::Browser(b) => {
                m.insert("headless".to_string(), Value::from(b.headless));
                m.insert("browser_timeout_ms".to_string(), Value::from(b.timeout_ms));
                m.insert("retry_count".to_string(), Value::from(b.retry_count));
            }
        }
        m
    }
}

fn apply_search_key(s: &mut SearchSettings, key: &str, v: &str) -> Result<()> {
    match key {
        "search.depth" => {
            s.depth = SearchDepth::parse(v)
                .ok_or_else(|| Error::Config(format!("{key}: expected basic or advanced")))?
        }
        "search.topic" => {
            s.topic = SearchTopic::parse(v).ok_or_else(|| {
                Error::Config(format!("{key}: expected general, news or finance"))
            })?
        }
        "search.max_results" => {
            let n: usize = parse(key, v)?;
            if n == 0 || n > MAX_SEARCH_RESULTS {
                return Err(Error::Config(format!(
                    "{key} must be within 1..={MAX_SEARCH_RESULTS}"
                )));
            }
            s.max_results = n;
        }
        "search.include_answer" => s.include_answer = boolean(key, v)?,
        "search.include_raw_content" => s.include_raw_content = boolean(key, v)?,
        "search.include_domains" => s.include_domains = split_list(v),
        "search.exclude_domains" => s.exclude_domains = split_list(v),
        "search.time_range" => {
            if !matches!(v, "day" | "week" | "month" | "year") {
                return Err(Error::Config(format!(
                    "{key}: expected day, week, month or year"
                )));
            }
            s.time_range = Some(v.to_string());
        }
        "context.max_tokens" => {
            let n: usize = parse(key, v)?;
            if n == 0 {
                return Err(Error::Config(format!("{key} must be > 0")));
            }
            s.context_max_tokens = n;
        }
        other => return Err(Error::Config(format!("unknown config key {other:?}"))),
    }
    Ok(())
}

fn apply_browser_key(b: &mut BrowserSettings, key: &str, v: &str) -> Result<()> {
    match key {
        "browser.headless" => b.headless = boolean(key, v)?,
        "browser.timeout_ms" => b.timeout_ms = positive_ms(key, v)?,
        "browser.wait_until" => {
            b.wait_until = WaitUntil::parse(v).ok_or_else(|| {
                Error::Config(format!(
                    "{key}: expected load, domcontentloaded or networkidle"
                ))
            })?
        }
        "browser.retry_count" => b.retry_count = parse(key, v)?,
        "browser.retry_delay" => b.retry_delay = seconds(key, v)?,
        "browser.user_agent" => b.user_agent = Some(non_empty(key, v)?),
        "browser.viewport_width" => b.viewport.0 = parse(key, v)?,
        "browser.viewport_height" => b.viewport.1 = parse(key, v)?,
        "browser.max_content_chars" => {
            let n: usize = parse(key, v)?;
            if n == 0 {
                return Err(Error::Config(format!("{key} must be > 0")));
            }
            b.max_content_chars = n;
        }
        "browser.executable" => b.executable = Some(PathBuf::from(non_empty(key, v)?)),
        other => return Err(Error::Config(format!("unknown config key {other:?}"))),
    }
    Ok(())
}

fn wrong_variant(key: &str, agent_type: &str) -> Error {
    Error::Config(format!("{key} does not apply to agent type {agent_type:?}"))
}

fn parse<T: std::str::FromStr>(key: &str, v: &str) -> Result<T> {
    v.parse::<T>()
        .map_err(|_| Error::Config(format!("{key}: cannot parse {v:?}")))
}

fn non_empty(key: &str, v: &str) -> Result<String> {
    if v.is_empty() {
        return Err(Error::Config(format!("{key} must be non-empty")));
    }
    Ok(v.to_string())
}

fn boolean(key: &str, v: &str) -> Result<bool> {
    match v.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{key}: expected a boolean, got {v:?}"))),
    }
}

fn positive_ms(key: &str, v: &str) -> Result<u64> {
    let n: u64 = parse(key, v)?;
    if n == 0 {
        return Err(Error::Config(format!("{key} must be > 0")));
    }
    Ok(n)
}

fn seconds(key: &str, v: &str) -> Result<Duration> {
    let s: f64 = parse(key, v)?;
    if !s.is_finite() || !(0.0..=86_400.0).contains(&s) {
        return Err(Error::Config(format!(
            "{key} must be a number of seconds within 0..=86400"
        )));
    }
    Ok(Duration::from_secs_f64(s))
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(kv: &[(&str, &str)]) -> BTreeMap<String, String> {
        kv.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn builds_browser_agent_with_overrides() {
        let cfg = AgentConfig::from_pairs(
            "scraper",
            "browser",
            &pairs(&[
                ("model", "gpt-4o-mini"),
                ("temperature", "0.2"),
                ("stop", "END, STOP"),
                ("browser.headless", "false"),
                ("browser.retry_count", "0"),
                ("browser.retry_delay", "0.5"),
                ("browser.wait_until", "networkidle"),
            ]),
        )
        .unwrap();
        let b = cfg.browser().unwrap();
        assert!(!b.headless);
        assert_eq!(b.retry_count, 0);
        assert_eq!(b.retry_delay, Duration::from_millis(500));
        assert_eq!(b.wait_until, WaitUntil::NetworkIdle);
        assert_eq!(cfg.generation.stop, vec!["END", "STOP"]);
        assert_eq!(cfg.base_metadata()["headless"], Value::from(false));
    }

    #[test]
    fn rejects_keys_for_another_variant() {
        let err = AgentConfig::from_pairs(
            "a",
            "chat",
            &pairs(&[("model", "m"), ("browser.headless", "true")]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn rejects_out_of_range_values() {
        for (k, v) in [
            ("temperature", "2.5"),
            ("max_tokens", "0"),
            ("max_retries", "0"),
            ("retry_base_delay", "-1"),
            ("nonsense", "1"),
        ] {
            let r = AgentConfig::from_pairs("a", "chat", &pairs(&[("model", "m"), (k, v)]));
            assert!(r.is_err(), "{k}={v} should be rejected");
        }
    }

    #[test]
    fn retry_tunables_are_applied() {
        let cfg = AgentConfig::from_pairs(
            "a",
            "search",
            &pairs(&[
                ("model", "m"),
                ("max_retries", "5"),
                ("retry_base_delay", "0.25"),
                ("retry_max_delay", "2"),
                ("search.max_results", "10"),
                ("search.depth", "advanced"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.base_delay, Duration::from_millis(250));
        assert_eq!(cfg.retry.max_delay, Duration::from_secs(2));
        let s = cfg.search().unwrap();
        assert_eq!(s.max_results, 10);
        assert_eq!(s.depth, SearchDepth::Advanced);
    }

    #[test]
    fn model_is_required() {
        let r = AgentConfig::from_pairs("a", "chat", &BTreeMap::new());
        assert!(matches!(r, Err(Error::Config(_))));
    }

    #[test]
    fn browser_retry_policy_has_one_more_attempt_than_retries() {
        let b = BrowserSettings {
            retry_count: 2,
            retry_delay: Duration::from_secs(1),
            ..BrowserSettings::default()
        };
        let p = b.retry_policy();
        assert_eq!(p.max_attempts, 3);
        assert_eq!(p.delays(), vec![Duration::from_secs(1), Duration::from_secs(2)]);
    }
}
