use crate::env;
use crate::render::{driver_from_env, PageFetcher};
use crate::search::TavilyClient;
use crate::tools::{FetchPageTool, ToolSet, WebContextTool, WebExtractTool, WebSearchTool};
use agentpipe_core::{
    classify_status, AgentConfig, AgentRuntime, ApiError, Error, GenerationParams, InvokeOptions,
    Message, ModelOutput, Result, Role, TaskRequest, ToolCall, ToolConfig, UsageInfo,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MAX_TOOL_ROUNDS: usize = 8;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

fn openai_compat_base_url_from_env() -> Option<String> {
    env("AGENTPIPE_OPENAI_COMPAT_BASE_URL")
}

fn openai_compat_api_key_from_env() -> Option<String> {
    env("AGENTPIPE_OPENAI_COMPAT_API_KEY")
}

pub fn openai_compat_model_from_env() -> Option<String> {
    env("AGENTPIPE_OPENAI_COMPAT_MODEL")
}

/// Engines an agent variant may hand to the model as tools.
#[derive(Debug, Clone)]
pub enum Toolkit {
    Chat,
    Search(Arc<TavilyClient>),
    Browser(Arc<PageFetcher>),
}

impl Toolkit {
    fn agent_type(&self) -> &'static str {
        match self {
            Toolkit::Chat => "chat",
            Toolkit::Search(_) => "search",
            Toolkit::Browser(_) => "browser",
        }
    }

    fn tool_names(&self) -> &'static [&'static str] {
        match self {
            Toolkit::Chat => &[],
            Toolkit::Search(_) => &["web_search", "web_extract", "web_context"],
            Toolkit::Browser(_) => &["fetch_page"],
        }
    }
}

/// `AgentRuntime` over an OpenAI-compatible `/v1/chat/completions` endpoint.
///
/// Runs the tool-call loop itself; the completion requests are not retried.
#[derive(Debug, Clone)]
pub struct OpenAiCompatRuntime {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    system_prompt: Option<String>,
    max_tool_rounds: usize,
    toolkit: Toolkit,
}

/// Call-scoped dependencies, built fresh for every task.
#[derive(Debug)]
pub struct ChatDeps {
    pub model: String,
    pub tools: ToolSet,
}

impl OpenAiCompatRuntime {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, toolkit: Toolkit) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: None,
            system_prompt: None,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
            toolkit,
        }
    }

    /// Endpoint and key from the environment; engines built from the agent's tool config.
    pub fn from_env(client: reqwest::Client, config: &AgentConfig) -> Result<Self> {
        let base_url = openai_compat_base_url_from_env().ok_or_else(|| {
            Error::NotConfigured("missing AGENTPIPE_OPENAI_COMPAT_BASE_URL".to_string())
        })?;
        let toolkit = match &config.tool {
            ToolConfig::Chat => Toolkit::Chat,
            ToolConfig::Search(_) => Toolkit::Search(Arc::new(
                TavilyClient::from_env(client.clone())?.with_retry_policy(config.retry),
            )),
            ToolConfig::Browser(b) => {
                Toolkit::Browser(Arc::new(PageFetcher::new(driver_from_env()?, b.clone())))
            }
        };
        let mut rt = Self::new(client, base_url, toolkit);
        rt.api_key = openai_compat_api_key_from_env();
        Ok(rt)
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_max_tool_rounds(mut self, n: usize) -> Self {
        self.max_tool_rounds = n.max(1);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Release the browser, if this runtime ever started one.
    pub async fn close(&self) -> Result<()> {
        match &self.toolkit {
            Toolkit::Browser(f) => f.close().await,
            _ => Ok(()),
        }
    }

    fn endpoint_chat_completions(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        )
    }

    async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        tools: &ToolSet,
        generation: &GenerationParams,
        timeout: Duration,
    ) -> Result<ChatCompletionsResponse> {
        let mut body = json!({
            "model": model,
            "messages": messages.iter().map(wire_message).collect::<Vec<_>>(),
            "stream": false,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools.definitions());
        }
        if let Some(t) = generation.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(n) = generation.max_tokens {
            body["max_tokens"] = json!(n);
        }
        if !generation.stop.is_empty() {
            body["stop"] = json!(generation.stop);
        }
        if let Some(s) = generation.seed {
            body["seed"] = json!(s);
        }

        let mut rb = self
            .client
            .post(self.endpoint_chat_completions())
            .timeout(timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(k) = &self.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }

        let resp = rb.json(&body).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout {
                    ms: timeout.as_millis() as u64,
                }
            } else {
                Error::Llm(e.to_string())
            }
        })?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            let detail = agentpipe_core::task::preview(detail.trim(), 200);
            let kind = classify_status(status.as_u16());
            return Err(Error::Api(
                ApiError::new(
                    kind,
                    format!("openai_compat chat.completions HTTP {status}: {detail}"),
                )
                .with_status(status.as_u16()),
            ));
        }
        resp.json().await.map_err(|e| Error::Llm(e.to_string()))
    }
}

#[async_trait::async_trait]
impl AgentRuntime for OpenAiCompatRuntime {
    type Deps = ChatDeps;

    fn agent_type(&self) -> &'static str {
        self.toolkit.agent_type()
    }

    fn build_deps(&self, config: &AgentConfig, _request: &TaskRequest) -> Result<ChatDeps> {
        let mut tools = ToolSet::new();
        match (&self.toolkit, &config.tool) {
            (Toolkit::Chat, ToolConfig::Chat) => {}
            (Toolkit::Search(c), ToolConfig::Search(s)) => {
                tools.register(WebSearchTool::new(c.clone(), s.clone()));
                tools.register(WebExtractTool::new(c.clone()));
                tools.register(WebContextTool::new(c.clone(), s.clone()));
            }
            (Toolkit::Browser(f), ToolConfig::Browser(_)) => {
                tools.register(FetchPageTool::new(f.clone()));
            }
            (tk, tool) => {
                return Err(Error::Defect(format!(
                    "{} runtime given {} configuration for agent {:?}",
                    tk.agent_type(),
                    tool.agent_type(),
                    config.agent_id
                )))
            }
        }
        Ok(ChatDeps {
            model: config.model.clone(),
            tools,
        })
    }

    async fn invoke(
        &self,
        task: &str,
        deps: &ChatDeps,
        options: &InvokeOptions,
    ) -> Result<ModelOutput> {
        let timeout = options.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let mut messages = Vec::new();
        if let Some(s) = &self.system_prompt {
            messages.push(Message::system(s.clone()));
        }
        messages.push(Message::user(task));

        let mut usage = UsageInfo::default();
        for round in 0..self.max_tool_rounds {
            let resp = self
                .complete(&deps.model, &messages, &deps.tools, &options.generation, timeout)
                .await?;
            usage.accumulate(&resp.usage_info());
            let Some(choice) = resp.choices.into_iter().next() else {
                return Err(Error::Llm("completion returned no choices".to_string()));
            };
            let content = choice.message.content.unwrap_or_default();
            let calls: Vec<ToolCall> = choice
                .message
                .tool_calls
                .into_iter()
                .map(|c| ToolCall {
                    id: c.id,
                    arguments: parse_arguments(c.function.arguments),
                    name: c.function.name,
                })
                .collect();

            if calls.is_empty() {
                messages.push(Message::assistant(content.clone()));
                return Ok(ModelOutput {
                    output: content,
                    usage: (!usage.is_empty()).then_some(usage),
                    trace: messages,
                });
            }

            tracing::debug!(round, calls = calls.len(), "model requested tool calls");
            messages.push(Message::assistant_tool_calls(content, calls.clone()));
            for call in calls {
                let msg = match &call.arguments {
                    Value::Object(_) => match deps.tools.call(&call.name, call.arguments.clone()).await {
                        Ok(out) => Message::tool_result(&call.id, out, false),
                        Err(e) => Message::tool_result(&call.id, e, true),
                    },
                    _ => Message::tool_result(
                        &call.id,
                        format!("arguments for {} must be a JSON object", call.name),
                        true,
                    ),
                };
                messages.push(msg);
            }
        }
        Err(Error::Llm(format!(
            "tool-call limit of {} rounds reached without a final answer",
            self.max_tool_rounds
        )))
    }

    fn metadata(&self, config: &AgentConfig) -> BTreeMap<String, Value> {
        let mut m = config.base_metadata();
        m.insert("runtime".to_string(), json!("openai_compat"));
        m.insert("tools".to_string(), json!(self.toolkit.tool_names()));
        m.insert("max_tool_rounds".to_string(), json!(self.max_tool_rounds));
        if let Toolkit::Browser(f) = &self.toolkit {
            m.insert("browser_driver".to_string(), json!(f.driver_name()));
            m.insert("headless".to_string(), json!(f.settings().headless));
        }
        m
    }
}

/// Providers send arguments as a JSON string; an empty string means no arguments.
fn parse_arguments(raw: String) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn wire_message(m: &Message) -> Value {
    let role = match m.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    match m.role {
        Role::Assistant if !m.tool_calls.is_empty() => json!({
            "role": role,
            "content": if m.content.is_empty() { Value::Null } else { json!(m.content) },
            "tool_calls": m.tool_calls.iter().map(|c| json!({
                "id": c.id,
                "type": "function",
                "function": {"name": c.name, "arguments": c.arguments.to_string()},
            })).collect::<Vec<_>>(),
        }),
        Role::Tool => json!({
            "role": role,
            "tool_call_id": m.tool_call_id,
            "content": m.content,
        }),
        _ => json!({"role": role, "content": m.content}),
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionsResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

impl ChatCompletionsResponse {
    fn usage_info(&self) -> UsageInfo {
        let u = self.usage.clone().unwrap_or_default();
        UsageInfo {
            total_tokens: u.total_tokens,
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            requests: Some(1),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Clone, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Clone, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::serve;
    use crate::tools::Tool;
    use agentpipe_core::{ErrorCode, ErrorKind, SearchSettings};
    use axum::{http::StatusCode, routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chat_config() -> AgentConfig {
        AgentConfig::new("writer", "stub-model", ToolConfig::Chat)
    }

    async fn stub(reply: fn(usize, &Value) -> (StatusCode, Value)) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h2 = hits.clone();
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move |Json(body): Json<Value>| {
                let h2 = h2.clone();
                async move {
                    let i = h2.fetch_add(1, Ordering::SeqCst);
                    let (status, v) = reply(i, &body);
                    (status, Json(v))
                }
            }),
        );
        let addr = serve(app).await;
        (format!("http://{addr}"), hits)
    }

    fn answer(content: &str, total: u64) -> Value {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": total - 2, "completion_tokens": 2, "total_tokens": total}
        })
    }

    #[tokio::test]
    async fn single_completion_returns_output_usage_and_trace() {
        let (base, hits) = stub(|_, body| {
            assert_eq!(body["model"], "stub-model");
            assert_eq!(body["temperature"], 0.3);
            assert!(body.get("tools").is_none());
            (StatusCode::OK, answer("hello", 12))
        })
        .await;
        let rt = OpenAiCompatRuntime::new(reqwest::Client::new(), base, Toolkit::Chat);
        let mut cfg = chat_config();
        cfg.generation.temperature = Some(0.3);
        let deps = rt.build_deps(&cfg, &TaskRequest::new("hi")).unwrap();
        let opts = InvokeOptions {
            generation: cfg.generation.clone(),
            ..InvokeOptions::default()
        };
        let out = rt.invoke("hi", &deps, &opts).await.unwrap();
        assert_eq!(out.output, "hello");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let usage = out.usage.unwrap();
        assert_eq!(usage.total_tokens, Some(12));
        assert_eq!(usage.requests, Some(1));
        assert_eq!(out.trace.len(), 2);
        assert_eq!(out.trace[1].role, Role::Assistant);
    }

    struct Upper;

    #[async_trait::async_trait]
    impl Tool for Upper {
        fn name(&self) -> &str {
            "upper"
        }
        fn description(&self) -> &str {
            "uppercase text"
        }
        async fn call(&self, args: Value) -> std::result::Result<String, String> {
            Ok(args["text"].as_str().unwrap_or("").to_uppercase())
        }
    }

    #[tokio::test]
    async fn tool_calls_loop_until_a_final_answer() {
        let (base, hits) = stub(|i, body| match i {
            0 => (
                StatusCode::OK,
                json!({
                    "choices": [{"message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "upper", "arguments": "{\"text\":\"abc\"}"}
                        }]
                    }}],
                    "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
                }),
            ),
            _ => {
                let msgs = body["messages"].as_array().unwrap();
                let tool_msg = msgs.iter().find(|m| m["role"] == "tool").unwrap();
                assert_eq!(tool_msg["tool_call_id"], "call_1");
                assert_eq!(tool_msg["content"], "ABC");
                (StatusCode::OK, answer("done", 20))
            }
        })
        .await;
        let rt = OpenAiCompatRuntime::new(reqwest::Client::new(), base, Toolkit::Chat);
        let mut deps = rt.build_deps(&chat_config(), &TaskRequest::new("t")).unwrap();
        deps.tools.register(Upper);

        let out = rt.invoke("t", &deps, &InvokeOptions::default()).await.unwrap();
        assert_eq!(out.output, "done");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        let usage = out.usage.unwrap();
        assert_eq!(usage.total_tokens, Some(35));
        assert_eq!(usage.requests, Some(2));
        // user, assistant(tool call), tool, assistant
        assert_eq!(out.trace.len(), 4);
        let records = agentpipe_core::ToolInvocationRecord::from_trace(&out.trace);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "upper");
        assert_eq!(records[0].result_preview, "ABC");
    }

    #[tokio::test]
    async fn unknown_tools_come_back_to_the_model_as_errors() {
        let (base, _) = stub(|i, body| match i {
            0 => (
                StatusCode::OK,
                json!({"choices": [{"message": {"tool_calls": [{
                    "id": "c", "function": {"name": "nope", "arguments": "{}"}
                }]}}]}),
            ),
            _ => {
                let msgs = body["messages"].as_array().unwrap();
                assert!(msgs.iter().any(|m| m["role"] == "tool"));
                (StatusCode::OK, answer("recovered", 3))
            }
        })
        .await;
        let rt = OpenAiCompatRuntime::new(reqwest::Client::new(), base, Toolkit::Chat);
        let deps = rt.build_deps(&chat_config(), &TaskRequest::new("t")).unwrap();
        let out = rt.invoke("t", &deps, &InvokeOptions::default()).await.unwrap();
        assert_eq!(out.output, "recovered");
        assert!(out.trace.iter().any(|m| m.is_error));
    }

    #[tokio::test]
    async fn rate_limits_are_classified_and_not_retried() {
        let (base, hits) = stub(|_, _| (StatusCode::TOO_MANY_REQUESTS, json!({"error": "slow down"}))).await;
        let rt = OpenAiCompatRuntime::new(reqwest::Client::new(), base, Toolkit::Chat);
        let deps = rt.build_deps(&chat_config(), &TaskRequest::new("t")).unwrap();
        let err = rt.invoke("t", &deps, &InvokeOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::RateLimit);
        assert!(matches!(&err, Error::Api(e) if e.kind == ErrorKind::RateLimit));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tool_round_limit_is_an_error() {
        let (base, hits) = stub(|_, _| {
            (
                StatusCode::OK,
                json!({"choices": [{"message": {"tool_calls": [{
                    "id": "c", "function": {"name": "upper", "arguments": "{\"text\":\"x\"}"}
                }]}}]}),
            )
        })
        .await;
        let rt = OpenAiCompatRuntime::new(reqwest::Client::new(), base, Toolkit::Chat)
            .with_max_tool_rounds(2);
        let mut deps = rt.build_deps(&chat_config(), &TaskRequest::new("t")).unwrap();
        deps.tools.register(Upper);
        let err = rt.invoke("t", &deps, &InvokeOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Llm(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn mismatched_config_is_a_defect() {
        let rt = OpenAiCompatRuntime::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            Toolkit::Browser(Arc::new(PageFetcher::http(Default::default()))),
        );
        let cfg = AgentConfig::new("a", "m", ToolConfig::Search(SearchSettings::default()));
        let err = rt.build_deps(&cfg, &TaskRequest::new("t")).unwrap_err();
        assert!(err.is_defect());
    }

    #[test]
    fn browser_metadata_reports_headless_and_tools() {
        let cfg = AgentConfig::new("b", "m", ToolConfig::Browser(Default::default()));
        let rt = OpenAiCompatRuntime::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            Toolkit::Browser(Arc::new(PageFetcher::http(Default::default()))),
        );
        let m = rt.metadata(&cfg);
        assert_eq!(m["headless"], json!(true));
        assert_eq!(m["tools"], json!(["fetch_page"]));
        assert_eq!(m["model"], json!("m"));
        let deps = rt.build_deps(&cfg, &TaskRequest::new("t")).unwrap();
        assert_eq!(deps.tools.names(), vec!["fetch_page"]);
    }
}
