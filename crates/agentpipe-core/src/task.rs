//! Per-task request/result types and the capability traits the execution pipeline is
//! parameterized over.

use crate::{AgentConfig, Error, ErrorCode, GenerationParams, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// One task handed to an agent. Immutable once built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task: String,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    /// Per-call override of the agent's generation timeout.
    pub timeout_ms: Option<u64>,
    /// Caller-supplied correlation id; one is generated when absent.
    pub correlation_id: Option<String>,
}

impl TaskRequest {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Request override first, then the agent default. Zero counts as unset.
    pub fn effective_timeout(&self, generation: &GenerationParams) -> Option<Duration> {
        self.timeout_ms
            .filter(|ms| *ms > 0)
            .or(generation.timeout_ms.filter(|ms| *ms > 0))
            .map(Duration::from_millis)
    }
}

/// Token accounting; providers report differing subsets, so every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests: Option<u64>,
}

impl UsageInfo {
    pub fn is_empty(&self) -> bool {
        self.total_tokens.is_none()
            && self.prompt_tokens.is_none()
            && self.completion_tokens.is_none()
            && self.requests.is_none()
    }

    /// Field-wise sum; a field stays `None` only if both sides lack it.
    pub fn accumulate(&mut self, other: &UsageInfo) {
        fn add(a: Option<u64>, b: Option<u64>) -> Option<u64> {
            match (a, b) {
                (None, None) => None,
                (a, b) => Some(a.unwrap_or(0).saturating_add(b.unwrap_or(0))),
            }
        }
        self.total_tokens = add(self.total_tokens, other.total_tokens);
        self.prompt_tokens = add(self.prompt_tokens, other.prompt_tokens);
        self.completion_tokens = add(self.completion_tokens, other.completion_tokens);
        self.requests = add(self.requests, other.requests);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One entry of the interaction trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Set on tool messages whose call failed.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            is_error: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::plain(Role::Assistant, content)
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            is_error,
            ..Self::plain(Role::Tool, content)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Ok,
    Error,
    /// The model requested the call but no result made it into the trace.
    Missing,
}

const ARGS_SUMMARY_CHARS: usize = 200;
const RESULT_PREVIEW_CHARS: usize = 300;

/// Audit record for one completed tool call. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocationRecord {
    pub name: String,
    pub args_summary: String,
    pub correlation_id: String,
    pub status: ToolStatus,
    pub result_preview: String,
}

impl ToolInvocationRecord {
    /// Pair each requested tool call with its result message, in call order.
    pub fn from_trace(trace: &[Message]) -> Vec<Self> {
        let mut out = Vec::new();
        for m in trace.iter().filter(|m| m.role == Role::Assistant) {
            for call in &m.tool_calls {
                let result = trace.iter().find(|r| {
                    r.role == Role::Tool && r.tool_call_id.as_deref() == Some(call.id.as_str())
                });
                let (status, result_preview) = match result {
                    Some(r) if r.is_error => (ToolStatus::Error, preview(&r.content, RESULT_PREVIEW_CHARS)),
                    Some(r) => (ToolStatus::Ok, preview(&r.content, RESULT_PREVIEW_CHARS)),
                    None => (ToolStatus::Missing, String::new()),
                };
                out.push(Self {
                    name: call.name.clone(),
                    args_summary: preview(&call.arguments.to_string(), ARGS_SUMMARY_CHARS),
                    correlation_id: call.id.clone(),
                    status,
                    result_preview,
                });
            }
        }
        out
    }
}

/// Bounded preview on a char boundary, with a trailing ellipsis when cut.
pub fn preview(s: &str, max_chars: usize) -> String {
    let mut it = s.chars();
    let head: String = it.by_ref().take(max_chars).collect();
    if it.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

/// The single outcome of running one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ExecutionResult {
    Success {
        content: String,
        elapsed_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<UsageInfo>,
        metadata: BTreeMap<String, Value>,
        trace: Vec<Message>,
        tool_calls: Vec<ToolInvocationRecord>,
    },
    Error {
        message: String,
        code: ErrorCode,
        elapsed_ms: u64,
    },
}

impl ExecutionResult {
    pub fn error(message: impl Into<String>, code: ErrorCode, elapsed: Duration) -> Self {
        ExecutionResult::Error {
            message: message.into(),
            code,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    pub fn elapsed_ms(&self) -> u64 {
        match self {
            ExecutionResult::Success { elapsed_ms, .. } | ExecutionResult::Error { elapsed_ms, .. } => {
                *elapsed_ms
            }
        }
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            ExecutionResult::Error { code, .. } => Some(*code),
            ExecutionResult::Success { .. } => None,
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            ExecutionResult::Success { content, .. } => Some(content),
            ExecutionResult::Error { .. } => None,
        }
    }

    pub fn usage(&self) -> Option<&UsageInfo> {
        match self {
            ExecutionResult::Success { usage, .. } => usage.as_ref(),
            ExecutionResult::Error { .. } => None,
        }
    }
}

/// What the model layer hands back from one invocation.
#[derive(Debug, Clone, Default)]
pub struct ModelOutput {
    pub output: String,
    pub usage: Option<UsageInfo>,
    pub trace: Vec<Message>,
}

/// Extra options passed through to the model layer.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub generation: GenerationParams,
    pub timeout: Option<Duration>,
    pub context: BTreeMap<String, Value>,
}

/// Capability set one agent variant plugs into the execution pipeline.
#[async_trait::async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Call-scoped dependencies (client handles, tools); built fresh per task.
    type Deps: Send + Sync;

    fn agent_type(&self) -> &'static str;

    fn build_deps(&self, config: &AgentConfig, request: &TaskRequest) -> Result<Self::Deps>;

    /// Exactly one call per task. Tool calls made inside are the runtime's business.
    async fn invoke(
        &self,
        task: &str,
        deps: &Self::Deps,
        options: &InvokeOptions,
    ) -> Result<ModelOutput>;

    fn metadata(&self, config: &AgentConfig) -> BTreeMap<String, Value> {
        config.base_metadata()
    }

    /// Map a runtime failure to (display message, code).
    fn classify_error(&self, err: &Error) -> (String, ErrorCode) {
        (err.to_string(), err.code())
    }
}

/// Start/completion log sink. Fire-and-forget: never influences control flow.
pub trait ExecutionLogger: Send + Sync {
    /// Returns the correlation id used for the matching completion record.
    fn log_start(
        &self,
        agent_id: &str,
        agent_type: &str,
        task: &str,
        correlation_id: Option<&str>,
        context: &BTreeMap<String, Value>,
    ) -> String;

    fn log_complete(
        &self,
        correlation_id: &str,
        result: &ExecutionResult,
        usage: Option<&UsageInfo>,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn usage_accumulates_present_fields_only() {
        let mut u = UsageInfo::default();
        assert!(u.is_empty());
        u.accumulate(&UsageInfo {
            total_tokens: Some(10),
            prompt_tokens: Some(7),
            requests: Some(1),
            ..UsageInfo::default()
        });
        u.accumulate(&UsageInfo {
            total_tokens: Some(5),
            completion_tokens: Some(2),
            requests: Some(1),
            ..UsageInfo::default()
        });
        assert_eq!(u.total_tokens, Some(15));
        assert_eq!(u.prompt_tokens, Some(7));
        assert_eq!(u.completion_tokens, Some(2));
        assert_eq!(u.requests, Some(2));
    }

    #[test]
    fn records_pair_calls_with_results() {
        let trace = vec![
            Message::user("find rust news"),
            Message::assistant_tool_calls(
                "",
                vec![
                    ToolCall {
                        id: "c1".into(),
                        name: "web_search".into(),
                        arguments: json!({"query": "rust"}),
                    },
                    ToolCall {
                        id: "c2".into(),
                        name: "fetch_page".into(),
                        arguments: json!({"url": "https://x"}),
                    },
                ],
            ),
            Message::tool_result("c2", "Error: HTTP 404", true),
            Message::tool_result("c1", "1. Rust 2.0", false),
            Message::assistant("done"),
        ];
        let recs = ToolInvocationRecord::from_trace(&trace);
        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].name, "web_search");
        assert_eq!(recs[0].status, ToolStatus::Ok);
        assert_eq!(recs[0].result_preview, "1. Rust 2.0");
        assert_eq!(recs[1].status, ToolStatus::Error);
        assert_eq!(recs[1].correlation_id, "c2");
    }

    #[test]
    fn missing_tool_result_is_reported() {
        let trace = vec![Message::assistant_tool_calls(
            "",
            vec![ToolCall {
                id: "c9".into(),
                name: "web_search".into(),
                arguments: json!({}),
            }],
        )];
        let recs = ToolInvocationRecord::from_trace(&trace);
        assert_eq!(recs[0].status, ToolStatus::Missing);
    }

    #[test]
    fn preview_is_char_safe() {
        assert_eq!(preview("héllo", 2), "hé...");
        assert_eq!(preview("hi", 5), "hi");
    }

    #[test]
    fn error_result_serializes_with_code() {
        let r = ExecutionResult::error("empty", ErrorCode::EmptyTask, Duration::from_millis(3));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["status"], "error");
        assert_eq!(v["code"], "EMPTY_TASK");
        assert_eq!(v["elapsed_ms"], 3);
        assert_eq!(r.code(), Some(ErrorCode::EmptyTask));
    }

    #[test]
    fn request_timeout_overrides_agent_default() {
        let g = GenerationParams {
            timeout_ms: Some(5_000),
            ..GenerationParams::default()
        };
        assert_eq!(
            TaskRequest::new("t").effective_timeout(&g),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            TaskRequest::new("t").with_timeout_ms(10).effective_timeout(&g),
            Some(Duration::from_millis(10))
        );
    }

    #[test]
    fn zero_timeout_override_falls_back_to_agent_default() {
        let g = GenerationParams {
            timeout_ms: Some(5_000),
            ..GenerationParams::default()
        };
        assert_eq!(
            TaskRequest::new("t").with_timeout_ms(0).effective_timeout(&g),
            Some(Duration::from_secs(5))
        );
        assert_eq!(
            TaskRequest::new("t")
                .with_timeout_ms(0)
                .effective_timeout(&GenerationParams::default()),
            None
        );
    }

    #[test]
    fn args_summary_is_bounded() {
        let long = "x".repeat(500);
        let trace = vec![
            Message::assistant_tool_calls(
                "",
                vec![ToolCall {
                    id: "c1".into(),
                    name: "web_search".into(),
                    arguments: json!({ "query": long }),
                }],
            ),
            Message::tool_result("c1", "ok", false),
        ];
        let recs = ToolInvocationRecord::from_trace(&trace);
        assert!(recs[0].args_summary.ends_with("..."));
        assert_eq!(recs[0].args_summary.chars().count(), ARGS_SUMMARY_CHARS + 3);
        assert_eq!(recs[0].result_preview, "ok");
    }
}
