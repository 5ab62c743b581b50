use agentpipe_core::task::preview;
use agentpipe_core::{ExecutionLogger, ExecutionResult, UsageInfo};
use serde_json::Value;
use std::collections::BTreeMap;

const TASK_PREVIEW_CHARS: usize = 120;

/// `ExecutionLogger` that writes structured `tracing` records.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl TracingLogger {
    pub fn new() -> Self {
        Self
    }
}

pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl ExecutionLogger for TracingLogger {
    fn log_start(
        &self,
        agent_id: &str,
        agent_type: &str,
        task: &str,
        correlation_id: Option<&str>,
        context: &BTreeMap<String, Value>,
    ) -> String {
        let cid = correlation_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(new_correlation_id);
        let context_keys: Vec<&str> = context.keys().map(String::as_str).collect();
        tracing::info!(
            correlation_id = %cid,
            agent_id,
            agent_type,
            task = %preview(task.trim(), TASK_PREVIEW_CHARS),
            context_keys = ?context_keys,
            "task started"
        );
        cid
    }

    fn log_complete(&self, correlation_id: &str, result: &ExecutionResult, usage: Option<&UsageInfo>) {
        let total_tokens = usage.and_then(|u| u.total_tokens);
        match result {
            ExecutionResult::Success {
                elapsed_ms,
                tool_calls,
                ..
            } => tracing::info!(
                correlation_id,
                elapsed_ms,
                tool_calls = tool_calls.len(),
                total_tokens,
                "task succeeded"
            ),
            ExecutionResult::Error {
                message,
                code,
                elapsed_ms,
            } => tracing::warn!(
                correlation_id,
                elapsed_ms,
                code = %code,
                error = %message,
                total_tokens,
                "task failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_caller_correlation_id() {
        let l = TracingLogger::new();
        let cid = l.log_start("a", "chat", "task", Some("req-42"), &BTreeMap::new());
        assert_eq!(cid, "req-42");
    }

    #[test]
    fn generates_distinct_ids_when_absent() {
        let l = TracingLogger::new();
        let a = l.log_start("a", "chat", "t", None, &BTreeMap::new());
        let b = l.log_start("a", "chat", "t", Some("  "), &BTreeMap::new());
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(&a).is_ok());
    }
}
