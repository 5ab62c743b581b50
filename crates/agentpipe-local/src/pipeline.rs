//! The per-task lifecycle every agent variant runs.
//!
//! validate → build deps → invoke once → usage → metadata → result. The model call is
//! never retried here; resilience lives in the engines the model's tools call.

use agentpipe_core::{
    AgentConfig, AgentRuntime, Error, ErrorCode, ExecutionLogger, ExecutionResult, InvokeOptions,
    ModelOutput, Result, TaskRequest, ToolInvocationRecord,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub struct Pipeline<R, L> {
    runtime: R,
    logger: L,
}

impl<R: AgentRuntime, L: ExecutionLogger> Pipeline<R, L> {
    pub fn new(runtime: R, logger: L) -> Self {
        Self { runtime, logger }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Run one task.
    ///
    /// Every runtime condition comes back as `Ok(ExecutionResult)`. Only
    /// [`Error::Defect`] is returned as `Err`; no completion record is written for it.
    pub async fn run(&self, config: &AgentConfig, request: &TaskRequest) -> Result<ExecutionResult> {
        let t0 = Instant::now();
        let cid = self.logger.log_start(
            &config.agent_id,
            self.runtime.agent_type(),
            &request.task,
            request.correlation_id.as_deref(),
            &request.context,
        );

        if request.task.trim().is_empty() {
            let result = ExecutionResult::error("task is empty", ErrorCode::EmptyTask, t0.elapsed());
            self.logger.log_complete(&cid, &result, None);
            return Ok(result);
        }

        match self.execute(config, request, &cid).await {
            Ok((output, metadata)) => {
                let tool_calls = ToolInvocationRecord::from_trace(&output.trace);
                for r in &tool_calls {
                    tracing::info!(
                        event = "tool_invocation",
                        correlation_id = %cid,
                        tool_call_id = %r.correlation_id,
                        tool = %r.name,
                        status = ?r.status,
                        args = %r.args_summary,
                        "tool invocation recorded"
                    );
                }
                let usage = output.usage.filter(|u| !u.is_empty());
                let result = ExecutionResult::Success {
                    content: output.output,
                    elapsed_ms: elapsed_ms(t0),
                    usage: usage.clone(),
                    metadata,
                    trace: output.trace,
                    tool_calls,
                };
                self.logger.log_complete(&cid, &result, usage.as_ref());
                Ok(result)
            }
            Err(e) if e.is_defect() => {
                tracing::error!(correlation_id = %cid, error = %e, "defect while running task");
                Err(e)
            }
            Err(e) => {
                let (message, code) = self.runtime.classify_error(&e);
                let result = ExecutionResult::error(message, code, t0.elapsed());
                self.logger.log_complete(&cid, &result, None);
                Ok(result)
            }
        }
    }

    async fn execute(
        &self,
        config: &AgentConfig,
        request: &TaskRequest,
        cid: &str,
    ) -> Result<(ModelOutput, BTreeMap<String, Value>)> {
        let deps = self.runtime.build_deps(config, request)?;
        let timeout = request.effective_timeout(&config.generation);
        let options = InvokeOptions {
            generation: config.generation.clone(),
            timeout,
            context: request.context.clone(),
        };

        let call = self.runtime.invoke(&request.task, &deps, &options);
        let output = match timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| Error::Timeout {
                    ms: duration_ms(limit),
                })??,
            None => call.await?,
        };

        Ok((output, self.assemble_metadata(config, request, cid)))
    }

    /// Caller context first, then runtime metadata on top.
    fn assemble_metadata(
        &self,
        config: &AgentConfig,
        request: &TaskRequest,
        cid: &str,
    ) -> BTreeMap<String, Value> {
        let mut m = request.context.clone();
        m.extend(self.runtime.metadata(config));
        m.insert("correlation_id".to_string(), Value::from(cid));
        m
    }
}

fn elapsed_ms(t0: Instant) -> u64 {
    duration_ms(t0.elapsed())
}

fn duration_ms(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}
