//! ActingPhase：把动作描述转为有序工具调用并依次执行
//!
//! 1. 请推理服务把 action + 工具目录转换为 [{toolName, input, rationale}]（与推理阶段相同的容错解码）
//! 2. 严格按顺序经 ToolExecutor 执行，各自计时；单次失败只记录在对应 ToolCallResult 上，不中断后续调用
//!
//! 规划本身失败时返回一条合成的失败结果（tool_name = "action_planner"）。

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::config::AgentConfigPatch;
use crate::core::AgentError;
use crate::llm::{GenerationOptions, ReasoningService};
use crate::react::decode::decode_payload;
use crate::react::prompts;
use crate::react::types::{ExecutionContext, ExecutionStats, Step, ToolCallMetadata, ToolCallResult};
use crate::tools::ToolExecutor;

/// 合成失败结果使用的工具名
pub const ACTION_PLANNER: &str = "action_planner";

const ACTING_SYSTEM_PROMPT: &str = "You are the acting module of an autonomous task agent. \
Turn the chosen action into an ordered list of tool invocations using only the listed tools. \
Respond with JSON only: {\"toolCalls\": [{\"toolName\": \"...\", \"input\": {}, \"rationale\": \"...\"}]}";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedCall {
    #[serde(alias = "tool", alias = "name")]
    pub tool_name: String,
    #[serde(default = "empty_object", alias = "arguments", alias = "args")]
    pub input: Value,
    #[serde(default)]
    pub rationale: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CallsPayload {
    Wrapped {
        #[serde(rename = "toolCalls", alias = "tool_calls", alias = "calls")]
        tool_calls: Vec<PlannedCall>,
    },
    Bare(Vec<PlannedCall>),
}

pub struct ActingPhase {
    llm: Arc<dyn ReasoningService>,
    options: GenerationOptions,
    executor: Arc<ToolExecutor>,
}

impl ActingPhase {
    pub fn new(
        llm: Arc<dyn ReasoningService>,
        options: GenerationOptions,
        executor: Arc<ToolExecutor>,
    ) -> Self {
        Self {
            llm,
            options: options.with_system_prompt(ACTING_SYSTEM_PROMPT),
            executor,
        }
    }

    pub fn apply_patch(&mut self, patch: &AgentConfigPatch) {
        patch.apply_to_options(&mut self.options);
    }

    /// 规划并执行；永不失败，规划失败返回单条合成失败结果
    pub async fn act(&self, action: &str, step: &Step, ctx: &ExecutionContext) -> Vec<ToolCallResult> {
        let calls = match self.plan_calls(action, step, ctx).await {
            Ok(calls) => calls,
            Err(e) => {
                tracing::warn!(step_id = %step.id, error = %e, "action planning failed");
                return vec![planning_failure(action, &e)];
            }
        };
        tracing::debug!(step_id = %step.id, calls = calls.len(), "executing tool calls");
        self.execute_calls(calls).await
    }

    pub async fn plan_calls(
        &self,
        action: &str,
        step: &Step,
        ctx: &ExecutionContext,
    ) -> Result<Vec<PlannedCall>, AgentError> {
        let prompt = format!(
            "{}\n## Step\n{}\nExpected outcome: {}\n\n## Action\n{}\n",
            prompts::tools_section(&ctx.available_tools),
            step.description,
            step.expected_outcome,
            action
        );
        let text = self.llm.generate_text(&prompt, &self.options).await?;
        let payload: CallsPayload = decode_payload(&text)?;
        let calls = match payload {
            CallsPayload::Wrapped { tool_calls } | CallsPayload::Bare(tool_calls) => tool_calls,
        };
        if let Some(bad) = calls.iter().position(|c| c.tool_name.trim().is_empty()) {
            return Err(AgentError::Validation(format!("tool call {} has no toolName", bad + 1)));
        }
        Ok(calls)
    }

    /// 严格串行执行
    pub async fn execute_calls(&self, calls: Vec<PlannedCall>) -> Vec<ToolCallResult> {
        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            let metadata = ToolCallMetadata {
                rationale: call.rationale,
                ..Default::default()
            };
            let r = self
                .executor
                .invoke(call.tool_name.trim(), call.input, metadata)
                .await;
            if !r.success {
                tracing::info!(tool = %r.tool_name, error = ?r.error, "tool call failed, continuing batch");
            }
            results.push(r);
        }
        results
    }

    /// 仅重跑失败的（非合成）结果，每条最多重试到 retry_count == max_retries；保持原顺序
    pub async fn retry_failed_tools(
        &self,
        results: Vec<ToolCallResult>,
        max_retries: u32,
    ) -> Vec<ToolCallResult> {
        let mut out = Vec::with_capacity(results.len());
        for mut r in results {
            while !r.success && !r.metadata.synthetic && r.metadata.retry_count < max_retries {
                let metadata = ToolCallMetadata {
                    retry_count: r.metadata.retry_count + 1,
                    ..r.metadata.clone()
                };
                tracing::debug!(tool = %r.tool_name, attempt = metadata.retry_count, "retrying tool");
                r = self.executor.invoke(&r.tool_name, r.input.clone(), metadata).await;
            }
            out.push(r);
        }
        out
    }

    pub fn execution_stats(results: &[ToolCallResult]) -> ExecutionStats {
        execution_stats(results)
    }
}

fn planning_failure(action: &str, error: &AgentError) -> ToolCallResult {
    ToolCallResult {
        tool_name: ACTION_PLANNER.to_string(),
        input: serde_json::json!({ "action": action }),
        output: Value::Null,
        success: false,
        error: Some(error.to_string()),
        execution_time_ms: 0,
        metadata: ToolCallMetadata {
            synthetic: true,
            ..Default::default()
        },
    }
}

/// 计数、成功率、平均耗时、最快 / 最慢调用；空批次成功率为 0
pub fn execution_stats(results: &[ToolCallResult]) -> ExecutionStats {
    let total = results.len();
    if total == 0 {
        return ExecutionStats::default();
    }
    let succeeded = results.iter().filter(|r| r.success).count();
    let total_ms: u64 = results.iter().map(|r| r.execution_time_ms).sum();
    let fastest = results
        .iter()
        .min_by_key(|r| r.execution_time_ms)
        .map(|r| (r.tool_name.clone(), r.execution_time_ms));
    let slowest = results
        .iter()
        .max_by_key(|r| r.execution_time_ms)
        .map(|r| (r.tool_name.clone(), r.execution_time_ms));
    ExecutionStats {
        total,
        succeeded,
        failed: total - succeeded,
        success_rate: succeeded as f64 / total as f64,
        average_duration_ms: total_ms as f64 / total as f64,
        fastest,
        slowest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::llm::{LlmError, MockReasoningService};
    use crate::react::types::StepType;
    use crate::tools::{EchoTool, Tool, ToolRegistry};

    /// 前 n 次失败，之后成功
    struct FlakyTool {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl Tool for FlakyTool {
        fn name(&self) -> &str {
            "flaky"
        }

        fn description(&self) -> &str {
            "fails a few times"
        }

        async fn execute(&self, _args: Value) -> Result<String, String> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                Err("temporarily unavailable".into())
            } else {
                Ok("ok".into())
            }
        }
    }

    fn phase(mock: MockReasoningService, flaky_failures: u32) -> ActingPhase {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(FlakyTool {
            failures_left: AtomicU32::new(flaky_failures),
        });
        let executor = Arc::new(ToolExecutor::new(Arc::new(registry), 5));
        ActingPhase::new(Arc::new(mock), GenerationOptions::default(), executor)
    }

    fn step() -> Step {
        Step::new("step_1", StepType::Action, "say hi", "greeting echoed")
    }

    #[tokio::test]
    async fn test_partial_failure_does_not_abort_batch() {
        let mock = MockReasoningService::with_responses([r#"{"toolCalls": [
            {"toolName": "echo", "input": {"text": "one"}, "rationale": "first"},
            {"toolName": "missing_tool", "input": {}},
            {"toolName": "echo", "input": {"text": "three"}}
        ]}"#]);
        let results = phase(mock, 0)
            .act("echo twice", &step(), &ExecutionContext::new("t", "g"))
            .await;
        assert_eq!(results.len(), 3);
        assert!(results[0].success);
        assert_eq!(results[0].metadata.rationale.as_deref(), Some("first"));
        assert!(!results[1].success);
        assert!(results[1].error.as_deref().unwrap().contains("missing_tool"));
        assert!(results[2].success);
        assert_eq!(results[2].output, Value::String("three".into()));
    }

    #[tokio::test]
    async fn test_planning_failure_yields_synthetic_result() {
        let mock = MockReasoningService::new();
        mock.push_error(LlmError::Request("down".into()));
        mock.push_response(r#"{"toolCalls": [{"toolName": "", "input": {}}]}"#);
        let p = phase(mock, 0);
        for _ in 0..2 {
            let results = p.act("anything", &step(), &ExecutionContext::new("t", "g")).await;
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].tool_name, ACTION_PLANNER);
            assert!(!results[0].success);
            assert!(results[0].metadata.synthetic);
        }
    }

    #[tokio::test]
    async fn test_bare_array_payload() {
        let mock = MockReasoningService::with_responses([r#"[{"tool": "echo", "arguments": {"text": "x"}}]"#]);
        let results = phase(mock, 0).act("a", &step(), &ExecutionContext::new("t", "g")).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].success);
    }

    #[tokio::test]
    async fn test_retry_failed_tools_is_bounded() {
        let p = phase(MockReasoningService::new(), 2);
        let first = p
            .execute_calls(vec![
                PlannedCall {
                    tool_name: "flaky".into(),
                    input: empty_object(),
                    rationale: None,
                },
                PlannedCall {
                    tool_name: "echo".into(),
                    input: serde_json::json!({"text": "ok"}),
                    rationale: None,
                },
            ])
            .await;
        assert!(!first[0].success);

        // 一次重试不够（还剩 1 次失败）
        let once = p.retry_failed_tools(first, 1).await;
        assert!(!once[0].success);
        assert_eq!(once[0].metadata.retry_count, 1);
        assert_eq!(once[1].metadata.retry_count, 0);

        let twice = p.retry_failed_tools(once, 3).await;
        assert!(twice[0].success);
        assert_eq!(twice[0].metadata.retry_count, 2);
    }

    #[test]
    fn test_execution_stats() {
        let mk = |name: &str, ok: bool, ms: u64| ToolCallResult {
            tool_name: name.into(),
            input: Value::Null,
            output: Value::Null,
            success: ok,
            error: (!ok).then(|| "e".to_string()),
            execution_time_ms: ms,
            metadata: ToolCallMetadata::default(),
        };
        let stats = execution_stats(&[mk("a", true, 10), mk("b", false, 30), mk("c", true, 20)]);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.failed, 1);
        assert!((stats.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.average_duration_ms, 20.0);
        assert_eq!(stats.fastest, Some(("a".to_string(), 10)));
        assert_eq!(stats.slowest, Some(("b".to_string(), 30)));
        assert_eq!(execution_stats(&[]), ExecutionStats::default());
    }
}
