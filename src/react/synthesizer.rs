//! ResultSynthesizer：把结束时的 Plan + History 汇总为 ExecutionResult
//!
//! success = 状态为 completed 且至少一步完成。摘要与建议由本地计数生成；
//! 结构化结论向推理服务请求，失败时退回本地计数生成的结论，本身从不失败。

use std::sync::Arc;

use serde_json::{json, Value};

use crate::config::AgentConfigPatch;
use crate::core::{AgentError, AgentState, AgentStatus};
use crate::llm::{GenerationOptions, ReasoningService};
use crate::react::decode::decode_payload;
use crate::react::prompts;
use crate::react::types::{clamp_confidence, Conclusion, ExecutionContext, ExecutionResult, StepStatus};

const CONCLUSION_SYSTEM_PROMPT: &str = "You are the reporting module of an autonomous task agent. \
Summarize what the run achieved with respect to the goal. Respond with JSON only: \
{\"answer\": \"...\", \"keyPoints\": [\"...\"], \"limitations\": [\"...\"], \"confidence\": 0.8}";

pub struct ResultSynthesizer {
    llm: Arc<dyn ReasoningService>,
    options: GenerationOptions,
    enable_conclusion: bool,
    history_window: usize,
}

/// 各状态步数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepCounts {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pending: usize,
    pub total: usize,
}

impl StepCounts {
    pub fn of(state: &AgentState) -> Self {
        Self {
            completed: state.count_steps(StepStatus::Completed),
            skipped: state.count_steps(StepStatus::Skipped),
            failed: state.count_steps(StepStatus::Failed),
            pending: state.count_steps(StepStatus::Pending) + state.count_steps(StepStatus::Running),
            total: state.plan.len(),
        }
    }
}

impl ResultSynthesizer {
    pub fn new(
        llm: Arc<dyn ReasoningService>,
        options: GenerationOptions,
        enable_conclusion: bool,
        history_window: usize,
    ) -> Self {
        Self {
            llm,
            options: options.with_system_prompt(CONCLUSION_SYSTEM_PROMPT),
            enable_conclusion,
            history_window,
        }
    }

    pub fn apply_patch(&mut self, patch: &AgentConfigPatch) {
        patch.apply_to_options(&mut self.options);
        if let Some(v) = patch.enable_conclusion {
            self.enable_conclusion = v;
        }
        if let Some(w) = patch.history_window {
            self.history_window = w;
        }
    }

    pub async fn synthesize(
        &self,
        state: &AgentState,
        ctx: &ExecutionContext,
        execution_time_ms: u64,
    ) -> ExecutionResult {
        let counts = StepCounts::of(state);
        let success = state.status == AgentStatus::Completed && counts.completed > 0;
        let summary = summary(state, &counts, execution_time_ms);

        let conclusion = if self.enable_conclusion {
            Some(match self.request_conclusion(state, ctx, &summary).await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "conclusion request failed, using local conclusion");
                    local_conclusion(state, &counts, success)
                }
            })
        } else {
            None
        };

        ExecutionResult {
            success,
            result: result_payload(state, &counts),
            summary,
            conclusion,
            plan: state.plan.clone(),
            history: state.history.clone(),
            execution_time_ms,
            error_count: state.error_count,
            confidence: clamp_confidence(state.confidence),
            recommendations: recommendations(state, &counts),
            metadata: run_metadata(state),
        }
    }

    async fn request_conclusion(
        &self,
        state: &AgentState,
        ctx: &ExecutionContext,
        summary: &str,
    ) -> Result<Conclusion, AgentError> {
        // 汇总已含全部步数，历史只取最近 history_window 条
        let recent = &state.history[state.history.len().saturating_sub(self.history_window)..];
        let prompt = format!(
            "{}\n## Run summary\n{}\n\n{}",
            prompts::context_section(ctx),
            summary,
            prompts::history_section(recent)
        );
        let text = self.llm.generate_text(&prompt, &self.options).await?;
        let mut conclusion: Conclusion = decode_payload(&text)?;
        if conclusion.answer.trim().is_empty() {
            return Err(AgentError::Validation("conclusion answer must not be empty".to_string()));
        }
        conclusion.confidence = clamp_confidence(conclusion.confidence);
        conclusion.is_fallback = false;
        Ok(conclusion)
    }
}

pub fn summary(state: &AgentState, counts: &StepCounts, execution_time_ms: u64) -> String {
    let mut s = format!(
        "Task \"{}\" finished with status {:?}: {} of {} steps completed, {} skipped, {} failed in {} ms",
        state.task,
        state.status,
        counts.completed,
        counts.total,
        counts.skipped,
        counts.failed,
        execution_time_ms
    );
    if state.error_count > 0 {
        s.push_str(&format!(
            " ({} error(s), {} retr{})",
            state.error_count,
            state.retry_count,
            if state.retry_count == 1 { "y" } else { "ies" }
        ));
    }
    s
}

fn recommendations(state: &AgentState, counts: &StepCounts) -> Vec<String> {
    let mut out = Vec::new();
    if state.error_count > 0 {
        out.push(format!(
            "Review the {} step error(s) reported during execution",
            state.error_count
        ));
    }
    if counts.completed + counts.skipped < counts.total {
        out.push("Re-run the task to finish the remaining steps".to_string());
    }
    if counts.skipped > 0 {
        out.push("Provide more context so skipped steps can be executed with higher confidence".to_string());
    }
    if state.has_reflection() {
        out.push("Review the reflections recorded during the run".to_string());
    }
    if out.is_empty() {
        out.push("No further action required".to_string());
    }
    out
}

fn result_payload(state: &AgentState, counts: &StepCounts) -> Value {
    let final_observations = state
        .history
        .last()
        .map(|h| json!(h.observation.observations))
        .unwrap_or(Value::Null);
    json!({
        "completedSteps": counts.completed,
        "skippedSteps": counts.skipped,
        "failedSteps": counts.failed,
        "finalObservations": final_observations,
    })
}

fn run_metadata(state: &AgentState) -> serde_json::Map<String, Value> {
    let mut m = state.metadata.clone();
    m.insert("agentId".to_string(), json!(state.id));
    m.insert("status".to_string(), json!(state.status));
    m.insert("retryCount".to_string(), json!(state.retry_count));
    m.insert("totalSteps".to_string(), json!(state.total_steps));
    m
}

/// 本地计数生成的结论
pub fn local_conclusion(state: &AgentState, counts: &StepCounts, success: bool) -> Conclusion {
    let answer = if success {
        format!("Completed {} of {} planned steps for: {}", counts.completed, counts.total, state.goal)
    } else {
        format!("The goal was not reached: {}", state.goal)
    };
    let key_points = state
        .history
        .iter()
        .filter_map(|h| h.observation.observations.first().map(|o| format!("{}: {}", h.step_id, o)))
        .collect();
    let mut limitations = Vec::new();
    if counts.skipped > 0 {
        limitations.push(format!("{} step(s) were skipped due to low confidence", counts.skipped));
    }
    if state.error_count > 0 {
        limitations.push(format!("{} step-level error(s) occurred", state.error_count));
    }
    let confidence = if counts.total == 0 {
        0.0
    } else {
        clamp_confidence(state.confidence * counts.completed as f64 / counts.total as f64)
    };
    Conclusion {
        answer,
        key_points,
        limitations,
        confidence,
        is_fallback: true,
    }
}
