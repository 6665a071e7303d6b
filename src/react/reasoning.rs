//! ReasoningPhase：针对单个步骤决定下一步动作
//!
//! 输入为 Step、ExecutionContext 与最近 N 条历史（N = history_window，限制 prompt 规模与运行长度无关）。
//! 推理服务返回 {thoughts, nextAction, confidence, reasoning, alternatives}；
//! 解码或校验失败时返回确定性的低置信度 fallback，不向上抛错。

use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;

use crate::config::AgentConfigPatch;
use crate::core::AgentError;
use crate::llm::{GenerationOptions, ReasoningService};
use crate::react::decode::decode_payload;
use crate::react::prompts;
use crate::react::types::{
    clamp_confidence, ExecutionContext, HistoryEntry, PhaseMetadata, ReasoningResult, Step, Thought,
    ThoughtType,
};

/// fallback 的置信度
pub const FALLBACK_CONFIDENCE: f64 = 0.3;
pub const FALLBACK_ACTION: &str = "continue current step";

const MIN_CONFIDENCE: f64 = 0.1;

const REASONING_SYSTEM_PROMPT: &str = "You are the reasoning module of an autonomous task agent. \
Think about the current step and decide the single next action. Respond with JSON only: \
{\"thoughts\": [{\"type\": \"analysis\", \"content\": \"...\", \"confidence\": 0.8, \"reasoning\": \"...\"}], \
\"nextAction\": \"...\", \"confidence\": 0.8, \"reasoning\": \"...\", \"alternatives\": [\"...\"]}";

/// thoughts 中的元素可以是完整对象或纯文本
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ThoughtPayload {
    Full {
        #[serde(rename = "type", default)]
        thought_type: Option<ThoughtType>,
        content: String,
        #[serde(default)]
        confidence: Option<f64>,
        #[serde(default)]
        reasoning: String,
    },
    Text(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReasoningPayload {
    thoughts: Vec<ThoughtPayload>,
    next_action: String,
    confidence: f64,
    reasoning: String,
    alternatives: Vec<String>,
}

pub struct ReasoningPhase {
    llm: Arc<dyn ReasoningService>,
    options: GenerationOptions,
    history_window: usize,
}

impl ReasoningPhase {
    pub fn new(llm: Arc<dyn ReasoningService>, options: GenerationOptions, history_window: usize) -> Self {
        Self {
            llm,
            options: options.with_system_prompt(REASONING_SYSTEM_PROMPT),
            history_window,
        }
    }

    pub fn apply_patch(&mut self, patch: &AgentConfigPatch) {
        patch.apply_to_options(&mut self.options);
        if let Some(w) = patch.history_window {
            self.history_window = w;
        }
    }

    pub fn history_window(&self) -> usize {
        self.history_window
    }

    /// 推理一步；任何失败都降级为 fallback
    pub async fn reason(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        history: &[HistoryEntry],
    ) -> ReasoningResult {
        let start = Instant::now();
        match self.try_reason(step, ctx, history).await {
            Ok(mut result) => {
                result.metadata.duration_ms = start.elapsed().as_millis() as u64;
                tracing::debug!(
                    step_id = %step.id,
                    confidence = result.confidence,
                    action = %result.next_action,
                    "reasoning done"
                );
                result
            }
            Err(e) => {
                tracing::warn!(step_id = %step.id, error = %e, "reasoning failed, using fallback");
                let mut result = fallback(step, &e);
                result.metadata.duration_ms = start.elapsed().as_millis() as u64;
                result
            }
        }
    }

    pub async fn try_reason(
        &self,
        step: &Step,
        ctx: &ExecutionContext,
        history: &[HistoryEntry],
    ) -> Result<ReasoningResult, AgentError> {
        let window = &history[history.len().saturating_sub(self.history_window)..];
        let prompt = self.build_prompt(step, ctx, window);
        let text = self.llm.generate_text(&prompt, &self.options).await?;
        let payload: ReasoningPayload = decode_payload(&text)?;
        validate(&payload)?;

        let thoughts = payload
            .thoughts
            .into_iter()
            .map(|t| match t {
                ThoughtPayload::Full {
                    thought_type,
                    content,
                    confidence,
                    reasoning,
                } => Thought::new(
                    thought_type.unwrap_or(ThoughtType::Analysis),
                    content,
                    confidence.unwrap_or(payload.confidence),
                    reasoning,
                ),
                ThoughtPayload::Text(content) => {
                    Thought::new(ThoughtType::Analysis, content, payload.confidence, "")
                }
            })
            .collect();

        Ok(ReasoningResult {
            thoughts,
            next_action: payload.next_action.trim().to_string(),
            confidence: clamp_confidence(payload.confidence),
            reasoning: payload.reasoning.trim().to_string(),
            alternatives: payload.alternatives,
            metadata: PhaseMetadata {
                step_id: Some(step.id.clone()),
                ..Default::default()
            },
        })
    }

    fn build_prompt(&self, step: &Step, ctx: &ExecutionContext, window: &[HistoryEntry]) -> String {
        format!(
            "{}\n{}\n{}\n## Current step ({})\n{}\nExpected outcome: {}\n",
            prompts::context_section(ctx),
            prompts::tools_section(&ctx.available_tools),
            prompts::history_section(window),
            step.id,
            step.description,
            step.expected_outcome
        )
    }
}

fn validate(payload: &ReasoningPayload) -> Result<(), AgentError> {
    if payload.thoughts.is_empty() {
        return Err(AgentError::Validation("thoughts must not be empty".to_string()));
    }
    if payload.next_action.trim().is_empty() {
        return Err(AgentError::Validation("nextAction must not be empty".to_string()));
    }
    if payload.reasoning.trim().is_empty() {
        return Err(AgentError::Validation("reasoning must not be empty".to_string()));
    }
    if !(MIN_CONFIDENCE..=1.0).contains(&payload.confidence) {
        return Err(AgentError::Validation(format!(
            "confidence {} outside [{}, 1.0]",
            payload.confidence, MIN_CONFIDENCE
        )));
    }
    Ok(())
}

/// 确定性 fallback：一条 0.3 置信度的思考，动作为继续当前步骤
pub fn fallback(step: &Step, error: &AgentError) -> ReasoningResult {
    let thought = Thought::new(
        ThoughtType::Analysis,
        format!("Reasoning for step {} failed: {}", step.id, error),
        FALLBACK_CONFIDENCE,
        "Structured reasoning was unavailable; proceeding with the step as planned",
    );
    ReasoningResult {
        thoughts: vec![thought],
        next_action: FALLBACK_ACTION.to_string(),
        confidence: FALLBACK_CONFIDENCE,
        reasoning: format!("Fallback reasoning: {}", step.description),
        alternatives: vec!["retry".to_string(), "skip".to_string(), "ask-user".to_string()],
        metadata: PhaseMetadata {
            step_id: Some(step.id.clone()),
            is_fallback: true,
            error: Some(error.to_string()),
            duration_ms: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockReasoningService};
    use crate::react::types::{ExecutionStats, ObservationResult, StepType};

    fn step() -> Step {
        Step::new("step_1", StepType::Action, "list files", "file list")
    }

    fn phase(mock: Arc<MockReasoningService>, window: usize) -> ReasoningPhase {
        ReasoningPhase::new(mock, GenerationOptions::default(), window)
    }

    fn history_entry(id: &str) -> HistoryEntry {
        HistoryEntry {
            step_id: id.to_string(),
            reasoning: fallback(&step(), &AgentError::Validation("x".into())),
            actions: Vec::new(),
            observation: ObservationResult {
                observations: vec![format!("observed {id}")],
                insights: Vec::new(),
                implications: Vec::new(),
                next_steps: Vec::new(),
                issues: Vec::new(),
                confidence: 0.9,
                statistics: ExecutionStats::default(),
                key_findings: Vec::new(),
                suggestions: Vec::new(),
                is_fallback: false,
            },
            success: true,
            duration_ms: 1,
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reason_from_fenced_payload() {
        let mock = Arc::new(MockReasoningService::with_responses([r#"Sure.
```json
{"thoughts": [{"type": "decision", "content": "use ls", "confidence": 0.9, "reasoning": "cheap"}, "double check"],
 "nextAction": "run ls in the workspace", "confidence": 0.85, "reasoning": "listing is enough",
 "alternatives": ["find"]}
```"#]));
        let r = phase(mock, 5).reason(&step(), &ExecutionContext::new("t", "g"), &[]).await;
        assert!(!r.metadata.is_fallback);
        assert_eq!(r.next_action, "run ls in the workspace");
        assert_eq!(r.thoughts.len(), 2);
        assert_eq!(r.thoughts[0].thought_type, ThoughtType::Decision);
        assert_eq!(r.thoughts[1].confidence, 0.85);
        assert_eq!(r.metadata.step_id.as_deref(), Some("step_1"));
    }

    #[tokio::test]
    async fn test_service_error_falls_back() {
        let mock = Arc::new(MockReasoningService::new());
        mock.push_error(LlmError::Timeout);
        let r = phase(mock, 5).reason(&step(), &ExecutionContext::new("t", "g"), &[]).await;
        assert!(r.metadata.is_fallback);
        assert_eq!(r.confidence, FALLBACK_CONFIDENCE);
        assert_eq!(r.next_action, FALLBACK_ACTION);
        assert_eq!(r.thoughts.len(), 1);
        assert_eq!(r.alternatives, vec!["retry", "skip", "ask-user"]);
    }

    #[tokio::test]
    async fn test_validation_rejects_out_of_range_and_empty_fields() {
        let mock = Arc::new(MockReasoningService::with_responses([
            r#"{"thoughts": ["a"], "nextAction": "x", "confidence": 0.05, "reasoning": "r", "alternatives": []}"#,
            r#"{"thoughts": [], "nextAction": "x", "confidence": 0.5, "reasoning": "r", "alternatives": []}"#,
            r#"{"thoughts": ["a"], "nextAction": " ", "confidence": 0.5, "reasoning": "r", "alternatives": []}"#,
            r#"{"thoughts": ["a"], "nextAction": "x", "confidence": 0.5, "reasoning": "r"}"#,
        ]));
        let p = phase(mock, 5);
        for _ in 0..4 {
            let r = p.reason(&step(), &ExecutionContext::new("t", "g"), &[]).await;
            assert!(r.metadata.is_fallback);
        }
    }

    #[tokio::test]
    async fn test_history_window_bounds_prompt() {
        let mock = Arc::new(MockReasoningService::new());
        let history: Vec<HistoryEntry> = (1..=4).map(|i| history_entry(&format!("h{i}"))).collect();
        phase(mock.clone(), 2)
            .reason(&step(), &ExecutionContext::new("t", "g"), &history)
            .await;
        let prompt = &mock.prompts()[0];
        assert!(!prompt.contains("observed h2"));
        assert!(prompt.contains("observed h3"));
        assert!(prompt.contains("observed h4"));
    }
}
