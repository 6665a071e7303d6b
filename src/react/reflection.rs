//! ReflectionPhase：出现异常信号时总结到目前为止的经验
//!
//! 触发条件由 should_reflect 判断（观察置信度 < 0.5、存在问题、或成功率 < 0.7）。
//! 反思是尽力而为：失败只记日志，输出写入 AgentState.metadata["reflections"]。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AgentConfigPatch;
use crate::core::AgentError;
use crate::llm::{GenerationOptions, ReasoningService};
use crate::react::decode::decode_payload;
use crate::react::prompts;
use crate::react::types::{clamp_confidence, ExecutionContext, HistoryEntry, ObservationResult};

const LOW_CONFIDENCE: f64 = 0.5;
const LOW_SUCCESS_RATE: f64 = 0.7;

const REFLECTION_SYSTEM_PROMPT: &str = "You are the reflection module of an autonomous task agent. \
Review the recent steps and extract lessons that should change how the remaining steps are executed. \
Respond with JSON only: {\"summary\": \"...\", \"lessons\": [\"...\"], \"adjustments\": [\"...\"], \"confidence\": 0.7}";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reflection {
    pub step_id: String,
    pub summary: String,
    pub lessons: Vec<String>,
    pub adjustments: Vec<String>,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ReflectionPayload {
    summary: String,
    #[serde(default)]
    lessons: Vec<String>,
    #[serde(default)]
    adjustments: Vec<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

pub struct ReflectionPhase {
    llm: Arc<dyn ReasoningService>,
    options: GenerationOptions,
    history_window: usize,
}

impl ReflectionPhase {
    pub fn new(llm: Arc<dyn ReasoningService>, options: GenerationOptions, history_window: usize) -> Self {
        Self {
            llm,
            options: options.with_system_prompt(REFLECTION_SYSTEM_PROMPT),
            history_window,
        }
    }

    pub fn apply_patch(&mut self, patch: &AgentConfigPatch) {
        patch.apply_to_options(&mut self.options);
        if let Some(w) = patch.history_window {
            self.history_window = w;
        }
    }

    /// 空批次不以成功率为触发依据
    pub fn should_reflect(observation: &ObservationResult) -> bool {
        observation.confidence < LOW_CONFIDENCE
            || !observation.issues.is_empty()
            || (observation.statistics.total > 0 && observation.statistics.success_rate < LOW_SUCCESS_RATE)
    }

    pub async fn reflect(
        &self,
        step_id: &str,
        ctx: &ExecutionContext,
        history: &[HistoryEntry],
    ) -> Result<Reflection, AgentError> {
        // 只取最近 history_window 条
        let recent = &history[history.len().saturating_sub(self.history_window)..];
        let mut prompt = format!("{}\n{}", prompts::context_section(ctx), prompts::history_section(recent));
        if let Some(last) = recent.last() {
            for issue in &last.observation.issues {
                prompt.push_str(&format!("- issue ({:?}): {}\n", issue.severity, issue.description));
            }
        }
        let text = self.llm.generate_text(&prompt, &self.options).await?;
        let payload: ReflectionPayload = decode_payload(&text)?;
        if payload.summary.trim().is_empty() {
            return Err(AgentError::Validation("reflection summary must not be empty".to_string()));
        }
        Ok(Reflection {
            step_id: step_id.to_string(),
            summary: payload.summary.trim().to_string(),
            lessons: payload.lessons,
            adjustments: payload.adjustments,
            confidence: clamp_confidence(payload.confidence.unwrap_or(LOW_CONFIDENCE)),
            timestamp: Utc::now(),
        })
    }
}
