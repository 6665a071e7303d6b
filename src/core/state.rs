//! 状态定义：AgentStatus 与 AgentState
//!
//! AgentState 只由所属 AgentEngine 的主循环修改；外部通过快照（clone）读取。

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::react::types::{clamp_confidence, HistoryEntry, Step, StepStatus};

/// 引擎阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Planning,
    Reasoning,
    Acting,
    Observing,
    Reflecting,
    Completed,
    Failed,
    Paused,
}

impl AgentStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Paused)
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub id: String,
    pub task: String,
    pub goal: String,
    pub status: AgentStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub plan: Vec<Step>,
    pub history: Vec<HistoryEntry>,
    /// 0-100
    pub progress: f64,
    pub confidence: f64,
    pub error_count: u32,
    pub retry_count: u32,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
}

impl AgentState {
    pub fn new(id: impl Into<String>, task: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task: task.into(),
            goal: goal.into(),
            status: AgentStatus::Idle,
            current_step: 0,
            total_steps: 0,
            plan: Vec::new(),
            history: Vec::new(),
            progress: 0.0,
            confidence: 0.0,
            error_count: 0,
            retry_count: 0,
            metadata: serde_json::Map::new(),
            started_at: Utc::now(),
        }
    }

    pub fn set_plan(&mut self, plan: Vec<Step>) {
        self.total_steps = plan.len();
        self.plan = plan;
        self.sync_counters();
    }

    pub fn count_steps(&self, status: StepStatus) -> usize {
        self.plan.iter().filter(|s| s.status == status).count()
    }

    /// current_step = 非 pending 步数；progress 按已完成 + 已跳过计
    pub fn sync_counters(&mut self) {
        self.current_step = self
            .plan
            .iter()
            .filter(|s| s.status != StepStatus::Pending)
            .count();
        let settled = self.count_steps(StepStatus::Completed) + self.count_steps(StepStatus::Skipped);
        self.progress = if self.total_steps == 0 {
            0.0
        } else {
            (settled as f64 / self.total_steps as f64 * 100.0).min(100.0)
        };
    }

    /// 运行置信度为各步推理置信度的累计均值
    pub fn record_confidence(&mut self, confidence: f64, samples: usize) {
        let c = clamp_confidence(confidence);
        self.confidence = if samples <= 1 {
            c
        } else {
            let n = samples as f64;
            clamp_confidence((self.confidence * (n - 1.0) + c) / n)
        };
    }

    pub fn has_reflection(&self) -> bool {
        self.metadata.contains_key("reflections")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::react::types::StepType;

    fn plan(n: usize) -> Vec<Step> {
        (1..=n)
            .map(|i| Step::new(format!("step_{i}"), StepType::Action, "d", "e"))
            .collect()
    }

    #[test]
    fn test_counters_follow_step_status() {
        let mut state = AgentState::new("a", "t", "g");
        state.set_plan(plan(4));
        assert_eq!(state.total_steps, 4);
        assert_eq!(state.current_step, 0);

        state.plan[0].status = StepStatus::Completed;
        state.plan[1].status = StepStatus::Skipped;
        state.plan[2].status = StepStatus::Failed;
        state.sync_counters();
        assert_eq!(state.current_step, 3);
        assert_eq!(state.progress, 50.0);
    }

    #[test]
    fn test_running_mean_confidence() {
        let mut state = AgentState::new("a", "t", "g");
        state.record_confidence(0.8, 1);
        state.record_confidence(0.4, 2);
        assert!((state.confidence - 0.6).abs() < 1e-9);
        state.record_confidence(5.0, 3);
        assert!(state.confidence <= 1.0);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(AgentStatus::Paused.is_terminal());
        assert!(!AgentStatus::Observing.is_terminal());
    }
}
