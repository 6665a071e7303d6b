//! 执行域类型：Step、Thought、ToolCallResult、HistoryEntry、ExecutionContext、ExecutionResult
//!
//! 序列化为 camelCase，供事件流与最终报告直接输出 JSON。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::memory::Message;
use crate::tools::ToolSpec;

/// 将置信度钳制到 [0, 1]；NaN 视为 0
pub fn clamp_confidence(c: f64) -> f64 {
    if c.is_nan() {
        0.0
    } else {
        c.clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Reasoning,
    Action,
    Observation,
    Reflection,
    Planning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// 依赖该步的后续步骤可以开始
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThoughtType {
    Analysis,
    Planning,
    Decision,
    Observation,
    Reflection,
}

/// 推理过程中的一条思考（只追加）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thought {
    pub id: String,
    #[serde(rename = "type")]
    pub thought_type: ThoughtType,
    pub content: String,
    pub confidence: f64,
    pub reasoning: String,
    pub timestamp: DateTime<Utc>,
}

impl Thought {
    pub fn new(
        thought_type: ThoughtType,
        content: impl Into<String>,
        confidence: f64,
        reasoning: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("thought_{}", uuid::Uuid::new_v4()),
            thought_type,
            content: content.into(),
            confidence: clamp_confidence(confidence),
            reasoning: reasoning.into(),
            timestamp: Utc::now(),
        }
    }
}

/// 计划中的一步
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    pub description: String,
    pub expected_outcome: String,
    pub dependencies: Vec<String>,
    pub status: StepStatus,
    pub thoughts: Vec<Thought>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// 进入 running 的次数（含重试）
    pub attempts: u32,
}

impl Step {
    pub fn new(
        id: impl Into<String>,
        step_type: StepType,
        description: impl Into<String>,
        expected_outcome: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            step_type,
            description: description.into(),
            expected_outcome: expected_outcome.into(),
            dependencies: Vec::new(),
            status: StepStatus::Pending,
            thoughts: Vec::new(),
            start_time: None,
            end_time: None,
            result: None,
            error: None,
            attempts: 0,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    /// 进入 running；重试时清空上一次尝试留下的思考、结果与错误，attempts 继续累加
    pub fn begin_attempt(&mut self) {
        if self.attempts > 0 {
            self.thoughts.clear();
            self.result = None;
            self.error = None;
            self.end_time = None;
        }
        self.status = StepStatus::Running;
        self.attempts += 1;
        self.start_time = Some(Utc::now());
    }

    pub fn finish(&mut self, status: StepStatus) {
        self.status = status;
        self.end_time = Some(Utc::now());
    }
}

/// 单次工具调用的记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub tool_name: String,
    pub input: Value,
    pub output: Value,
    pub success: bool,
    pub error: Option<String>,
    pub execution_time_ms: u64,
    pub metadata: ToolCallMetadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallMetadata {
    pub retry_count: u32,
    pub rationale: Option<String>,
    /// 该结果不是实际调用，而是动作规划失败时的占位
    pub synthetic: bool,
}

/// 推理阶段的输出
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningResult {
    pub thoughts: Vec<Thought>,
    pub next_action: String,
    pub confidence: f64,
    pub reasoning: String,
    pub alternatives: Vec<String>,
    pub metadata: PhaseMetadata,
}

/// 各阶段结果共用的元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseMetadata {
    pub step_id: Option<String>,
    pub is_fallback: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSeverity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedIssue {
    pub description: String,
    pub severity: IssueSeverity,
    pub suggestion: Option<String>,
}

/// 本地计算的工具执行统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    /// (工具名, 耗时毫秒)
    pub fastest: Option<(String, u64)>,
    pub slowest: Option<(String, u64)>,
}

/// 观察阶段的输出
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationResult {
    pub observations: Vec<String>,
    pub insights: Vec<String>,
    pub implications: Vec<String>,
    pub next_steps: Vec<String>,
    pub issues: Vec<ObservedIssue>,
    pub confidence: f64,
    pub statistics: ExecutionStats,
    pub key_findings: Vec<String>,
    pub suggestions: Vec<String>,
    pub is_fallback: bool,
}

/// 一个完整执行步骤的不可变记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub step_id: String,
    pub reasoning: ReasoningResult,
    pub actions: Vec<ToolCallResult>,
    pub observation: ObservationResult,
    pub success: bool,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// 执行上下文：构建一次，之后只读
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub task: String,
    pub goal: String,
    pub constraints: Vec<String>,
    pub available_tools: Vec<ToolSpec>,
    pub memory: Vec<String>,
    pub conversation: Vec<Message>,
    pub preferences: HashMap<String, Value>,
    pub environment: HashMap<String, String>,
}

impl ExecutionContext {
    pub fn new(task: impl Into<String>, goal: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            goal: goal.into(),
            ..Default::default()
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.available_tools = tools;
        self
    }
}

/// 向推理服务请求的结构化结论
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conclusion {
    pub answer: String,
    #[serde(default)]
    pub key_points: Vec<String>,
    #[serde(default)]
    pub limitations: Vec<String>,
    pub confidence: f64,
    /// 推理服务不可用时由本地计数生成
    #[serde(default)]
    pub is_fallback: bool,
}

/// 一次运行的最终结果，只产生一次
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub result: Value,
    pub summary: String,
    pub conclusion: Option<Conclusion>,
    pub plan: Vec<Step>,
    pub history: Vec<HistoryEntry>,
    pub execution_time_ms: u64,
    pub error_count: u32,
    pub confidence: f64,
    pub recommendations: Vec<String>,
    pub metadata: serde_json::Map<String, Value>,
}

impl ExecutionResult {
    /// 未经结果汇总的失败结果（启动失败、崩溃、超时）
    pub fn failure(summary: impl Into<String>, error: serde_json::Value, execution_time_ms: u64) -> Self {
        let mut metadata = serde_json::Map::new();
        metadata.insert("error".to_string(), error);
        Self {
            success: false,
            result: Value::Null,
            summary: summary.into(),
            conclusion: None,
            plan: Vec::new(),
            history: Vec::new(),
            execution_time_ms,
            error_count: 1,
            confidence: 0.0,
            recommendations: vec!["Inspect the error details and retry the task".to_string()],
            metadata,
        }
    }
}
