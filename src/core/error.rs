//! Agent 错误类型与对外错误报告
//!
//! AgentError 为内部传播用的 thiserror 枚举；对外（事件流 / ExecutionResult）统一转为 ErrorReport，
//! 按 ErrorKind 五类（tool / reasoning / planning / execution / validation）归档。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::llm::LlmError;
use crate::react::decode::DecodeError;

/// 运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Planning failed: {0}")]
    Planning(String),

    #[error("Tool {tool} failed: {message}")]
    Tool { tool: String, message: String },

    #[error("Step execution failed: {0}")]
    Execution(String),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Run exceeded timeout of {0}s")]
    Timeout(u64),
}

/// 对外错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ToolError,
    ReasoningError,
    PlanningError,
    ExecutionError,
    ValidationError,
}

/// 对外暴露的错误报告（事件流与最终结果中使用）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    pub details: serde_json::Value,
    pub step_id: Option<String>,
    pub recoverable: bool,
    pub suggestions: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Llm(_) => ErrorKind::ReasoningError,
            AgentError::Decode(_) | AgentError::Validation(_) => ErrorKind::ValidationError,
            AgentError::Planning(_) => ErrorKind::PlanningError,
            AgentError::Tool { .. } => ErrorKind::ToolError,
            AgentError::Execution(_)
            | AgentError::ConversationNotFound(_)
            | AgentError::SessionNotFound(_)
            | AgentError::ConfigError(_)
            | AgentError::Timeout(_) => ErrorKind::ExecutionError,
        }
    }

    /// 降级到本地 fallback 或走单步重试即可恢复的错误
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            AgentError::ConversationNotFound(_)
                | AgentError::SessionNotFound(_)
                | AgentError::ConfigError(_)
                | AgentError::Timeout(_)
        )
    }

    /// 转为对外报告；recoverable 以调用方判定为准（如重试次数耗尽时传 false）
    pub fn report(&self, step_id: Option<&str>, recoverable: bool) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            details: serde_json::Value::Null,
            step_id: step_id.map(String::from),
            recoverable,
            suggestions: suggestions_for(self.kind()),
            timestamp: Utc::now(),
        }
    }
}

fn suggestions_for(kind: ErrorKind) -> Vec<String> {
    let items: &[&str] = match kind {
        ErrorKind::ToolError => &["Check the tool input", "Retry the failed tool call"],
        ErrorKind::ReasoningError => &["Check the reasoning service availability", "Retry the step"],
        ErrorKind::PlanningError => &["Rephrase the task or goal more concretely"],
        ErrorKind::ExecutionError => &["Inspect the step dependencies", "Retry the task"],
        ErrorKind::ValidationError => &["Ask the model to answer in the required JSON format"],
    };
    items.iter().map(|s| s.to_string()).collect()
}
