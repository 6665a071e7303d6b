//! 执行过程事件：step_start / status_change / step_complete / step_error
//!
//! 引擎通过 ProgressSink 同步发出事件，保证会话内按产生顺序投递；
//! SessionManager 使用 ChannelSink 把事件汇入每个会话自己的事件流。

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::error::ErrorReport;
use crate::core::state::AgentStatus;
use crate::react::types::ExecutionResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    StepStart,
    StatusChange,
    StepComplete,
    StepError,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,
    pub agent_id: String,
    pub step_id: Option<String>,
    pub status: AgentStatus,
    /// 0-100
    pub progress: f64,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

/// 会话事件流中的一项；Completed 恰好一次且总是最后一项
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Progress(ProgressEvent),
    Error(ErrorReport),
    Completed(Box<ExecutionResult>),
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);

    fn error(&self, _report: ErrorReport) {}
}

#[derive(Default)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// 记录全部事件，测试用
#[derive(Clone, Default)]
pub struct BufferedSink {
    events: Arc<Mutex<Vec<ProgressEvent>>>,
    errors: Arc<Mutex<Vec<ErrorReport>>>,
}

impl BufferedSink {
    pub fn snapshot(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn errors(&self) -> Vec<ErrorReport> {
        self.errors.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl ProgressSink for BufferedSink {
    fn emit(&self, event: ProgressEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(event);
        }
    }

    fn error(&self, report: ErrorReport) {
        if let Ok(mut g) = self.errors.lock() {
            g.push(report);
        }
    }
}

/// 转发到会话事件流；接收端已关闭时静默丢弃
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { tx }
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(SessionEvent::Progress(event));
    }

    fn error(&self, report: ErrorReport) {
        let _ = self.tx.send(SessionEvent::Error(report));
    }
}
