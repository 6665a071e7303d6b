//! 会话管理器
//!
//! 持有并发 AgentEngine 会话的注册表（session_id -> Session），提供 start / stop / delete / list / cleanup。
//! start_task 立即返回 SessionHandle，引擎在后台任务中运行；事件经每个会话自己的通道投递，
//! 最后一项总是 SessionEvent::Completed（恰好一次）。引擎崩溃、超时也会被转换为失败结果，会话不会悬而未决。
//!
//! 注册表只在本模块的方法与后台驱动任务中修改，引擎内部不触碰。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

use crate::config::{AgentConfigPatch, AppConfig};
use crate::core::error::{AgentError, ErrorReport};
use crate::core::session_supervisor::SessionSupervisor;
use crate::core::state::AgentStatus;
use crate::llm::ReasoningService;
use crate::memory::{ConversationStore, MemoryProvider, Role};
use crate::react::engine::AgentEngine;
use crate::react::events::{ChannelSink, SessionEvent};
use crate::react::types::{ExecutionContext, ExecutionResult};
use crate::tools::ToolExecutor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

/// 会话快照（读取时 clone）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub task: String,
    pub goal: String,
    pub conversation_id: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub result: Option<ExecutionResult>,
    pub error: Option<ErrorReport>,
}

impl Session {
    fn is_expired(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.start_time)
            .to_std()
            .map(|age| age > max_age)
            .unwrap_or(false)
    }
}

/// start_task 的返回：会话 id 与该会话的事件流
#[derive(Debug)]
pub struct SessionHandle {
    pub session_id: String,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

impl SessionHandle {
    /// 消费事件流直到 Completed；返回最终结果
    pub async fn wait(mut self) -> Option<ExecutionResult> {
        while let Some(event) = self.events.recv().await {
            if let SessionEvent::Completed(result) = event {
                return Some(*result);
            }
        }
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub total: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
}

struct SessionEntry {
    session: Session,
    supervisor: SessionSupervisor,
}

type Registry = Arc<RwLock<HashMap<String, SessionEntry>>>;

/// 外部协作方由调用方显式注入
pub struct SessionManager {
    sessions: Registry,
    llm: Arc<dyn ReasoningService>,
    executor: Arc<ToolExecutor>,
    memory: Arc<dyn MemoryProvider>,
    conversations: Arc<dyn ConversationStore>,
    config: AppConfig,
}

impl SessionManager {
    pub fn new(
        config: AppConfig,
        llm: Arc<dyn ReasoningService>,
        executor: Arc<ToolExecutor>,
        memory: Arc<dyn MemoryProvider>,
        conversations: Arc<dyn ConversationStore>,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            llm,
            executor,
            memory,
            conversations,
            config,
        }
    }

    /// 构建上下文并在后台启动引擎；对话不存在时立即失败
    pub async fn start_task(
        &self,
        task: &str,
        goal: &str,
        conversation_id: &str,
    ) -> Result<SessionHandle, AgentError> {
        let conversation = self
            .conversations
            .get_by_id(conversation_id)
            .await
            .ok_or_else(|| AgentError::ConversationNotFound(conversation_id.to_string()))?;
        let memory = self
            .memory
            .find_related(task, self.config.session.memory_snippets)
            .await;
        let tools = self.executor.list_tools().await;

        let mut context = ExecutionContext::new(task, goal).with_tools(tools);
        context.memory = memory;
        context.conversation = conversation.excerpt(self.config.session.conversation_excerpt_len);
        context.constraints = self.config.session.constraints.clone();
        context
            .environment
            .insert("conversationId".to_string(), conversation_id.to_string());

        let session_id = format!("session_{}", uuid::Uuid::new_v4());
        let (event_tx, events) = mpsc::unbounded_channel();
        let engine = AgentEngine::new(
            session_id.clone(),
            context,
            self.config.agent.clone(),
            self.llm.clone(),
            self.executor.clone(),
            self.config.llm.generation_options(),
        )
        .with_sink(Arc::new(ChannelSink::new(event_tx.clone())));

        let session = Session {
            id: session_id.clone(),
            task: task.to_string(),
            goal: goal.to_string(),
            conversation_id: conversation_id.to_string(),
            status: SessionStatus::Running,
            start_time: Utc::now(),
            result: None,
            error: None,
        };
        self.sessions.write().await.insert(
            session_id.clone(),
            SessionEntry {
                session,
                supervisor: engine.supervisor(),
            },
        );
        tracing::info!(session_id = %session_id, task, "session started");

        tokio::spawn(drive_session(
            self.sessions.clone(),
            session_id.clone(),
            engine,
            event_tx,
            self.conversations.clone(),
            conversation_id.to_string(),
            self.config.agent.timeout_secs,
        ));

        Ok(SessionHandle { session_id, events })
    }

    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .map(|e| e.session.clone())
    }

    /// 按启动时间排序
    pub async fn list_sessions(&self) -> Vec<Session> {
        let mut list: Vec<Session> = self
            .sessions
            .read()
            .await
            .values()
            .map(|e| e.session.clone())
            .collect();
        list.sort_by(|a, b| a.start_time.cmp(&b.start_time).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn list_active_sessions(&self) -> Vec<Session> {
        self.list_sessions()
            .await
            .into_iter()
            .filter(|s| s.status == SessionStatus::Running)
            .collect()
    }

    /// 仅运行中的会话可停止。返回 true 只表示已请求停止：状态先记为 stopped，
    /// 运行结束时按实际结局重写（未到下一步骤边界就跑完的运行仍记为 completed / failed）
    pub async fn stop_session(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(session_id) {
            Some(entry) if entry.session.status == SessionStatus::Running => {
                entry.supervisor.stop();
                entry.session.status = SessionStatus::Stopped;
                tracing::info!(session_id, "session stopped");
                true
            }
            _ => false,
        }
    }

    /// 运行中则先停止，再移除
    pub async fn delete_session(&self, session_id: &str) -> bool {
        match self.sessions.write().await.remove(session_id) {
            Some(entry) => {
                if entry.session.status == SessionStatus::Running {
                    entry.supervisor.stop();
                }
                tracing::info!(session_id, "session deleted");
                true
            }
            None => false,
        }
    }

    /// 移除启动时间早于 max_age 的会话（不论状态），返回移除数量
    pub async fn cleanup_expired_sessions(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, e)| e.session.is_expired(max_age, now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(entry) = sessions.remove(id) {
                if entry.session.status == SessionStatus::Running {
                    entry.supervisor.stop();
                }
            }
        }
        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "expired sessions cleaned up");
        }
        expired.len()
    }

    pub async fn session_stats(&self) -> SessionStats {
        let sessions = self.sessions.read().await;
        let mut stats = SessionStats {
            total: sessions.len(),
            ..Default::default()
        };
        for e in sessions.values() {
            match e.session.status {
                SessionStatus::Running => stats.running += 1,
                SessionStatus::Completed => stats.completed += 1,
                SessionStatus::Failed => stats.failed += 1,
                SessionStatus::Stopped => stats.stopped += 1,
            }
        }
        stats
    }

    /// 把配置补丁下发给运行中的引擎，下一步骤边界生效；会话已结束时返回 Ok(false)
    pub async fn update_session_config(
        &self,
        session_id: &str,
        patch: AgentConfigPatch,
    ) -> Result<bool, AgentError> {
        let sessions = self.sessions.read().await;
        let entry = sessions
            .get(session_id)
            .ok_or_else(|| AgentError::SessionNotFound(session_id.to_string()))?;
        if entry.session.status != SessionStatus::Running {
            return Ok(false);
        }
        Ok(entry.supervisor.update_config(patch))
    }
}

enum RunOutcome {
    Finished(ExecutionResult, AgentStatus),
    Crashed(String),
    TimedOut(u64),
}

/// 后台驱动：运行引擎、转换异常、更新注册表、尽力持久化，最后投递 Completed
async fn drive_session(
    sessions: Registry,
    session_id: String,
    engine: AgentEngine,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    conversations: Arc<dyn ConversationStore>,
    conversation_id: String,
    timeout_secs: Option<u64>,
) {
    let started = Instant::now();
    let mut run = tokio::spawn(async move {
        let mut engine = engine;
        let result = engine.execute().await;
        (result, engine.state().status)
    });

    let joined = match timeout_secs {
        Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), &mut run).await {
            Ok(joined) => Some(joined),
            Err(_) => {
                run.abort();
                // 等待任务真正结束，之后不会再有进度事件
                let _ = run.await;
                None
            }
        },
        None => Some(run.await),
    };
    let outcome = match joined {
        Some(Ok((result, status))) => RunOutcome::Finished(result, status),
        Some(Err(e)) => RunOutcome::Crashed(e.to_string()),
        None => RunOutcome::TimedOut(timeout_secs.unwrap_or_default()),
    };
    let elapsed = started.elapsed().as_millis() as u64;

    let (result, status, error) = match outcome {
        RunOutcome::Finished(result, agent_status) => {
            let status = match agent_status {
                AgentStatus::Paused => SessionStatus::Stopped,
                _ if result.success => SessionStatus::Completed,
                _ => SessionStatus::Failed,
            };
            (result, status, None)
        }
        RunOutcome::Crashed(message) => {
            tracing::error!(session_id = %session_id, error = %message, "engine task crashed");
            let err = AgentError::Execution(format!("engine task crashed: {message}"));
            terminal_failure(&err, elapsed)
        }
        RunOutcome::TimedOut(secs) => {
            tracing::warn!(session_id = %session_id, secs, "session timed out");
            terminal_failure(&AgentError::Timeout(secs), elapsed)
        }
    };
    if let Some(report) = &error {
        let _ = event_tx.send(SessionEvent::Error(report.clone()));
    }

    {
        let mut guard = sessions.write().await;
        match guard.get_mut(&session_id) {
            Some(entry) => {
                // 以运行实际结局为准：停止请求晚于最后一个步骤边界时仍可能成功完成
                entry.session.status = status;
                entry.session.result = Some(result.clone());
                entry.session.error = error;
            }
            None => tracing::debug!(session_id = %session_id, "session removed before completion"),
        }
    }

    let text = persisted_summary(&result);
    tokio::spawn(async move {
        if let Err(e) = conversations
            .append_message(&conversation_id, &text, Role::Assistant)
            .await
        {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "failed to persist session result");
        }
    });

    tracing::info!(session_id = %session_id, ?status, success = result.success, "session finished");
    let _ = event_tx.send(SessionEvent::Completed(Box::new(result)));
}

/// 不可恢复的失败结果（error_count = 1）
fn terminal_failure(
    error: &AgentError,
    elapsed_ms: u64,
) -> (ExecutionResult, SessionStatus, Option<ErrorReport>) {
    let report = error.report(None, false);
    let value = serde_json::to_value(&report).unwrap_or(serde_json::Value::Null);
    let result = ExecutionResult::failure(report.message.clone(), value, elapsed_ms);
    (result, SessionStatus::Failed, Some(report))
}

fn persisted_summary(result: &ExecutionResult) -> String {
    let mut text = format!(
        "{} {}",
        if result.success { "[task succeeded]" } else { "[task failed]" },
        result.summary
    );
    if let Some(c) = &result.conclusion {
        text.push_str(&format!("\n\n{}", c.answer));
        for p in &c.key_points {
            text.push_str(&format!("\n- {p}"));
        }
    }
    if !result.recommendations.is_empty() {
        text.push_str("\n\nRecommendations:");
        for r in &result.recommendations {
            text.push_str(&format!("\n- {r}"));
        }
    }
    text
}
