//! SessionManager 集成测试：后台运行、事件流、停止、配置补丁、崩溃与超时

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use autopilot::config::{AgentConfigPatch, AppConfig};
use autopilot::core::{ErrorKind, SessionManager, SessionStatus};
use autopilot::llm::{GenerationOptions, LlmError, MockReasoningService, ReasoningService};
use autopilot::memory::{ConversationStore, InMemoryConversationStore, NoopMemory, Role};
use autopilot::react::{ProgressEventType, SessionEvent, StepStatus};
use autopilot::tools::{EchoTool, Tool, ToolExecutor, ToolRegistry};

struct SlowTool(u64);

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "sleeps before answering"
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        tokio::time::sleep(Duration::from_millis(self.0)).await;
        Ok("slept".to_string())
    }
}

/// 推理后端每次调用都 panic，用于模拟引擎任务崩溃
struct CrashingLlm;

#[async_trait]
impl ReasoningService for CrashingLlm {
    async fn generate_text(&self, _prompt: &str, _options: &GenerationOptions) -> Result<String, LlmError> {
        panic!("backend crashed")
    }
}

/// 在工具调用中停止所有运行中的会话，并记录 stop_session 的返回值
struct LateStopTool {
    manager: Arc<OnceLock<Arc<SessionManager>>>,
    requested: Arc<AtomicBool>,
}

#[async_trait]
impl Tool for LateStopTool {
    fn name(&self) -> &str {
        "stopper"
    }

    fn description(&self) -> &str {
        "stops running sessions"
    }

    async fn execute(&self, _args: Value) -> Result<String, String> {
        if let Some(manager) = self.manager.get() {
            for session in manager.list_active_sessions().await {
                if manager.stop_session(&session.id).await {
                    self.requested.store(true, Ordering::SeqCst);
                }
            }
        }
        Ok("stop requested".to_string())
    }
}

fn reason(confidence: f64) -> String {
    json!({
        "thoughts": ["work on it"],
        "nextAction": "call the tool",
        "confidence": confidence,
        "reasoning": "r",
        "alternatives": []
    })
    .to_string()
}

fn act(tool: &str) -> String {
    json!({"toolCalls": [{"toolName": tool, "input": {"text": "x"}}]}).to_string()
}

fn observe() -> String {
    json!({"observations": ["tool answered"], "confidence": 0.9}).to_string()
}

fn two_step_plan() -> String {
    json!({"steps": [{"description": "first"}, {"description": "second"}]}).to_string()
}

struct Fixture {
    manager: Arc<SessionManager>,
    store: Arc<InMemoryConversationStore>,
    conversation_id: String,
}

async fn fixture(mock: MockReasoningService, slow_ms: u64, timeout_secs: Option<u64>) -> Fixture {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    registry.register(SlowTool(slow_ms));
    fixture_with(Arc::new(mock), registry, timeout_secs).await
}

async fn fixture_with(
    llm: Arc<dyn ReasoningService>,
    registry: ToolRegistry,
    timeout_secs: Option<u64>,
) -> Fixture {
    let store = Arc::new(InMemoryConversationStore::new());
    let conversation_id = store.create("it").await;
    store
        .append_message(&conversation_id, "please do the thing", Role::User)
        .await
        .unwrap();

    let mut config = AppConfig::default();
    config.agent.enable_conclusion = false;
    config.agent.enable_reflection = false;
    config.agent.timeout_secs = timeout_secs;
    let manager = SessionManager::new(
        config,
        llm,
        Arc::new(ToolExecutor::new(Arc::new(registry), 30)),
        Arc::new(NoopMemory),
        store.clone(),
    );
    Fixture {
        manager: Arc::new(manager),
        store,
        conversation_id,
    }
}

async fn collect(mut events: tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Some(e) = events.recv().await {
        out.push(e);
    }
    out
}

fn completed_last(events: &[SessionEvent]) -> autopilot::ExecutionResult {
    let completed = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::Completed(_)))
        .count();
    assert_eq!(completed, 1);
    match events.last() {
        Some(SessionEvent::Completed(r)) => (**r).clone(),
        other => panic!("last event is not Completed: {other:?}"),
    }
}

async fn persisted(store: &InMemoryConversationStore, id: &str) -> String {
    for _ in 0..50 {
        let conv = store.get_by_id(id).await.unwrap();
        if let Some(m) = conv.messages.iter().find(|m| m.role == Role::Assistant) {
            return m.content.clone();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session result was not persisted")
}

#[tokio::test]
async fn test_successful_session_streams_events_and_persists() {
    let mock = MockReasoningService::with_responses([
        two_step_plan(),
        reason(0.9),
        act("echo"),
        observe(),
        reason(0.9),
        act("echo"),
        observe(),
    ]);
    let f = fixture(mock, 0, None).await;
    let handle = f.manager.start_task("do the thing", "thing done", &f.conversation_id).await.unwrap();
    let id = handle.session_id.clone();
    let events = collect(handle.events).await;

    let result = completed_last(&events);
    assert!(result.success);
    assert_eq!(result.history.len(), 2);

    let starts = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::Progress(p) if p.event_type == ProgressEventType::StepStart))
        .count();
    assert_eq!(starts, 2);
    // 所有进度事件都属于该会话
    assert!(events.iter().all(|e| match e {
        SessionEvent::Progress(p) => p.agent_id == id,
        _ => true,
    }));

    let session = f.manager.get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.result.unwrap().success);
    assert!(persisted(&f.store, &f.conversation_id).await.starts_with("[task succeeded]"));
}

#[tokio::test]
async fn test_stop_running_session() {
    let mock = MockReasoningService::with_responses([two_step_plan(), reason(0.9), act("slow"), observe()]);
    let f = fixture(mock, 300, None).await;
    let mut handle = f.manager.start_task("t", "g", &f.conversation_id).await.unwrap();
    let id = handle.session_id.clone();

    let mut stopped = false;
    let mut result = None;
    while let Some(event) = handle.events.recv().await {
        match event {
            SessionEvent::Progress(p) if p.event_type == ProgressEventType::StepStart && !stopped => {
                assert!(f.manager.stop_session(&id).await);
                stopped = true;
            }
            SessionEvent::Completed(r) => result = Some(*r),
            _ => {}
        }
    }
    let result = result.unwrap();
    assert!(!result.success);
    assert_eq!(result.metadata["stopped"], true);
    assert_eq!(result.history.len(), 1);
    assert_eq!(result.plan[1].status, StepStatus::Pending);

    let session = f.manager.get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Stopped);
    // 已停止的会话不能再次停止
    assert!(!f.manager.stop_session(&id).await);
    assert_eq!(f.manager.session_stats().await.stopped, 1);
}

#[tokio::test]
async fn test_config_patch_applies_at_next_step() {
    let mock = MockReasoningService::with_responses([
        two_step_plan(),
        reason(0.9),
        act("slow"),
        observe(),
        reason(0.9),
    ]);
    let f = fixture(mock, 200, None).await;
    let mut handle = f.manager.start_task("t", "g", &f.conversation_id).await.unwrap();
    let id = handle.session_id.clone();

    let mut patched = false;
    let mut result = None;
    while let Some(event) = handle.events.recv().await {
        match event {
            SessionEvent::Progress(p) if p.event_type == ProgressEventType::StepStart && !patched => {
                let patch = AgentConfigPatch {
                    confidence_threshold: Some(0.95),
                    ..Default::default()
                };
                assert!(f.manager.update_session_config(&id, patch).await.unwrap());
                patched = true;
            }
            SessionEvent::Completed(r) => result = Some(*r),
            _ => {}
        }
    }
    let result = result.unwrap();
    assert_eq!(result.plan[0].status, StepStatus::Completed);
    assert_eq!(result.plan[1].status, StepStatus::Skipped);

    // 会话结束后补丁不再下发
    let late = f.manager.update_session_config(&id, AgentConfigPatch::default()).await;
    assert!(!late.unwrap());
    assert!(f.manager.update_session_config("session_missing", AgentConfigPatch::default()).await.is_err());
}

#[tokio::test]
async fn test_engine_crash_becomes_failed_result() {
    // 规划阶段 panic 不在步骤重试范围内，整个引擎任务崩溃
    let f = fixture_with(Arc::new(CrashingLlm), ToolRegistry::new(), None).await;
    let handle = f.manager.start_task("t", "g", &f.conversation_id).await.unwrap();
    let id = handle.session_id.clone();
    let events = collect(handle.events).await;

    let result = completed_last(&events);
    assert!(!result.success);
    assert_eq!(result.error_count, 1);
    assert_eq!(result.metadata["error"]["type"], "execution_error");
    assert_eq!(result.metadata["error"]["recoverable"], false);
    assert!(events.iter().any(|e| matches!(e, SessionEvent::Error(r) if r.kind == ErrorKind::ExecutionError)));

    let session = f.manager.get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert!(session.error.is_some());
    assert!(persisted(&f.store, &f.conversation_id).await.starts_with("[task failed]"));
}

#[tokio::test]
async fn test_stop_after_last_step_keeps_completed_status() {
    let cell = Arc::new(OnceLock::new());
    let requested = Arc::new(AtomicBool::new(false));
    let mut registry = ToolRegistry::new();
    registry.register(LateStopTool {
        manager: cell.clone(),
        requested: requested.clone(),
    });
    let mock = MockReasoningService::with_responses([
        json!({"steps": [{"description": "only"}]}).to_string(),
        reason(0.9),
        act("stopper"),
        observe(),
    ]);
    let f = fixture_with(Arc::new(mock), registry, None).await;
    assert!(cell.set(f.manager.clone()).is_ok());

    let handle = f.manager.start_task("t", "g", &f.conversation_id).await.unwrap();
    let id = handle.session_id.clone();
    let result = handle.wait().await.unwrap();

    // 停止请求已被接受，但运行在下一步骤边界之前就结束了
    assert!(requested.load(Ordering::SeqCst));
    assert!(result.success);
    assert!(result.metadata.get("stopped").is_none());
    let session = f.manager.get_session(&id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.result.unwrap().success);
    assert_eq!(f.manager.session_stats().await.completed, 1);
}

#[tokio::test]
async fn test_session_timeout_fails_the_run() {
    let mock = MockReasoningService::with_responses([two_step_plan(), reason(0.9), act("slow")]);
    let f = fixture(mock, 10_000, Some(1)).await;
    let handle = f.manager.start_task("t", "g", &f.conversation_id).await.unwrap();
    let id = handle.session_id.clone();
    let events = collect(handle.events).await;

    let result = completed_last(&events);
    assert!(!result.success);
    assert_eq!(result.error_count, 1);
    assert!(result.summary.contains("timeout of 1s"));
    let error_at = events
        .iter()
        .position(|e| matches!(e, SessionEvent::Error(_)))
        .unwrap();
    assert_eq!(error_at, events.len() - 2);
    assert_eq!(f.manager.get_session(&id).await.unwrap().status, SessionStatus::Failed);
}

#[tokio::test]
async fn test_concurrent_sessions_are_independent() {
    // 空脚本：默认计划 + 全部 fallback，每步都被跳过
    let f = fixture(MockReasoningService::new(), 0, None).await;
    let a = f.manager.start_task("a", "a", &f.conversation_id).await.unwrap();
    let b = f.manager.start_task("b", "b", &f.conversation_id).await.unwrap();
    assert_ne!(a.session_id, b.session_id);
    let (ra, rb) = tokio::join!(a.wait(), b.wait());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());
    assert_eq!(ra.plan.len(), 3);
    assert_eq!(rb.plan.len(), 3);
    assert!(ra.plan.iter().all(|s| s.status == StepStatus::Skipped));

    let list = f.manager.list_sessions().await;
    assert_eq!(list.len(), 2);
    assert!(list[0].start_time <= list[1].start_time);
    assert!(f.manager.list_active_sessions().await.is_empty());
    assert_eq!(f.manager.session_stats().await.failed, 2);
}
