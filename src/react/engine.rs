//! AgentEngine：单会话执行状态机
//!
//! idle -> planning -> (reasoning -> acting -> observing [-> reflecting]) * N -> completed | failed | paused
//!
//! - 每步：标记 running 并发出 step_start，推理；置信度达到阈值且给出动作时执行动作与观察、追加 HistoryEntry，
//!   否则标记 skipped（不产生 HistoryEntry）。
//! - 步骤级错误（含步骤内 panic）：标记 failed、error_count + 1、发出 step_error；error_count > max_retries 时运行失败，
//!   否则 retry_count + 1 并重跑同一步。
//! - 停止与配置补丁只在步骤边界生效，不打断进行中的推理或工具调用。
//!
//! AgentState 只由 execute 所在的任务修改；同一会话内所有外部调用严格串行。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::FutureExt;
use serde_json::{json, Value};

use crate::config::{AgentConfig, AgentConfigPatch};
use crate::core::session_supervisor::{EngineControl, SessionSupervisor};
use crate::core::{AgentError, AgentState, AgentStatus};
use crate::llm::{GenerationOptions, ReasoningService};
use crate::react::acting::ActingPhase;
use crate::react::events::{NoopSink, ProgressEvent, ProgressEventType, ProgressSink};
use crate::react::observing::ObservingPhase;
use crate::react::planner::Planner;
use crate::react::reasoning::ReasoningPhase;
use crate::react::reflection::ReflectionPhase;
use crate::react::synthesizer::{ResultSynthesizer, StepCounts};
use crate::react::types::{ExecutionContext, ExecutionResult, HistoryEntry, Step, StepStatus};
use crate::tools::ToolExecutor;

pub struct AgentEngine {
    state: AgentState,
    context: Arc<ExecutionContext>,
    config: AgentConfig,
    planner: Planner,
    reasoning: ReasoningPhase,
    acting: ActingPhase,
    observing: ObservingPhase,
    reflection: ReflectionPhase,
    synthesizer: ResultSynthesizer,
    sink: Arc<dyn ProgressSink>,
    supervisor: SessionSupervisor,
    control: EngineControl,
    preset_plan: Option<Vec<Step>>,
    reasoning_samples: usize,
}

impl AgentEngine {
    /// 每个引擎持有自己的配置副本与阶段实例；llm 与 executor 为共享只读单例
    pub fn new(
        id: impl Into<String>,
        context: ExecutionContext,
        config: AgentConfig,
        llm: Arc<dyn ReasoningService>,
        executor: Arc<ToolExecutor>,
        options: GenerationOptions,
    ) -> Self {
        let (supervisor, control) = SessionSupervisor::new();
        Self {
            state: AgentState::new(id, context.task.clone(), context.goal.clone()),
            context: Arc::new(context),
            planner: Planner::new(llm.clone(), options.clone(), config.max_steps),
            reasoning: ReasoningPhase::new(llm.clone(), options.clone(), config.history_window),
            acting: ActingPhase::new(llm.clone(), options.clone(), executor),
            observing: ObservingPhase::new(llm.clone(), options.clone()),
            reflection: ReflectionPhase::new(llm.clone(), options.clone(), config.history_window),
            synthesizer: ResultSynthesizer::new(llm, options, config.enable_conclusion, config.history_window),
            config,
            sink: Arc::new(NoopSink),
            supervisor,
            control,
            preset_plan: None,
            reasoning_samples: 0,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// 使用给定计划，跳过 Planner
    pub fn with_plan(mut self, plan: Vec<Step>) -> Self {
        self.preset_plan = Some(plan);
        self
    }

    /// 外部控制句柄：stop / update_config，在步骤边界生效
    pub fn supervisor(&self) -> SessionSupervisor {
        self.supervisor.clone()
    }

    pub fn state(&self) -> &AgentState {
        &self.state
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// 请求停止；下一步骤边界状态变为 paused
    pub fn stop(&self) {
        self.supervisor.stop();
    }

    /// 合并部分配置到引擎与全部阶段
    pub fn update_config(&mut self, patch: &AgentConfigPatch) {
        self.config.apply(patch);
        self.planner.apply_patch(patch);
        self.reasoning.apply_patch(patch);
        self.acting.apply_patch(patch);
        self.observing.apply_patch(patch);
        self.reflection.apply_patch(patch);
        self.synthesizer.apply_patch(patch);
        tracing::info!(agent_id = %self.state.id, ?patch, "engine config updated");
    }

    /// 运行到终态并返回唯一的 ExecutionResult
    pub async fn execute(&mut self) -> ExecutionResult {
        let start = Instant::now();
        if self.state.status != AgentStatus::Idle {
            let err = AgentError::Execution(format!("engine {} has already run", self.state.id));
            return ExecutionResult::failure(
                err.to_string(),
                report_value(&err, None, false),
                0,
            );
        }

        self.apply_pending_patches();
        if self.control.is_stopped() {
            self.set_status(AgentStatus::Paused, None, "stopped before planning".to_string());
            return self.stopped_result(start.elapsed().as_millis() as u64);
        }

        self.set_status(AgentStatus::Planning, None, "planning".to_string());
        let plan = match self.preset_plan.take() {
            Some(plan) if !plan.is_empty() => plan,
            _ => self.planner.create_plan(&self.context).await,
        };
        self.state.set_plan(plan);
        let step_ids: Vec<&str> = self.state.plan.iter().map(|s| s.id.as_str()).collect();
        let plan_data = json!({ "steps": step_ids });
        self.state.status = AgentStatus::Reasoning;
        self.emit(
            ProgressEventType::StatusChange,
            None,
            format!("plan ready with {} steps", self.state.total_steps),
            Some(plan_data),
        );

        let mut index = 0;
        while index < self.state.plan.len() {
            self.apply_pending_patches();
            if self.control.is_stopped() {
                tracing::info!(agent_id = %self.state.id, index, "stop requested");
                self.set_status(AgentStatus::Paused, None, "execution stopped".to_string());
                break;
            }

            let step_id = self.state.plan[index].id.clone();
            let outcome = match AssertUnwindSafe(self.run_step(index)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => Err(AgentError::Execution(format!(
                    "step {step_id} panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            };
            match outcome {
                Ok(()) => index += 1,
                Err(e) => {
                    if self.handle_step_error(index, e) {
                        break;
                    }
                }
            }
        }

        let elapsed = start.elapsed().as_millis() as u64;
        match self.state.status {
            AgentStatus::Paused => return self.stopped_result(elapsed),
            status if status.is_terminal() => {}
            _ => {
                self.state.status = AgentStatus::Completed;
                self.state.sync_counters();
                self.state.progress = 100.0;
                self.emit(ProgressEventType::StatusChange, None, "execution completed".to_string(), None);
            }
        }

        let result = self.synthesizer.synthesize(&self.state, &self.context, elapsed).await;
        tracing::info!(
            agent_id = %self.state.id,
            success = result.success,
            errors = result.error_count,
            elapsed_ms = elapsed,
            "run finished"
        );
        result
    }

    async fn run_step(&mut self, index: usize) -> Result<(), AgentError> {
        let started = Instant::now();
        self.state.plan[index].begin_attempt();
        self.state.status = AgentStatus::Reasoning;
        self.state.sync_counters();
        let step = self.state.plan[index].clone();
        self.emit(
            ProgressEventType::StepStart,
            Some(step.id.as_str()),
            format!("step {} started: {}", step.id, step.description),
            Some(json!({ "attempt": step.attempts })),
        );

        self.check_dependencies(&step)?;

        let window_start = self
            .state
            .history
            .len()
            .saturating_sub(self.reasoning.history_window());
        let reasoning = self
            .reasoning
            .reason(&step, &self.context, &self.state.history[window_start..])
            .await;
        self.state.plan[index].thoughts.extend(reasoning.thoughts.iter().cloned());
        self.reasoning_samples += 1;
        self.state.record_confidence(reasoning.confidence, self.reasoning_samples);

        let proceed = reasoning.confidence >= self.config.confidence_threshold
            && !reasoning.next_action.trim().is_empty();
        if !proceed {
            tracing::info!(
                step_id = %step.id,
                confidence = reasoning.confidence,
                threshold = self.config.confidence_threshold,
                "confidence below threshold, skipping step"
            );
            let s = &mut self.state.plan[index];
            s.result = Some(json!({ "skipped": true, "confidence": reasoning.confidence }));
            s.finish(StepStatus::Skipped);
            self.state.sync_counters();
            self.emit(
                ProgressEventType::StepComplete,
                Some(step.id.as_str()),
                format!("step {} skipped", step.id),
                Some(json!({ "skipped": true, "confidence": reasoning.confidence })),
            );
            return Ok(());
        }

        self.set_status(
            AgentStatus::Acting,
            Some(step.id.as_str()),
            format!("acting: {}", reasoning.next_action),
        );
        let mut actions = self.acting.act(&reasoning.next_action, &step, &self.context).await;
        if self.config.tool_retry_limit > 0 && actions.iter().any(|a| !a.success) {
            actions = self
                .acting
                .retry_failed_tools(actions, self.config.tool_retry_limit)
                .await;
        }

        self.set_status(
            AgentStatus::Observing,
            Some(step.id.as_str()),
            format!("observing {} tool result(s)", actions.len()),
        );
        let observation = self
            .observing
            .observe(&actions, &step.expected_outcome, &self.context)
            .await;

        let success = !actions.is_empty() && actions.iter().all(|a| a.success);
        let s = &mut self.state.plan[index];
        s.result = Some(json!({
            "success": success,
            "toolCalls": actions.len(),
            "observations": observation.observations,
        }));
        s.finish(StepStatus::Completed);
        let should_reflect = self.config.enable_reflection && ReflectionPhase::should_reflect(&observation);
        let confidence = observation.confidence;
        self.state.history.push(HistoryEntry {
            step_id: step.id.clone(),
            reasoning,
            actions,
            observation,
            success,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
        self.state.sync_counters();

        if should_reflect {
            self.reflect(&step.id).await;
        }

        self.emit(
            ProgressEventType::StepComplete,
            Some(step.id.as_str()),
            format!("step {} completed", step.id),
            Some(json!({ "success": success, "confidence": confidence })),
        );
        Ok(())
    }

    fn check_dependencies(&self, step: &Step) -> Result<(), AgentError> {
        for dep in &step.dependencies {
            match self.state.plan.iter().find(|s| &s.id == dep) {
                Some(d) if d.status.satisfies_dependency() => {}
                Some(d) => {
                    return Err(AgentError::Execution(format!(
                        "step {} depends on {} which is {:?}",
                        step.id, dep, d.status
                    )))
                }
                None => {
                    return Err(AgentError::Execution(format!(
                        "step {} depends on unknown step {}",
                        step.id, dep
                    )))
                }
            }
        }
        Ok(())
    }

    /// 返回 true 表示运行失败并退出循环
    fn handle_step_error(&mut self, index: usize, error: AgentError) -> bool {
        let step_id = self.state.plan[index].id.clone();
        let s = &mut self.state.plan[index];
        s.error = Some(error.to_string());
        s.finish(StepStatus::Failed);
        self.state.error_count += 1;
        self.state.sync_counters();

        // 不可恢复的错误直接结束运行，不消耗重试预算
        let exhausted = self.state.error_count > self.config.max_retries || !error.is_recoverable();
        let report = error.report(Some(step_id.as_str()), !exhausted);
        self.emit(
            ProgressEventType::StepError,
            Some(step_id.as_str()),
            report.message.clone(),
            serde_json::to_value(&report).ok(),
        );
        self.sink.error(report);

        if exhausted {
            tracing::warn!(
                step_id = %step_id,
                errors = self.state.error_count,
                max_retries = self.config.max_retries,
                "retry budget exhausted"
            );
            self.set_status(
                AgentStatus::Failed,
                Some(step_id.as_str()),
                format!("execution failed at step {}", step_id),
            );
            true
        } else {
            self.state.retry_count += 1;
            tracing::warn!(step_id = %step_id, error = %error, retry = self.state.retry_count, "retrying step");
            false
        }
    }

    /// 尽力而为：失败只记日志
    async fn reflect(&mut self, step_id: &str) {
        self.set_status(AgentStatus::Reflecting, Some(step_id), "reflecting".to_string());
        match self
            .reflection
            .reflect(step_id, &self.context, &self.state.history)
            .await
        {
            Ok(reflection) => match serde_json::to_value(&reflection) {
                Ok(v) => {
                    let slot = self
                        .state
                        .metadata
                        .entry("reflections")
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if let Value::Array(list) = slot {
                        list.push(v);
                    }
                }
                Err(e) => tracing::warn!(step_id, error = %e, "failed to store reflection"),
            },
            Err(e) => tracing::warn!(step_id, error = %e, "reflection failed"),
        }
    }

    fn apply_pending_patches(&mut self) {
        for patch in self.control.take_patches() {
            self.update_config(&patch);
        }
    }

    /// 停止的运行不经过结果汇总
    fn stopped_result(&self, execution_time_ms: u64) -> ExecutionResult {
        let counts = StepCounts::of(&self.state);
        let mut metadata = serde_json::Map::new();
        metadata.insert("agentId".to_string(), json!(self.state.id));
        metadata.insert("status".to_string(), json!(self.state.status));
        metadata.insert("stopped".to_string(), json!(true));
        ExecutionResult {
            success: false,
            result: json!({
                "stopped": true,
                "completedSteps": counts.completed,
                "skippedSteps": counts.skipped,
            }),
            summary: format!(
                "Run stopped after {} of {} steps",
                counts.completed + counts.skipped,
                counts.total
            ),
            conclusion: None,
            plan: self.state.plan.clone(),
            history: self.state.history.clone(),
            execution_time_ms,
            error_count: self.state.error_count,
            confidence: self.state.confidence,
            recommendations: vec!["Start the task again to finish the remaining steps".to_string()],
            metadata,
        }
    }

    fn set_status(&mut self, status: AgentStatus, step_id: Option<&str>, message: String) {
        self.state.status = status;
        self.emit(ProgressEventType::StatusChange, step_id, message, None);
    }

    fn emit(
        &self,
        event_type: ProgressEventType,
        step_id: Option<&str>,
        message: String,
        data: Option<Value>,
    ) {
        self.sink.emit(ProgressEvent {
            event_type,
            agent_id: self.state.id.clone(),
            step_id: step_id.map(String::from),
            status: self.state.status,
            progress: self.state.progress,
            message,
            data,
            timestamp: Utc::now(),
        });
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn report_value(error: &AgentError, step_id: Option<&str>, recoverable: bool) -> Value {
    serde_json::to_value(error.report(step_id, recoverable)).unwrap_or(Value::Null)
}
