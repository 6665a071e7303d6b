//! Planner：由任务与目标生成有序步骤列表
//!
//! 调用推理服务得到 JSON 计划（{"steps": [...]} 或裸数组），容错解码后规范化 id 与依赖；
//! 任何失败（调用、解析、空计划）都替换为默认三步计划，计划永不为空。

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;

use crate::config::AgentConfigPatch;
use crate::core::AgentError;
use crate::llm::{GenerationOptions, ReasoningService};
use crate::react::decode::decode_payload;
use crate::react::prompts;
use crate::react::types::{ExecutionContext, Step, StepType};

const PLANNER_SYSTEM_PROMPT: &str = "You are the planning module of an autonomous task agent. \
Break the task into a short ordered list of concrete steps. Respond with JSON only: \
{\"steps\": [{\"id\": \"step_1\", \"type\": \"action\", \"description\": \"...\", \
\"expectedOutcome\": \"...\", \"dependencies\": []}]}";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlannedStep {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type", default)]
    step_type: Option<StepType>,
    description: String,
    #[serde(default)]
    expected_outcome: String,
    #[serde(default)]
    dependencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PlanPayload {
    Wrapped { steps: Vec<PlannedStep> },
    Bare(Vec<PlannedStep>),
}

pub struct Planner {
    llm: Arc<dyn ReasoningService>,
    options: GenerationOptions,
    max_steps: usize,
}

impl Planner {
    pub fn new(llm: Arc<dyn ReasoningService>, options: GenerationOptions, max_steps: usize) -> Self {
        Self {
            llm,
            options: options.with_system_prompt(PLANNER_SYSTEM_PROMPT),
            max_steps: max_steps.max(1),
        }
    }

    pub fn apply_patch(&mut self, patch: &AgentConfigPatch) {
        patch.apply_to_options(&mut self.options);
    }

    /// 生成计划；失败时返回默认计划
    pub async fn create_plan(&self, ctx: &ExecutionContext) -> Vec<Step> {
        match self.try_plan(ctx).await {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!(error = %e, "planning failed, using default plan");
                default_plan(ctx)
            }
        }
    }

    pub async fn try_plan(&self, ctx: &ExecutionContext) -> Result<Vec<Step>, AgentError> {
        let prompt = format!(
            "{}\n{}\nProduce at most {} steps.",
            prompts::context_section(ctx),
            prompts::tools_section(&ctx.available_tools),
            self.max_steps
        );
        let text = self.llm.generate_text(&prompt, &self.options).await?;
        let payload: PlanPayload = decode_payload(&text)?;
        let planned = match payload {
            PlanPayload::Wrapped { steps } | PlanPayload::Bare(steps) => steps,
        };
        let plan = normalize(planned, self.max_steps);
        if plan.is_empty() {
            return Err(AgentError::Planning("plan contains no usable steps".to_string()));
        }
        tracing::info!(steps = plan.len(), "plan created");
        Ok(plan)
    }
}

/// 分配缺失或重复的 id、过滤空描述、解析依赖引用（"step_2" 或序号 "2"）；未知引用丢弃，前向引用保留
fn normalize(planned: Vec<PlannedStep>, max_steps: usize) -> Vec<Step> {
    let planned: Vec<PlannedStep> = planned
        .into_iter()
        .filter(|p| !p.description.trim().is_empty())
        .take(max_steps)
        .collect();

    // 先保留显式 id（首次出现者），再为缺失或重复的步骤生成不冲突的 step_<n>
    let mut seen = HashSet::new();
    let explicit: Vec<Option<String>> = planned
        .iter()
        .map(|p| match p.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() && seen.insert(id.to_string()) => Some(id.to_string()),
            _ => None,
        })
        .collect();
    let ids: Vec<String> = explicit
        .into_iter()
        .enumerate()
        .map(|(i, id)| {
            id.unwrap_or_else(|| {
                let mut n = i + 1;
                while !seen.insert(format!("step_{n}")) {
                    n += 1;
                }
                format!("step_{n}")
            })
        })
        .collect();

    planned
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            let mut deps: Vec<String> = Vec::new();
            for d in p.dependencies.iter().filter_map(|d| resolve_dependency(d.trim(), &ids)) {
                if d != ids[i] && !deps.contains(&d) {
                    deps.push(d);
                }
            }
            Step::new(
                ids[i].clone(),
                p.step_type.unwrap_or(StepType::Action),
                p.description.trim(),
                p.expected_outcome.trim(),
            )
            .with_dependencies(deps)
        })
        .collect()
}

fn resolve_dependency(dep: &str, ids: &[String]) -> Option<String> {
    if ids.iter().any(|id| id == dep) {
        return Some(dep.to_string());
    }
    match dep.parse::<usize>() {
        Ok(n) if n >= 1 && n <= ids.len() => Some(ids[n - 1].clone()),
        _ => {
            tracing::debug!(dependency = dep, "dropping unknown dependency");
            None
        }
    }
}

/// 默认三步计划：分析 -> 执行 -> 验证
pub fn default_plan(ctx: &ExecutionContext) -> Vec<Step> {
    vec![
        Step::new(
            "step_1",
            StepType::Reasoning,
            format!("Analyze the task requirements: {}", ctx.task),
            "A clear understanding of what needs to be done",
        ),
        Step::new(
            "step_2",
            StepType::Action,
            format!("Carry out the task: {}", ctx.task),
            format!("Progress towards the goal: {}", ctx.goal),
        )
        .with_dependencies(vec!["step_1".to_string()]),
        Step::new(
            "step_3",
            StepType::Observation,
            format!("Verify the result against the goal: {}", ctx.goal),
            "Confirmation that the goal has been met",
        )
        .with_dependencies(vec!["step_2".to_string()]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockReasoningService};

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("clean build cache", "free disk space")
    }

    fn planner(mock: MockReasoningService, max_steps: usize) -> Planner {
        Planner::new(Arc::new(mock), GenerationOptions::default(), max_steps)
    }

    #[tokio::test]
    async fn test_plan_from_wrapped_payload() {
        let mock = MockReasoningService::with_responses([r#"Here is the plan:
```json
{"steps": [
  {"id": "a", "type": "reasoning", "description": "inspect", "expectedOutcome": "sizes"},
  {"description": "delete", "dependencies": ["a", "ghost", "1"]}
]}
```"#]);
        let plan = planner(mock, 10).create_plan(&ctx()).await;
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].id, "a");
        assert_eq!(plan[0].step_type, StepType::Reasoning);
        assert_eq!(plan[1].id, "step_2");
        assert_eq!(plan[1].step_type, StepType::Action);
        // "ghost" 丢弃，"1" 解析为 a 后去重
        assert_eq!(plan[1].dependencies, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_generated_ids_never_collide_with_explicit_ids() {
        let mock = MockReasoningService::with_responses([r#"[
  {"id": "step_2", "description": "a"},
  {"description": "b"},
  {"description": "c", "dependencies": ["step_2"]},
  {"id": "step_2", "description": "d"}
]"#]);
        let plan = planner(mock, 10).create_plan(&ctx()).await;
        let ids: Vec<&str> = plan.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["step_2", "step_3", "step_4", "step_5"]);
        let unique: HashSet<&str> = ids.iter().copied().collect();
        assert_eq!(unique.len(), ids.len());
        // 依赖指向显式声明 step_2 的第一步
        assert_eq!(plan[2].dependencies, vec!["step_2".to_string()]);
        assert_eq!(plan[2].description, "c");
    }

    #[tokio::test]
    async fn test_bare_array_truncated_to_max_steps() {
        let mock = MockReasoningService::with_responses([
            r#"[{"description": "one"}, {"description": "two"}, {"description": "three"}]"#,
        ]);
        let plan = planner(mock, 2).create_plan(&ctx()).await;
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1].description, "two");
    }

    #[tokio::test]
    async fn test_failures_fall_back_to_default_plan() {
        let mock = MockReasoningService::new();
        mock.push_error(LlmError::Timeout);
        mock.push_response("no json here");
        mock.push_response(r#"{"steps": []}"#);
        let p = planner(mock, 10);

        for _ in 0..3 {
            let plan = p.create_plan(&ctx()).await;
            assert_eq!(plan.len(), 3);
            assert_eq!(plan[2].dependencies, vec!["step_2".to_string()]);
        }
    }

    #[tokio::test]
    async fn test_empty_plan_is_planning_error() {
        let mock = MockReasoningService::with_responses([r#"{"steps": [{"description": "  "}]}"#]);
        let err = planner(mock, 10).try_plan(&ctx()).await.unwrap_err();
        assert!(matches!(err, AgentError::Planning(_)));
    }
}
