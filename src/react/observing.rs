//! ObservingPhase：对照预期结果解释工具输出
//!
//! 推理服务给出 observations / insights / implications / nextSteps / issues；
//! 另外总是在本地计算执行统计、关键发现与改进建议。推理服务不可用时返回只含本地统计的 fallback，置信度固定 0.3。

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;

use crate::config::AgentConfigPatch;
use crate::core::AgentError;
use crate::llm::{GenerationOptions, ReasoningService};
use crate::react::acting::execution_stats;
use crate::react::decode::decode_payload;
use crate::react::prompts;
use crate::react::types::{
    clamp_confidence, ExecutionContext, ExecutionStats, IssueSeverity, ObservationResult, ObservedIssue,
    ToolCallResult,
};

pub const FALLBACK_CONFIDENCE: f64 = 0.3;

/// 超过该耗时的调用触发并行化建议
const SLOW_CALL_MS: u64 = 5_000;

const OBSERVING_SYSTEM_PROMPT: &str = "You are the observing module of an autonomous task agent. \
Interpret the tool results against the expected outcome. Respond with JSON only: \
{\"observations\": [\"...\"], \"insights\": [], \"implications\": [], \"nextSteps\": [], \
\"issues\": [{\"description\": \"...\", \"severity\": \"low|medium|high\", \"suggestion\": \"...\"}], \"confidence\": 0.8}";

fn default_severity() -> IssueSeverity {
    IssueSeverity::Medium
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    description: String,
    #[serde(default = "default_severity")]
    severity: IssueSeverity,
    #[serde(default)]
    suggestion: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObservationPayload {
    observations: Vec<String>,
    #[serde(default)]
    insights: Vec<String>,
    #[serde(default)]
    implications: Vec<String>,
    #[serde(default)]
    next_steps: Vec<String>,
    #[serde(default)]
    issues: Vec<IssuePayload>,
    confidence: f64,
}

pub struct ObservingPhase {
    llm: Arc<dyn ReasoningService>,
    options: GenerationOptions,
}

impl ObservingPhase {
    pub fn new(llm: Arc<dyn ReasoningService>, options: GenerationOptions) -> Self {
        Self {
            llm,
            options: options.with_system_prompt(OBSERVING_SYSTEM_PROMPT),
        }
    }

    pub fn apply_patch(&mut self, patch: &AgentConfigPatch) {
        patch.apply_to_options(&mut self.options);
    }

    pub async fn observe(
        &self,
        results: &[ToolCallResult],
        expected_outcome: &str,
        ctx: &ExecutionContext,
    ) -> ObservationResult {
        match self.try_observe(results, expected_outcome, ctx).await {
            Ok(o) => o,
            Err(e) => {
                tracing::warn!(error = %e, "observation failed, using local statistics");
                fallback(results)
            }
        }
    }

    pub async fn try_observe(
        &self,
        results: &[ToolCallResult],
        expected_outcome: &str,
        ctx: &ExecutionContext,
    ) -> Result<ObservationResult, AgentError> {
        let prompt = format!(
            "## Goal\n{}\n\n## Expected outcome\n{}\n\n{}",
            ctx.goal,
            expected_outcome,
            prompts::tool_results_section(results)
        );
        let text = self.llm.generate_text(&prompt, &self.options).await?;
        let payload: ObservationPayload = decode_payload(&text)?;
        let observations: Vec<String> = payload
            .observations
            .into_iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();
        if observations.is_empty() {
            return Err(AgentError::Validation("observations must not be empty".to_string()));
        }

        let issues: Vec<ObservedIssue> = payload
            .issues
            .into_iter()
            .map(|i| ObservedIssue {
                description: i.description,
                severity: i.severity,
                suggestion: i.suggestion.filter(|s| !s.trim().is_empty()),
            })
            .collect();
        let statistics = execution_stats(results);
        let suggestions = suggestions(results, &issues);

        Ok(ObservationResult {
            observations,
            insights: payload.insights,
            implications: payload.implications,
            next_steps: payload.next_steps,
            issues,
            confidence: clamp_confidence(payload.confidence),
            key_findings: key_findings(results, &statistics),
            statistics,
            suggestions,
            is_fallback: false,
        })
    }
}

/// 只用本地统计构造的观察结果
pub fn fallback(results: &[ToolCallResult]) -> ObservationResult {
    let statistics = execution_stats(results);
    let issues: Vec<ObservedIssue> = results
        .iter()
        .filter(|r| !r.success)
        .map(|r| ObservedIssue {
            description: format!(
                "{} failed: {}",
                r.tool_name,
                r.error.as_deref().unwrap_or("unknown error")
            ),
            severity: IssueSeverity::Medium,
            suggestion: None,
        })
        .collect();
    let observations = vec![format!(
        "Executed {} tool call(s): {} succeeded, {} failed",
        statistics.total, statistics.succeeded, statistics.failed
    )];
    ObservationResult {
        observations,
        insights: Vec::new(),
        implications: Vec::new(),
        next_steps: Vec::new(),
        suggestions: suggestions(results, &issues),
        key_findings: key_findings(results, &statistics),
        issues,
        confidence: FALLBACK_CONFIDENCE,
        statistics,
        is_fallback: true,
    }
}

fn key_findings(results: &[ToolCallResult], stats: &ExecutionStats) -> Vec<String> {
    if results.is_empty() {
        return vec!["No tool calls were executed".to_string()];
    }
    let mut findings = Vec::new();
    let tools = dedup(results.iter().map(|r| r.tool_name.clone()));
    findings.push(format!("Tools used: {}", tools.join(", ")));

    let failures: Vec<&str> = results
        .iter()
        .filter(|r| !r.success)
        .map(|r| error_category(r.error.as_deref().unwrap_or("")))
        .collect();
    if !failures.is_empty() {
        let mut best = ("other", 0usize);
        for cat in ERROR_CATEGORIES {
            let n = failures.iter().filter(|c| **c == cat).count();
            if n > best.1 {
                best = (cat, n);
            }
        }
        findings.push(format!(
            "Dominant error type: {} ({} of {} failures)",
            best.0,
            best.1,
            failures.len()
        ));
    }
    findings.push(format!("Average latency: {:.0} ms", stats.average_duration_ms));
    findings
}

const ERROR_CATEGORIES: [&str; 5] = ["timeout", "not found", "permission", "invalid input", "other"];

fn error_category(error: &str) -> &'static str {
    let e = error.to_lowercase();
    if e.contains("timeout") || e.contains("timed out") {
        "timeout"
    } else if e.contains("not found") || e.contains("unknown tool") || e.contains("no such") {
        "not found"
    } else if e.contains("permission") || e.contains("denied") || e.contains("forbidden") {
        "permission"
    } else if e.contains("invalid") || e.contains("missing") || e.contains("required") {
        "invalid input"
    } else {
        "other"
    }
}

fn suggestions(results: &[ToolCallResult], issues: &[ObservedIssue]) -> Vec<String> {
    let mut out = Vec::new();
    if results.iter().any(|r| !r.success) {
        out.push("Retry the failed tool calls or adjust their input".to_string());
    }
    if results.iter().any(|r| r.execution_time_ms > SLOW_CALL_MS) {
        out.push("Consider parallelizing or splitting slow tool calls".to_string());
    }
    out.extend(issues.iter().filter_map(|i| i.suggestion.clone()));
    dedup(out)
}

/// 保序去重
fn dedup(items: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items.into_iter().filter(|s| seen.insert(s.clone())).collect()
}

/// 合并多个观察：字符串去重、置信度取均值、统计按调用数加权合并
pub fn merge_observation_results(list: &[ObservationResult]) -> ObservationResult {
    let confidence = if list.is_empty() {
        0.0
    } else {
        clamp_confidence(list.iter().map(|o| o.confidence).sum::<f64>() / list.len() as f64)
    };
    ObservationResult {
        observations: dedup(list.iter().flat_map(|o| o.observations.clone())),
        insights: dedup(list.iter().flat_map(|o| o.insights.clone())),
        implications: dedup(list.iter().flat_map(|o| o.implications.clone())),
        next_steps: dedup(list.iter().flat_map(|o| o.next_steps.clone())),
        issues: list.iter().flat_map(|o| o.issues.clone()).collect(),
        confidence,
        statistics: merge_stats(list.iter().map(|o| &o.statistics)),
        key_findings: dedup(list.iter().flat_map(|o| o.key_findings.clone())),
        suggestions: dedup(list.iter().flat_map(|o| o.suggestions.clone())),
        is_fallback: !list.is_empty() && list.iter().all(|o| o.is_fallback),
    }
}

fn merge_stats<'a>(stats: impl Iterator<Item = &'a ExecutionStats>) -> ExecutionStats {
    let mut merged = ExecutionStats::default();
    let mut total_ms = 0.0;
    for s in stats {
        merged.total += s.total;
        merged.succeeded += s.succeeded;
        merged.failed += s.failed;
        total_ms += s.average_duration_ms * s.total as f64;
        if let Some(f) = &s.fastest {
            if merged.fastest.as_ref().map_or(true, |m| f.1 < m.1) {
                merged.fastest = Some(f.clone());
            }
        }
        if let Some(f) = &s.slowest {
            if merged.slowest.as_ref().map_or(true, |m| f.1 > m.1) {
                merged.slowest = Some(f.clone());
            }
        }
    }
    if merged.total > 0 {
        merged.success_rate = merged.succeeded as f64 / merged.total as f64;
        merged.average_duration_ms = total_ms / merged.total as f64;
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    use crate::llm::MockReasoningService;
    use crate::react::types::ToolCallMetadata;

    fn call(name: &str, error: Option<&str>, ms: u64) -> ToolCallResult {
        ToolCallResult {
            tool_name: name.into(),
            input: Value::Null,
            output: Value::String("out".into()),
            success: error.is_none(),
            error: error.map(String::from),
            execution_time_ms: ms,
            metadata: ToolCallMetadata::default(),
        }
    }

    fn phase(mock: MockReasoningService) -> ObservingPhase {
        ObservingPhase::new(Arc::new(mock), GenerationOptions::default())
    }

    #[tokio::test]
    async fn test_observation_with_local_statistics() {
        let mock = MockReasoningService::with_responses([r#"{"observations": ["two files listed", ""],
            "insights": ["workspace is small"],
            "issues": [{"description": "one call timed out", "suggestion": "raise the timeout"}],
            "confidence": 0.7}"#]);
        let results = vec![
            call("ls", None, 10),
            call("cat", Some("Tool timeout: cat"), 6_000),
        ];
        let o = phase(mock)
            .observe(&results, "file list", &ExecutionContext::new("t", "g"))
            .await;
        assert!(!o.is_fallback);
        assert_eq!(o.observations, vec!["two files listed"]);
        assert_eq!(o.issues[0].severity, IssueSeverity::Medium);
        assert_eq!(o.statistics.total, 2);
        assert_eq!(o.statistics.slowest, Some(("cat".to_string(), 6_000)));
        assert_eq!(o.key_findings[0], "Tools used: ls, cat");
        assert!(o.key_findings[1].starts_with("Dominant error type: timeout"));
        assert_eq!(o.suggestions.len(), 3);
        assert!(o.suggestions.contains(&"raise the timeout".to_string()));
    }

    #[tokio::test]
    async fn test_empty_observations_fall_back() {
        let mock = MockReasoningService::with_responses([r#"{"observations": [], "confidence": 0.9}"#]);
        let results = vec![call("ls", None, 3), call("rm", Some("permission denied"), 4)];
        let o = phase(mock)
            .observe(&results, "x", &ExecutionContext::new("t", "g"))
            .await;
        assert!(o.is_fallback);
        assert_eq!(o.confidence, FALLBACK_CONFIDENCE);
        assert_eq!(o.statistics.failed, 1);
        assert_eq!(o.issues.len(), 1);
        assert!(o.key_findings.iter().any(|f| f.contains("permission")));
    }

    #[test]
    fn test_merge_dedups_and_averages() {
        let mut a = fallback(&[call("ls", None, 10)]);
        a.confidence = 0.8;
        a.insights = vec!["x".into(), "y".into()];
        let mut b = fallback(&[call("ls", None, 30), call("cat", Some("boom"), 50)]);
        b.confidence = 0.4;
        b.insights = vec!["y".into(), "z".into()];
        b.is_fallback = false;

        let m = merge_observation_results(&[a, b]);
        assert_eq!(m.insights, vec!["x", "y", "z"]);
        assert!((m.confidence - 0.6).abs() < 1e-9);
        assert_eq!(m.statistics.total, 3);
        assert_eq!(m.statistics.fastest, Some(("ls".to_string(), 10)));
        assert_eq!(m.statistics.slowest, Some(("cat".to_string(), 50)));
        assert!((m.statistics.average_duration_ms - 30.0).abs() < 1e-9);
        assert!(!m.is_fallback);
        assert_eq!(merge_observation_results(&[]).confidence, 0.0);
    }
}
