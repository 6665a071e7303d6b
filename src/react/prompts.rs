//! 各阶段 prompt 的公共片段：任务上下文、工具目录、最近历史

use crate::react::types::{ExecutionContext, HistoryEntry, ToolCallResult};
use crate::tools::ToolSpec;

/// 单个工具输出 / 观察在 prompt 中的最大字符数
const PREVIEW_CHARS: usize = 400;

pub fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        format!("{}...", text.chars().take(PREVIEW_CHARS).collect::<String>())
    } else {
        text.to_string()
    }
}

pub fn context_section(ctx: &ExecutionContext) -> String {
    let mut out = format!("## Task\n{}\n\n## Goal\n{}\n", ctx.task, ctx.goal);
    if !ctx.constraints.is_empty() {
        out.push_str("\n## Constraints\n");
        for c in &ctx.constraints {
            out.push_str(&format!("- {c}\n"));
        }
    }
    if !ctx.memory.is_empty() {
        out.push_str("\n## Relevant Past Knowledge\n");
        for m in &ctx.memory {
            out.push_str(&format!("- {}\n", preview(m)));
        }
    }
    if !ctx.conversation.is_empty() {
        out.push_str("\n## Conversation\n");
        for m in &ctx.conversation {
            out.push_str(&format!("{:?}: {}\n", m.role, preview(&m.content)));
        }
    }
    out
}

pub fn tools_section(tools: &[ToolSpec]) -> String {
    if tools.is_empty() {
        return "## Available tools\n(none)\n".to_string();
    }
    let mut out = String::from("## Available tools\n");
    for t in tools {
        out.push_str(&format!("- {}: {} | input schema: {}\n", t.name, t.description, t.input_schema));
    }
    out
}

pub fn history_section(history: &[HistoryEntry]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let mut out = String::from("## Recent steps\n");
    for h in history {
        let first_observation = h.observation.observations.first().map(String::as_str).unwrap_or("-");
        out.push_str(&format!(
            "- {} | action: {} | success: {} | observed: {}\n",
            h.step_id,
            h.reasoning.next_action,
            h.success,
            preview(first_observation)
        ));
    }
    out
}

pub fn tool_results_section(results: &[ToolCallResult]) -> String {
    let mut out = String::from("## Tool results\n");
    for (i, r) in results.iter().enumerate() {
        let body = match &r.error {
            Some(e) => format!("ERROR: {e}"),
            None => preview(&r.output.to_string()),
        };
        out.push_str(&format!(
            "{}. {} ({} ms, success: {}): {}\n",
            i + 1,
            r.tool_name,
            r.execution_time_ms,
            r.success,
            body
        ));
    }
    out
}
