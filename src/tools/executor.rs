//! 工具执行器
//!
//! 持有 ToolCatalog 与单次调用超时，invoke(tool_name, input) 在独立任务中计时并在超时内调用目录，
//! 结果统一为 ToolCallResult（失败不抛出，记录在 success/error 上）；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::AbortHandle;
use tokio::time::timeout;

use crate::react::types::{ToolCallMetadata, ToolCallResult};
use crate::tools::{ToolCatalog, ToolError, ToolSpec};

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct ToolExecutor {
    catalog: Arc<dyn ToolCatalog>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(catalog: Arc<dyn ToolCatalog>, timeout_secs: u64) -> Self {
        Self {
            catalog,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    pub async fn list_tools(&self) -> Vec<ToolSpec> {
        self.catalog.list_tools().await
    }

    /// 执行一次调用；超时为 ToolError::Timeout，工具自报 error 也记为失败
    pub async fn invoke(
        &self,
        tool_name: &str,
        input: Value,
        metadata: ToolCallMetadata,
    ) -> ToolCallResult {
        let start = Instant::now();
        let args_preview = args_preview(&input);
        // 独立任务中执行：工具 panic 只影响本次调用
        let catalog = self.catalog.clone();
        let name = tool_name.to_string();
        let args = input.clone();
        let task = tokio::spawn(async move { catalog.invoke(&name, args).await });
        // 超时或调用方被取消时一并中止工具任务
        let _guard = AbortOnDrop(task.abort_handle());
        let result = match timeout(self.timeout, task).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => Err(ToolError::Failed(format!("tool {tool_name} crashed: {e}"))),
            Err(_) => Err(ToolError::Timeout(tool_name.to_string())),
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        let (output, error) = match result {
            Ok(out) => (out.output, out.error),
            Err(e) => (Value::Null, Some(e.to_string())),
        };
        let success = error.is_none();

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": success,
            "retry": metadata.retry_count,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        ToolCallResult {
            tool_name: tool_name.to_string(),
            input,
            output,
            success,
            error,
            execution_time_ms: duration_ms,
            metadata,
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
