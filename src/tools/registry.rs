//! 工具目录与注册表
//!
//! ToolCatalog 是引擎消费的外部接口（list_tools / invoke）；ToolRegistry 是其默认实现：
//! 所有工具实现 Tool trait（name / description / parameters_schema / execute），按名注册与查找。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// 目录中一个工具的描述（供 LLM 选择工具与生成参数）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// 工具返回：output 为任意 JSON；error 为工具自报的软错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub output: Value,
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn ok(output: impl Into<Value>) -> Self {
        Self {
            output: output.into(),
            error: None,
        }
    }
}

/// 单次调用失败（工具不存在、执行异常、超时）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("{0}")]
    Failed(String),
    #[error("Tool timeout: {0}")]
    Timeout(String),
}

/// 工具目录：只读单例，每次 invoke 相互独立
#[async_trait]
pub trait ToolCatalog: Send + Sync {
    async fn list_tools(&self) -> Vec<ToolSpec>;

    async fn invoke(&self, name: &str, input: Value) -> Result<ToolOutput, ToolError>;
}

/// 工具 trait：名称、描述、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// 默认返回空对象，表示无参数或参数格式不限
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 按名称有序存储，list_tools 输出稳定
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }
}

#[async_trait]
impl ToolCatalog for ToolRegistry {
    async fn list_tools(&self) -> Vec<ToolSpec> {
        self.tools
            .values()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.parameters_schema(),
            })
            .collect()
    }

    async fn invoke(&self, name: &str, input: Value) -> Result<ToolOutput, ToolError> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let text = tool.execute(input).await.map_err(ToolError::Failed)?;
        Ok(ToolOutput::ok(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;

    #[tokio::test]
    async fn test_list_and_invoke() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);

        let specs = registry.list_tools().await;
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].name, "echo");
        assert_eq!(specs[0].input_schema["required"][0], "text");

        let out = registry
            .invoke("echo", serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(out.output, Value::String("hi".into()));
        assert!(out.error.is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let registry = ToolRegistry::new();
        let err = registry.invoke("nope", Value::Null).await.unwrap_err();
        assert_eq!(err, ToolError::UnknownTool("nope".into()));
    }
}
