//! 推理服务抽象
//!
//! 所有后端（OpenAI 兼容 / Mock）实现 ReasoningService：generate_text(prompt, options) 返回原始文本，
//! 结构化内容由调用方通过 react::decode 容错提取。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 推理服务调用失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("request timed out")]
    Timeout,

    #[error("empty response")]
    EmptyResponse,
}

/// 单次生成参数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    /// 为空时使用后端默认模型
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.3,
            max_tokens: 2048,
            system_prompt: None,
        }
    }
}

impl GenerationOptions {
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// 推理服务 trait：只读单例，注入每个阶段引擎
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn generate_text(
        &self,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
