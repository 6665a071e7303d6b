//! LLM 层：推理服务抽象与实现（OpenAI 兼容 / Mock）

pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;

pub use mock::MockReasoningService;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{GenerationOptions, LlmError, ReasoningService};

use crate::config::LlmSection;

/// 根据配置与环境变量选择推理后端（OpenAI 兼容 / Mock）
pub fn create_reasoning_from_config(cfg: &LlmSection) -> Arc<dyn ReasoningService> {
    let provider = cfg.provider.to_lowercase();
    let api_key = match provider.as_str() {
        "deepseek" => std::env::var("DEEPSEEK_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok(),
        "mock" => None,
        _ => std::env::var("OPENAI_API_KEY").ok(),
    };

    match api_key {
        Some(key) => {
            let base = cfg.base_url.clone().or_else(|| {
                (provider == "deepseek").then(|| "https://api.deepseek.com/v1".to_string())
            });
            tracing::info!("Using {} reasoning service ({})", provider, cfg.model);
            Arc::new(OpenAiClient::new(base.as_deref(), &cfg.model, Some(&key)))
        }
        None => {
            tracing::warn!("No API key set or provider is mock, using Mock reasoning service");
            Arc::new(MockReasoningService::new())
        }
    }
}
