//! Mock 推理服务（用于测试与无 API Key 场景）
//!
//! 按调用顺序依次弹出预置响应；队列耗尽后返回 LlmError::EmptyResponse，
//! 使各阶段走本地 fallback。所有 prompt 被记录下来供断言。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{GenerationOptions, LlmError, ReasoningService};

/// 脚本化 Mock：引擎单会话严格串行，调用顺序即脚本顺序
#[derive(Debug, Default)]
pub struct MockReasoningService {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
    prompts: Mutex<Vec<String>>,
}

impl MockReasoningService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new();
        for r in responses {
            mock.push_response(r);
        }
        mock
    }

    pub fn push_response(&self, text: impl Into<String>) {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(Ok(text.into()));
        }
    }

    pub fn push_error(&self, err: LlmError) {
        if let Ok(mut q) = self.responses.lock() {
            q.push_back(Err(err));
        }
    }

    /// 已收到的 prompt（按调用顺序）
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl ReasoningService for MockReasoningService {
    async fn generate_text(
        &self,
        prompt: &str,
        _options: &GenerationOptions,
    ) -> Result<String, LlmError> {
        if let Ok(mut p) = self.prompts.lock() {
            p.push(prompt.to_string());
        }
        self.responses
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .unwrap_or(Err(LlmError::EmptyResponse))
    }
}
