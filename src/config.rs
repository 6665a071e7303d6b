//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `AUTOPILOT__*` 覆盖（双下划线表示嵌套，如 `AUTOPILOT__AGENT__MAX_RETRIES=5`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::AgentError;
use crate::llm::GenerationOptions;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub session: SessionSection,
}

/// [agent] 段：执行引擎参数；每个引擎在构造时复制一份
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// 计划最多步数
    pub max_steps: usize,
    /// 运行级错误计数超过该值即失败
    pub max_retries: u32,
    /// 推理置信度达到该值才执行动作，否则跳过该步
    pub confidence_threshold: f64,
    pub enable_reflection: bool,
    /// 推理阶段可见的最近历史条数
    pub history_window: usize,
    /// 工具失败后的额外重试次数（0 表示不重试）
    pub tool_retry_limit: u32,
    /// 是否向推理服务请求结构化结论
    pub enable_conclusion: bool,
    /// 由 SessionManager 竞速执行；引擎本身不自行超时
    pub timeout_secs: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            max_retries: 3,
            confidence_threshold: 0.6,
            enable_reflection: true,
            history_window: 5,
            tool_retry_limit: 0,
            enable_conclusion: true,
            timeout_secs: None,
        }
    }
}

/// 部分更新：仅 Some 字段生效
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentConfigPatch {
    pub max_retries: Option<u32>,
    pub confidence_threshold: Option<f64>,
    pub enable_reflection: Option<bool>,
    pub history_window: Option<usize>,
    pub tool_retry_limit: Option<u32>,
    pub enable_conclusion: Option<bool>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

impl AgentConfig {
    pub fn apply(&mut self, patch: &AgentConfigPatch) {
        if let Some(v) = patch.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = patch.confidence_threshold {
            self.confidence_threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = patch.enable_reflection {
            self.enable_reflection = v;
        }
        if let Some(v) = patch.history_window {
            self.history_window = v;
        }
        if let Some(v) = patch.tool_retry_limit {
            self.tool_retry_limit = v;
        }
        if let Some(v) = patch.enable_conclusion {
            self.enable_conclusion = v;
        }
    }
}

impl AgentConfigPatch {
    pub fn apply_to_options(&self, options: &mut GenerationOptions) {
        if let Some(ref m) = self.model {
            options.model = Some(m.clone());
        }
        if let Some(t) = self.temperature {
            options.temperature = t;
        }
        if let Some(n) = self.max_tokens {
            options.max_tokens = n;
        }
    }
}

/// [llm] 段：后端选择与生成参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：openai / deepseek / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            temperature: 0.3,
            max_tokens: 2048,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self { tool_timeout_secs: 30 }
    }
}

/// [session] 段：构建 ExecutionContext 时使用
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// 对话摘录保留的最近消息条数
    pub conversation_excerpt_len: usize,
    /// 相关记忆检索条数
    pub memory_snippets: usize,
    /// 注入每个任务的全局约束
    pub constraints: Vec<String>,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            conversation_excerpt_len: 10,
            memory_snippets: 5,
            constraints: Vec::new(),
        }
    }
}

impl LlmSection {
    pub fn generation_options(&self) -> GenerationOptions {
        GenerationOptions {
            model: Some(self.model.clone()),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            system_prompt: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 AUTOPILOT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 AUTOPILOT__*
///
/// 读取或反序列化失败统一为 AgentError::ConfigError
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, AgentError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default"] {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("AUTOPILOT")
            .separator("__")
            .try_parsing(true),
    );

    builder
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| AgentError::ConfigError(e.to_string()))
}
