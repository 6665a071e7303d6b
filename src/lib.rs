//! Autopilot - 自主任务执行 Agent
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误、AgentState、会话监管与 SessionManager
//! - **llm**: 推理服务抽象与实现（OpenAI 兼容 / Mock）
//! - **memory**: 相关记忆检索与对话存储
//! - **observability**: tracing 初始化
//! - **react**: Planner、ReAct 各阶段与 AgentEngine
//! - **tools**: 工具目录、注册表与执行器

pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{AgentError, SessionManager};
pub use crate::react::{AgentEngine, ExecutionResult};
