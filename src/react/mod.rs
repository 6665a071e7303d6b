//! 执行层：Planner、推理 / 动作 / 观察 / 反思阶段、结果汇总与 AgentEngine 状态机

pub mod acting;
pub mod decode;
pub mod engine;
pub mod events;
pub mod observing;
pub mod planner;
pub mod prompts;
pub mod reasoning;
pub mod reflection;
pub mod synthesizer;
pub mod types;

pub use acting::{execution_stats, ActingPhase};
pub use decode::{decode_payload, DecodeError};
pub use engine::AgentEngine;
pub use events::{BufferedSink, ChannelSink, NoopSink, ProgressEvent, ProgressEventType, ProgressSink, SessionEvent};
pub use observing::{merge_observation_results, ObservingPhase};
pub use planner::{default_plan, Planner};
pub use reasoning::ReasoningPhase;
pub use reflection::{Reflection, ReflectionPhase};
pub use synthesizer::ResultSynthesizer;
pub use types::{
    Conclusion, ExecutionContext, ExecutionResult, ExecutionStats, HistoryEntry, ObservationResult,
    ReasoningResult, Step, StepStatus, StepType, Thought, ThoughtType, ToolCallResult,
};
