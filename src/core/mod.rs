//! 核心编排层：错误、状态、会话监管、会话管理

pub mod error;
pub mod session_manager;
pub mod session_supervisor;
pub mod state;

pub use error::{AgentError, ErrorKind, ErrorReport};
pub use session_manager::{Session, SessionHandle, SessionManager, SessionStats, SessionStatus};
pub use session_supervisor::{EngineControl, SessionSupervisor};
pub use state::{AgentState, AgentStatus};
